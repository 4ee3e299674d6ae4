//! A framed, bidirectional connection to one peer.
//!
//! [`Connection`] owns the read half and is driven by exactly one session.
//! [`ConnectionHandle`] is the cloneable write side shared by the session,
//! the heartbeat driver and application code.

use crate::error::{ConnectionError, Error, Result};
use crate::protocol::{Envelope, EnvelopeCodec, Inbound, Message};

use futures::{FutureExt, SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tether_transport::BoxedStream;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Reader = FramedRead<ReadHalf<BoxedStream>, EnvelopeCodec>;
type Writer = FramedWrite<WriteHalf<BoxedStream>, EnvelopeCodec>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Reads and writes are allowed.
    Open = 0,
    /// Close has started; new operations fail.
    Closing = 1,
    /// The stream has been released.
    Closed = 2,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

struct Core {
    id: ConnectionId,
    peer: String,
    epoch: Instant,
    // Microseconds since `epoch`
    last_send: AtomicU64,
    last_receive: AtomicU64,
    state: AtomicU8,
    writer: Mutex<Option<Writer>>,
    closed: CancellationToken,
}

impl Core {
    fn stamp(&self, slot: &AtomicU64) {
        let micros = u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX);
        slot.fetch_max(micros, Ordering::Relaxed);
    }

    fn instant(&self, slot: &AtomicU64) -> Instant {
        self.epoch + Duration::from_micros(slot.load(Ordering::Relaxed))
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Cloneable handle for sending on and closing a connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    core: Arc<Core>,
}

impl ConnectionHandle {
    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.core.id
    }

    /// Human-readable peer address.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.core.peer
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// When a message was last written. Starts at creation time.
    #[must_use]
    pub fn last_send(&self) -> Instant {
        self.core.instant(&self.core.last_send)
    }

    /// When a message was last received. Starts at creation time.
    #[must_use]
    pub fn last_receive(&self) -> Instant {
        self.core.instant(&self.core.last_receive)
    }

    /// Time since the last send.
    #[must_use]
    pub fn send_idle(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_send())
    }

    /// Time since the last receive.
    #[must_use]
    pub fn receive_idle(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_receive())
    }

    /// Write one envelope and flush it.
    ///
    /// Concurrent senders are serialized, so frames never interleave. A
    /// transport failure closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the connection is not open,
    /// [`Error::Malformed`] if the envelope cannot be framed, or
    /// [`Error::Transport`] if the write fails.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.is_open() {
            return Err(ConnectionError::Closed.into());
        }

        let result = {
            let mut guard = tokio::select! {
                biased;
                () = self.core.closed.cancelled() => return Err(ConnectionError::Closed.into()),
                guard = self.core.writer.lock() => guard,
            };
            let Some(writer) = guard.as_mut() else {
                return Err(ConnectionError::Closed.into());
            };

            let result = tokio::select! {
                biased;
                () = self.core.closed.cancelled() => Err(ConnectionError::Closed.into()),
                result = writer.send(envelope) => result,
            };
            if result.is_ok() {
                self.core.stamp(&self.core.last_send);
            }
            result
        };

        match result {
            Ok(()) => {
                debug!(connection = %self.core.id, message_type = envelope.message_type(), "Sent");
                Ok(())
            }
            // Nothing reached the wire
            Err(e @ Error::Malformed(_)) => Err(e),
            Err(e) => {
                if !matches!(e, Error::Connection(_)) {
                    warn!(connection = %self.core.id, "Send failed: {e}");
                }
                self.close().await;
                Err(e)
            }
        }
    }

    /// Seal and send a typed message.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_message<M: Message>(&self, message: &M) -> Result<()> {
        self.send(&Envelope::seal(message)?).await
    }

    /// Close the connection.
    ///
    /// Returns `true` for the call that performed the close and `false` if
    /// it was already closing or closed.
    pub async fn close(&self) -> bool {
        if self
            .core
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        // Wakes pending senders so the writer lock frees up
        self.core.closed.cancel();

        let writer = self.core.writer.lock().await.take();
        if let Some(writer) = writer {
            let mut inner = writer.into_inner();
            if let Err(e) = inner.shutdown().await {
                debug!(connection = %self.core.id, "Shutdown error: {e}");
            }
        }

        self.core
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        info!(connection = %self.core.id, peer = %self.core.peer, "Connection closed");
        true
    }

    /// Resolves once the connection starts closing.
    pub async fn closed(&self) {
        self.core.closed.cancelled().await;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.core.id)
            .field("peer", &self.core.peer)
            .field("state", &self.core.state())
            .finish()
    }
}

/// The receiving side of a connection.
pub struct Connection {
    reader: Reader,
    handle: ConnectionHandle,
}

impl Connection {
    /// Wrap an established stream.
    pub fn new(stream: BoxedStream, peer: impl Into<String>, max_frame_size: usize) -> Self {
        let codec = EnvelopeCodec::new().with_max_frame_size(max_frame_size);
        let (read_half, write_half) = tokio::io::split(stream);

        let core = Core {
            id: ConnectionId::next(),
            peer: peer.into(),
            epoch: Instant::now(),
            last_send: AtomicU64::new(0),
            last_receive: AtomicU64::new(0),
            state: AtomicU8::new(ConnectionState::Open as u8),
            writer: Mutex::new(Some(FramedWrite::new(write_half, codec.clone()))),
            closed: CancellationToken::new(),
        };

        debug!(connection = %core.id, peer = %core.peer, "Connection opened");

        Self {
            reader: FramedRead::new(read_half, codec),
            handle: ConnectionHandle {
                core: Arc::new(core),
            },
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// The shared write side.
    #[must_use]
    pub const fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Wait for the next message.
    ///
    /// Frames with corrupt bodies are logged and skipped. Returns `Ok(None)`
    /// when the peer closes the stream. Cancel safe.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the connection is not open,
    /// or the read error that ended the stream.
    pub async fn receive(&mut self) -> Result<Option<Envelope>> {
        loop {
            if !self.handle.is_open() {
                return Err(ConnectionError::Closed.into());
            }

            match self.reader.next().await {
                Some(Ok(Inbound::Message(envelope))) => {
                    let core = &self.handle.core;
                    core.stamp(&core.last_receive);
                    debug!(
                        connection = %core.id,
                        message_type = envelope.message_type(),
                        "Received"
                    );
                    return Ok(Some(envelope));
                }
                Some(Ok(Inbound::Corrupt(e))) => {
                    warn!(connection = %self.handle.core.id, "Dropping corrupt frame: {e}");
                }
                Some(Err(e)) => return Err(e),
                None => {
                    debug!(connection = %self.handle.core.id, "Peer closed the stream");
                    return Ok(None);
                }
            }
        }
    }

    /// Receive without waiting.
    ///
    /// Returns `Ok(None)` if no complete message is buffered yet.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::PeerClosed`] if the peer has closed the
    /// stream, otherwise as [`receive`](Self::receive).
    pub fn try_receive(&mut self) -> Result<Option<Envelope>> {
        match self.receive().now_or_never() {
            None => Ok(None),
            Some(Ok(Some(envelope))) => Ok(Some(envelope)),
            Some(Ok(None)) => Err(ConnectionError::PeerClosed.into()),
            Some(Err(e)) => Err(e),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
