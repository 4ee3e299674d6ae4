//! Per-connection read/dispatch loop.
//!
//! One session owns one [`Connection`]. It reads messages, routes them
//! through the [`ActionRegistry`], sends server-side replies and enforces
//! the receive timeout. The connection is always closed when the loop ends.

use crate::config::{HandlerErrorPolicy, SessionConfig};
use crate::connection::{Connection, ConnectionHandle};
use crate::error::{ConnectionError, Error, HandlerError, Result};
use crate::protocol::Envelope;
use crate::registry::{ActionRegistry, Context};
use crate::role::Role;

use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Why a session ended.
#[derive(Debug)]
pub enum StopReason {
    /// The owning role is shutting down.
    Shutdown,
    /// The connection was closed locally.
    Closed,
    /// The peer closed the stream.
    PeerClosed,
    /// Nothing was received within the receive timeout.
    IdleTimeout,
    /// A transport, framing or handler error ended the session.
    Failed(Error),
}

impl StopReason {
    fn from_error(err: Error) -> Self {
        match err {
            Error::Connection(ConnectionError::Closed) => Self::Closed,
            Error::Connection(ConnectionError::PeerClosed) => Self::PeerClosed,
            other => Self::Failed(other),
        }
    }

    /// Whether the session ended because of an error.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

enum Event {
    Stop(StopReason),
    Received(Result<Option<Envelope>>),
}

/// Drives one connection until it ends.
#[derive(Debug)]
pub struct Session {
    connection: Connection,
    registry: ActionRegistry,
    role: Role,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl Session {
    /// Create a session. Cancelling `shutdown` ends it.
    #[must_use]
    pub const fn new(
        connection: Connection,
        registry: ActionRegistry,
        role: Role,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connection,
            registry,
            role,
            config,
            shutdown,
        }
    }

    /// The connection's shared handle.
    #[must_use]
    pub const fn handle(&self) -> &ConnectionHandle {
        self.connection.handle()
    }

    /// Run until shutdown, close, timeout or a fatal error.
    #[instrument(skip(self), fields(connection = %self.connection.id(), role = %self.role))]
    pub async fn run(mut self) -> StopReason {
        let handle = self.connection.handle().clone();
        let ctx = Context::new(self.role, handle.clone(), self.registry.clone());
        let receive_timeout = self.config.receive_timeout;
        let poll_interval = self.config.poll_interval;
        let policy = self.config.handler_error_policy;

        debug!(peer = handle.peer(), "Session started");

        let reason = loop {
            let event = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => Event::Stop(StopReason::Shutdown),
                () = handle.closed() => Event::Stop(StopReason::Closed),
                () = idle_deadline(&handle, receive_timeout, poll_interval) => {
                    Event::Stop(StopReason::IdleTimeout)
                }
                received = self.connection.receive() => Event::Received(received),
            };

            match event {
                Event::Stop(reason) => break reason,
                Event::Received(Ok(None)) => break StopReason::PeerClosed,
                Event::Received(Err(e)) => break StopReason::from_error(e),
                Event::Received(Ok(Some(envelope))) => {
                    if envelope.is_keep_alive() {
                        trace!("Keep-alive received");
                        continue;
                    }
                    if let Some(reason) = process(&envelope, &ctx, policy).await {
                        break reason;
                    }
                }
            }
        };

        handle.close().await;

        match &reason {
            StopReason::Failed(e) => warn!("Session failed: {e}"),
            StopReason::IdleTimeout => info!(
                timeout = ?self.config.receive_timeout,
                "Closing idle connection"
            ),
            other => debug!(reason = ?other, "Session ended"),
        }

        reason
    }
}

/// Dispatch one message. Returns a reason if the session must end.
async fn process(
    envelope: &Envelope,
    ctx: &Context,
    policy: HandlerErrorPolicy,
) -> Option<StopReason> {
    let outcome = match ctx.registry().dispatch(envelope, ctx).await {
        Ok(Some(reply)) => match ctx.role() {
            Role::Server => match ctx.connection().send(&reply).await {
                // An unframeable reply is the handler's fault, the stream is intact
                Err(Error::Malformed(e)) => Err(HandlerError::Reply(e).into()),
                other => other,
            },
            Role::Client => {
                debug!(
                    message_type = reply.message_type(),
                    "Discarding handler reply on client"
                );
                Ok(())
            }
        },
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => None,
        Err(e) if e.is_recoverable() => {
            warn!(
                message_type = envelope.message_type(),
                "Dropping message: {e}"
            );
            None
        }
        Err(Error::Handler(e)) if policy == HandlerErrorPolicy::LogAndContinue => {
            warn!(message_type = envelope.message_type(), "Handler failed: {e}");
            None
        }
        Err(e) => Some(StopReason::from_error(e)),
    }
}

/// Resolves once nothing has been received for `timeout`.
///
/// Never resolves when `timeout` is `None`.
async fn idle_deadline(
    handle: &ConnectionHandle,
    timeout: Option<Duration>,
    poll_interval: Duration,
) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };

    loop {
        let deadline = handle.last_receive() + timeout;
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        sleep_until(deadline.max(now + poll_interval)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use crate::protocol::{MAX_FRAME_SIZE, Message};
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping(u32);

    impl Message for Ping {
        const MESSAGE_TYPE: &'static str = "ping";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong(u32);

    impl Message for Pong {
        const MESSAGE_TYPE: &'static str = "pong";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Boom;

    impl Message for Boom {
        const MESSAGE_TYPE: &'static str = "boom";
    }

    /// Asks for a reply padded to the given size.
    #[derive(Debug, Serialize, Deserialize)]
    struct Bulky(usize);

    impl Message for Bulky {
        const MESSAGE_TYPE: &'static str = "bulky";
    }

    fn registry() -> ActionRegistry {
        let registry = ActionRegistry::new();
        registry
            .register_fn(|ping: Ping, _ctx: Context| async move {
                Ok::<_, HandlerError>(Some(Envelope::seal(&Pong(ping.0))?))
            })
            .unwrap();
        registry
            .register_fn(|_: Boom, _ctx: Context| async move {
                Err::<Option<Envelope>, _>(HandlerError::rejected("boom"))
            })
            .unwrap();
        registry
            .register_fn(|bulky: Bulky, _ctx: Context| async move {
                let padding = Bytes::from(vec![0u8; bulky.0]);
                Ok::<_, HandlerError>(Some(Envelope::new("bulky.reply", padding)))
            })
            .unwrap();
        registry
    }

    fn pair(role: Role, config: SessionConfig) -> (Session, Connection, CancellationToken) {
        let (local, remote) = tokio::io::duplex(4096);
        let shutdown = CancellationToken::new();
        let session = Session::new(
            Connection::new(Box::new(local), "local", config.max_frame_size),
            registry(),
            role,
            config,
            shutdown.clone(),
        );
        let peer = Connection::new(Box::new(remote), "remote", MAX_FRAME_SIZE);
        (session, peer, shutdown)
    }

    #[tokio::test]
    async fn test_server_replies() {
        let (session, mut peer, shutdown) = pair(Role::Server, SessionConfig::default());
        let task = tokio::spawn(session.run());

        peer.handle().send_message(&Ping(7)).await.unwrap();
        let reply = peer.receive().await.unwrap().unwrap();
        assert_eq!(reply.open::<Pong>().unwrap(), Pong(7));

        shutdown.cancel();
        assert!(matches!(task.await.unwrap(), StopReason::Shutdown));
    }

    #[tokio::test]
    async fn test_client_discards_replies() {
        let (session, mut peer, _shutdown) = pair(Role::Client, SessionConfig::default());
        let task = tokio::spawn(session.run());

        peer.handle().send_message(&Ping(1)).await.unwrap();
        peer.handle().send_message(&Boom).await.unwrap();

        // Boom ends the session only after Ping was handled
        assert!(matches!(
            task.await.unwrap(),
            StopReason::Failed(Error::Handler(HandlerError::Rejected(_)))
        ));

        // The stream ends without a Pong ever being written
        assert!(peer.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_close_ends_session() {
        let (session, peer, _shutdown) = pair(Role::Server, SessionConfig::default());
        let handle = session.handle().clone();
        let task = tokio::spawn(session.run());

        drop(peer);
        assert!(matches!(task.await.unwrap(), StopReason::PeerClosed));
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_handler_error_closes_by_default() {
        let (session, peer, _shutdown) = pair(Role::Server, SessionConfig::default());
        let task = tokio::spawn(session.run());

        peer.handle().send_message(&Boom).await.unwrap();
        assert!(matches!(
            task.await.unwrap(),
            StopReason::Failed(Error::Handler(HandlerError::Rejected(_)))
        ));
    }

    #[tokio::test]
    async fn test_handler_error_log_and_continue() {
        let config =
            SessionConfig::default().with_handler_error_policy(HandlerErrorPolicy::LogAndContinue);
        let (session, mut peer, shutdown) = pair(Role::Server, config);
        let task = tokio::spawn(session.run());

        peer.handle().send_message(&Boom).await.unwrap();
        peer.handle().send_message(&Ping(2)).await.unwrap();

        let reply = peer.receive().await.unwrap().unwrap();
        assert_eq!(reply.open::<Pong>().unwrap(), Pong(2));

        shutdown.cancel();
        assert!(matches!(task.await.unwrap(), StopReason::Shutdown));
    }

    #[tokio::test]
    async fn test_oversized_reply_closes_by_default() {
        let config = SessionConfig::default().with_max_frame_size(256);
        let (session, peer, _shutdown) = pair(Role::Server, config);
        let task = tokio::spawn(session.run());

        peer.handle().send_message(&Bulky(1000)).await.unwrap();
        assert!(matches!(
            task.await.unwrap(),
            StopReason::Failed(Error::Handler(HandlerError::Reply(
                CodecError::FrameTooLarge { max: 256, .. }
            )))
        ));
    }

    #[tokio::test]
    async fn test_oversized_reply_log_and_continue() {
        let config = SessionConfig::default()
            .with_max_frame_size(256)
            .with_handler_error_policy(HandlerErrorPolicy::LogAndContinue);
        let (session, mut peer, shutdown) = pair(Role::Server, config);
        let handle = session.handle().clone();
        let task = tokio::spawn(session.run());

        peer.handle().send_message(&Bulky(1000)).await.unwrap();
        peer.handle().send_message(&Ping(3)).await.unwrap();

        // Nothing of the oversized reply reached the wire
        let reply = peer.receive().await.unwrap().unwrap();
        assert_eq!(reply.open::<Pong>().unwrap(), Pong(3));
        assert!(handle.is_open());

        shutdown.cancel();
        assert!(matches!(task.await.unwrap(), StopReason::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let config = SessionConfig::default().with_receive_timeout(Duration::from_millis(300));
        let (session, _peer, _shutdown) = pair(Role::Server, config);

        let started = Instant::now();
        let reason = session.run().await;

        assert!(matches!(reason, StopReason::IdleTimeout));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_defers_idle_timeout() {
        let config = SessionConfig::default().with_receive_timeout(Duration::from_millis(300));
        let (session, peer, _shutdown) = pair(Role::Server, config);
        let started = Instant::now();
        let task = tokio::spawn(session.run());

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            peer.handle().send(&Envelope::keep_alive()).await.unwrap();
        }

        assert!(matches!(task.await.unwrap(), StopReason::IdleTimeout));
        assert!(started.elapsed() >= Duration::from_millis(1300));
    }
}
