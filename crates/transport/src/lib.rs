//! Transport boundary for tether links
//!
//! A transport knows how to open and accept raw byte streams: bidirectional,
//! ordered and reliable. It knows nothing about messages. Framing, liveness
//! tracking and dispatch are layered on top by `tether-link`.
//!
//! Implementations live in separate crates:
//! - `tether-transport-tcp` for real sockets
//! - `tether-transport-memory` for in-process pairs

pub mod error;

use async_trait::async_trait;
use std::fmt::{Debug, Display};
use tokio::io::{AsyncRead, AsyncWrite};

pub use error::TransportError;

/// Default listen backlog used when an embedder does not pick one.
pub const DEFAULT_BACKLOG: u32 = 5;

/// A raw byte stream produced by a transport.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<S> Stream for S where S: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased byte stream handed to the link layer
pub type BoxedStream = Box<dyn Stream>;

/// Address type used by a transport
pub trait Address: Clone + Debug + Display + Send + Sync + 'static {}

impl<A> Address for A where A: Clone + Debug + Display + Send + Sync + 'static {}

/// Transport trait for acquiring byte streams
///
/// `connect` opens an outgoing stream, `listen` binds a [`Listener`] that
/// yields incoming ones.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address type understood by this transport
    type Addr: Address;

    /// Listener produced by [`Transport::listen`]
    type Listener: Listener<Addr = Self::Addr>;

    /// Open a stream to `addr`
    async fn connect(&self, addr: &Self::Addr) -> Result<BoxedStream, TransportError>;

    /// Bind a listener at `addr` with the given accept backlog
    async fn listen(
        &self,
        addr: &Self::Addr,
        backlog: u32,
    ) -> Result<Self::Listener, TransportError>;
}

/// Listener for incoming streams
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Address type of the listener and of its peers
    type Addr: Address;

    /// Wait for the next incoming stream
    ///
    /// An error here means the listener itself is broken, not that a single
    /// peer misbehaved.
    async fn accept(&self) -> Result<(BoxedStream, Self::Addr), TransportError>;

    /// Address the listener is actually bound to
    fn local_addr(&self) -> Result<Self::Addr, TransportError>;
}
