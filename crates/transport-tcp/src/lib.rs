//! TCP transport implementation for tether links
//!
//! This crate provides a TCP-based implementation of the tether-transport traits.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tether_transport::{BoxedStream, Listener, Transport, TransportError};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info};

/// TCP-specific configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Disable Nagle's algorithm on every stream
    pub nodelay: bool,
    /// Set `SO_REUSEADDR` on listening sockets
    pub reuse_addr: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            reuse_addr: true,
        }
    }
}

/// TCP transport implementation
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    /// Create a new TCP transport
    #[must_use]
    pub const fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    fn prepare(&self, stream: &TcpStream) -> Result<(), TransportError> {
        stream
            .set_nodelay(self.config.nodelay)
            .map_err(TransportError::Io)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Addr = SocketAddr;
    type Listener = TcpListener;

    async fn connect(&self, addr: &SocketAddr) -> Result<BoxedStream, TransportError> {
        debug!("Connecting to {}", addr);

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::connect_failed(addr, e))?;
        self.prepare(&stream)?;

        debug!(
            "TCP connection established to {} from {:?}",
            addr,
            stream.local_addr().ok()
        );

        Ok(Box::new(stream))
    }

    async fn listen(
        &self,
        addr: &SocketAddr,
        backlog: u32,
    ) -> Result<TcpListener, TransportError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(self.config.reuse_addr)?;
        socket.bind(*addr).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => TransportError::AddressInUse(addr.to_string()),
            _ => TransportError::Io(e),
        })?;

        let inner = socket.listen(backlog)?;
        info!(
            "TCP transport listening on {} (backlog {})",
            inner.local_addr()?,
            backlog
        );

        Ok(TcpListener {
            inner,
            transport: self.clone(),
        })
    }
}

/// Listener returned by [`TcpTransport::listen`]
#[derive(Debug)]
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    transport: TcpTransport,
}

#[async_trait]
impl Listener for TcpListener {
    type Addr = SocketAddr;

    async fn accept(&self) -> Result<(BoxedStream, SocketAddr), TransportError> {
        let (stream, addr) = self.inner.accept().await?;
        self.transport.prepare(&stream)?;
        debug!("Accepted connection from {}", addr);
        Ok((Box::new(stream), addr))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.local_addr().map_err(TransportError::Io)
    }
}
