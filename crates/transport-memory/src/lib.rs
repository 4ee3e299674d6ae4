//! In-memory transport implementation for testing
//!
//! This transport connects endpoints within the same process through
//! `tokio::io::duplex` pairs, so links can be exercised without sockets.
//! Every [`MemoryTransport`] clone shares one address table; separate
//! `MemoryTransport::new` instances are fully isolated from each other.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_transport::{BoxedStream, Listener, Transport, TransportError};
use tracing::{debug, info};

/// Address of an in-memory endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryAddr(String);

impl MemoryAddr {
    /// Create an address from a name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The address name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MemoryAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory://{}", self.0)
    }
}

impl From<&str> for MemoryAddr {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Configuration for memory transport
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Bytes buffered in each direction before writers wait
    pub buffer_size: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
        }
    }
}

type Incoming = (BoxedStream, MemoryAddr);

/// Memory transport implementation
#[derive(Clone, Default)]
pub struct MemoryTransport {
    options: MemoryOptions,
    listeners: Arc<DashMap<MemoryAddr, flume::Sender<Incoming>>>,
    next_peer: Arc<AtomicU64>,
}

impl MemoryTransport {
    /// Create a new memory transport with options
    #[must_use]
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            options,
            listeners: Arc::new(DashMap::new()),
            next_peer: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of addresses currently listening
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("options", &self.options)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Addr = MemoryAddr;
    type Listener = MemoryListener;

    async fn connect(&self, addr: &MemoryAddr) -> Result<BoxedStream, TransportError> {
        debug!("Connecting to {}", addr);

        // Clone the sender out so no map guard is held across the await
        let incoming_tx = self
            .listeners
            .get(addr)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::NoListener(addr.to_string()))?;

        let (client_side, server_side) = tokio::io::duplex(self.options.buffer_size);
        let peer = MemoryAddr::new(format!(
            "{}/peer-{}",
            addr.as_str(),
            self.next_peer.fetch_add(1, Ordering::Relaxed)
        ));

        incoming_tx
            .send_async((Box::new(server_side), peer.clone()))
            .await
            .map_err(|_| TransportError::NoListener(addr.to_string()))?;

        info!("Memory connection established {} -> {}", peer, addr);

        Ok(Box::new(client_side))
    }

    async fn listen(
        &self,
        addr: &MemoryAddr,
        backlog: u32,
    ) -> Result<MemoryListener, TransportError> {
        let capacity = usize::try_from(backlog).unwrap_or(usize::MAX).max(1);
        let (incoming_tx, incoming_rx) = flume::bounded(capacity);

        match self.listeners.entry(addr.clone()) {
            Entry::Occupied(_) => return Err(TransportError::AddressInUse(addr.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(incoming_tx);
            }
        }

        info!("Memory listener created at {}", addr);

        Ok(MemoryListener {
            addr: addr.clone(),
            incoming_rx,
            listeners: Arc::clone(&self.listeners),
        })
    }
}

/// Listener returned by [`MemoryTransport::listen`]
///
/// Dropping it frees the address.
pub struct MemoryListener {
    addr: MemoryAddr,
    incoming_rx: flume::Receiver<Incoming>,
    listeners: Arc<DashMap<MemoryAddr, flume::Sender<Incoming>>>,
}

impl Debug for MemoryListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryListener")
            .field("addr", &self.addr)
            .field("pending", &self.incoming_rx.len())
            .finish()
    }
}

#[async_trait]
impl Listener for MemoryListener {
    type Addr = MemoryAddr;

    async fn accept(&self) -> Result<(BoxedStream, MemoryAddr), TransportError> {
        let (stream, peer) = self
            .incoming_rx
            .recv_async()
            .await
            .map_err(|_| TransportError::Closed)?;
        debug!("Memory listener {} accepted {}", self.addr, peer);
        Ok((stream, peer))
    }

    fn local_addr(&self) -> Result<MemoryAddr, TransportError> {
        Ok(self.addr.clone())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        debug!("Closing memory listener {}", self.addr);
        self.listeners.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_display() {
        assert_eq!(MemoryAddr::new("server").to_string(), "memory://server");
    }

    #[tokio::test]
    async fn test_listener_drop_frees_address() {
        let transport = MemoryTransport::default();
        let addr = MemoryAddr::new("drop-test");

        let listener = transport.listen(&addr, 5).await.unwrap();
        assert_eq!(transport.listener_count(), 1);
        drop(listener);
        assert_eq!(transport.listener_count(), 0);

        // Address can be reused afterwards
        let _listener = transport.listen(&addr, 5).await.unwrap();
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        let first = MemoryTransport::default();
        let second = MemoryTransport::default();
        let addr = MemoryAddr::new("isolated");

        let _listener = first.listen(&addr, 5).await.unwrap();
        assert!(matches!(
            second.connect(&addr).await,
            Err(TransportError::NoListener(_))
        ));
    }
}
