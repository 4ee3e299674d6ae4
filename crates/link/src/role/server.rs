//! Accepting side of a link.

use super::{Lifecycle, LifecycleState, Role};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionHandle, ConnectionId};
use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatDriver;
use crate::registry::ActionRegistry;
use crate::session::Session;

use dashmap::DashMap;
use std::sync::{Arc, OnceLock, Weak};
use tether_transport::{BoxedStream, Listener, Transport};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

struct ServerInner<T: Transport> {
    transport: T,
    addr: T::Addr,
    config: ServerConfig,
    registry: ActionRegistry,
    lifecycle: Lifecycle,
    sessions: DashMap<ConnectionId, ConnectionHandle>,
    tasks: TaskTracker,
    local_addr: OnceLock<T::Addr>,
    start_lock: Mutex<()>,
    limiter: Option<Arc<Semaphore>>,
}

/// Accepts connections and runs one session per connection.
///
/// Cloning yields another handle to the same server.
pub struct Server<T: Transport> {
    inner: Arc<ServerInner<T>>,
}

impl<T: Transport> Clone for Server<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Server<T> {
    /// Create a server that will listen on `addr`.
    pub fn new(
        transport: T,
        addr: T::Addr,
        registry: ActionRegistry,
        config: ServerConfig,
    ) -> Self {
        let limiter = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));

        Self {
            inner: Arc::new(ServerInner {
                transport,
                addr,
                config,
                registry,
                lifecycle: Lifecycle::new(),
                sessions: DashMap::new(),
                tasks: TaskTracker::new(),
                local_addr: OnceLock::new(),
                start_lock: Mutex::new(()),
                limiter,
            }),
        }
    }

    /// Bind the listener and start accepting.
    ///
    /// Calling `start` on a running server returns the bound address again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStopped`] after [`stop`](Self::stop), or
    /// [`Error::Accept`] if the listener cannot be bound. A failed start
    /// leaves the server idle so it can be retried.
    #[instrument(skip(self), fields(addr = %self.inner.addr))]
    pub async fn start(&self) -> Result<T::Addr> {
        let _guard = self.inner.start_lock.lock().await;

        match self.inner.lifecycle.begin() {
            Ok(()) => {}
            Err(LifecycleState::Running) => {
                return self.inner.local_addr.get().cloned().ok_or(Error::NotRunning);
            }
            Err(_) => return Err(Error::AlreadyStopped),
        }

        let listener = match self
            .inner
            .transport
            .listen(&self.inner.addr, self.inner.config.backlog)
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.lifecycle.revert();
                return Err(Error::Accept(e));
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.inner.lifecycle.revert();
                return Err(Error::Accept(e));
            }
        };
        let _ = self.inner.local_addr.set(local_addr.clone());

        info!("Server listening on {local_addr}");

        self.inner.tasks.spawn(accept_loop(
            Arc::downgrade(&self.inner),
            listener,
            self.inner.lifecycle.shutdown().clone(),
        ));

        Ok(local_addr)
    }

    /// Stop accepting and close every connection.
    ///
    /// Returns `false` if the server was already stopped.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.lifecycle.stop();
        if stopped {
            info!(
                active = self.inner.sessions.len(),
                "Stopping server on {}", self.inner.addr
            );
        }
        self.inner.tasks.close();
        stopped
    }

    /// Wait until the accept loop and every session have finished.
    pub async fn wait(&self) {
        self.inner.tasks.wait().await;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// Whether the server is accepting connections.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// The bound address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<T::Addr> {
        self.inner.local_addr.get().cloned()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Identifiers of live sessions.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Handle to a live connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// The registry shared by all sessions.
    #[must_use]
    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.registry
    }
}

impl<T: Transport> std::fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.inner.addr)
            .field("state", &self.inner.lifecycle.state())
            .field("active_connections", &self.inner.sessions.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Drop for ServerInner<T> {
    fn drop(&mut self) {
        self.lifecycle.shutdown().cancel();
    }
}

async fn accept_loop<T: Transport>(
    server: Weak<ServerInner<T>>,
    listener: T::Listener,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                debug!("Accept loop shutting down");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        // Every server handle is gone
        let Some(inner) = server.upgrade() else {
            break;
        };

        match accepted {
            Ok((stream, peer)) => {
                let permit = match &inner.limiter {
                    None => None,
                    Some(limiter) => {
                        let Ok(permit) = Arc::clone(limiter).try_acquire_owned() else {
                            warn!("Max connections reached, rejecting connection from {peer}");
                            continue;
                        };
                        Some(permit)
                    }
                };
                spawn_session(&inner, stream, peer.to_string(), permit);
            }
            Err(e) => {
                error!("Accept failed, stopping server: {e}");
                inner.lifecycle.stop();
                inner.tasks.close();
                break;
            }
        }
    }
}

fn spawn_session<T: Transport>(
    inner: &Arc<ServerInner<T>>,
    stream: BoxedStream,
    peer: String,
    permit: Option<OwnedSemaphorePermit>,
) {
    let config = &inner.config.session;
    let connection = Connection::new(stream, peer, config.max_frame_size);
    let handle = connection.handle().clone();
    let id = handle.id();

    info!(connection = %id, peer = handle.peer(), "Accepted connection");
    inner.sessions.insert(id, handle.clone());

    let shutdown = inner.lifecycle.shutdown().child_token();

    if let Some(interval) = config.heartbeat_interval {
        let driver =
            HeartbeatDriver::new(handle, interval, config.poll_interval, shutdown.clone());
        inner.tasks.spawn(driver.run());
    }

    let session = Session::new(
        connection,
        inner.registry.clone(),
        Role::Server,
        config.clone(),
        shutdown,
    );

    let weak = Arc::downgrade(inner);
    inner.tasks.spawn(async move {
        let _permit = permit;
        let reason = session.run().await;
        if let Some(inner) = weak.upgrade() {
            inner.sessions.remove(&id);
            debug!(connection = %id, ?reason, "Session removed");
        }
    });
}
