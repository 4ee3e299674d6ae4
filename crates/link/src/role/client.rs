//! Connecting side of a link.

use super::{Lifecycle, LifecycleState, Role};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionHandle};
use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatDriver;
use crate::protocol::{Envelope, Message};
use crate::registry::ActionRegistry;
use crate::session::Session;

use std::sync::{Arc, OnceLock};
use tether_transport::Transport;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{info, instrument, warn};

struct ClientInner<T: Transport> {
    transport: T,
    addr: T::Addr,
    config: ClientConfig,
    registry: ActionRegistry,
    lifecycle: Lifecycle,
    tasks: TaskTracker,
    connection: OnceLock<ConnectionHandle>,
    start_lock: Mutex<()>,
}

/// Holds one connection to a server.
///
/// The client stops when its session ends, whether from a local
/// [`stop`](Self::stop), the server closing, or a receive failure.
pub struct Client<T: Transport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Client<T> {
    /// Create a client for the server at `addr`.
    pub fn new(
        transport: T,
        addr: T::Addr,
        registry: ActionRegistry,
        config: ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                addr,
                config,
                registry,
                lifecycle: Lifecycle::new(),
                tasks: TaskTracker::new(),
                connection: OnceLock::new(),
                start_lock: Mutex::new(()),
            }),
        }
    }

    /// Connect and start the session and heartbeat.
    ///
    /// Calling `start` on a running client returns the existing connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStopped`] after the client has stopped,
    /// [`Error::Timeout`] if the connect timeout expires, or
    /// [`Error::Transport`] if the connection is refused. A failed start
    /// leaves the client idle so it can be retried.
    #[instrument(skip(self), fields(addr = %self.inner.addr))]
    pub async fn start(&self) -> Result<ConnectionHandle> {
        let _guard = self.inner.start_lock.lock().await;

        match self.inner.lifecycle.begin() {
            Ok(()) => {}
            Err(LifecycleState::Running) => {
                return self.inner.connection.get().cloned().ok_or(Error::NotRunning);
            }
            Err(_) => return Err(Error::AlreadyStopped),
        }

        let connect_timeout = self.inner.config.connect_timeout;
        let stream = match timeout(
            connect_timeout,
            self.inner.transport.connect(&self.inner.addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.inner.lifecycle.revert();
                return Err(e.into());
            }
            Err(_) => {
                self.inner.lifecycle.revert();
                return Err(Error::Timeout(connect_timeout));
            }
        };

        let session_config = self.inner.config.session.clone();
        let connection = Connection::new(
            stream,
            self.inner.addr.to_string(),
            session_config.max_frame_size,
        );
        let handle = connection.handle().clone();
        let _ = self.inner.connection.set(handle.clone());

        info!(connection = %handle.id(), "Connected to {}", self.inner.addr);

        let shutdown = self.inner.lifecycle.shutdown().child_token();

        if let Some(interval) = session_config.heartbeat_interval {
            let driver = HeartbeatDriver::new(
                handle.clone(),
                interval,
                session_config.poll_interval,
                shutdown.clone(),
            );
            self.inner.tasks.spawn(driver.run());
        }

        let session = Session::new(
            connection,
            self.inner.registry.clone(),
            Role::Client,
            session_config,
            shutdown,
        );

        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn(async move {
            let reason = session.run().await;
            if let Some(inner) = weak.upgrade() {
                if inner.lifecycle.stop() {
                    info!(?reason, "Client stopped by session end");
                }
                inner.tasks.close();
            }
        });

        Ok(handle)
    }

    /// Send a typed message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] if the client is not running, otherwise
    /// as [`ConnectionHandle::send`].
    pub async fn send<M: Message>(&self, message: &M) -> Result<()> {
        self.send_envelope(&Envelope::seal(message)?).await
    }

    /// Send a pre-built envelope to the server.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let connection = self.inner.connection.get().ok_or(Error::NotRunning)?;
        connection.send(envelope).await
    }

    /// Close the connection and stop background tasks.
    ///
    /// Returns `false` if the client was already stopped.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.lifecycle.stop();
        if stopped {
            info!("Stopping client for {}", self.inner.addr);
        }
        self.inner.tasks.close();
        stopped
    }

    /// Wait until the session and heartbeat have finished.
    pub async fn wait(&self) {
        self.inner.tasks.wait().await;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// Whether the client is connected and running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Handle to the connection, once started.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.inner.connection.get().cloned()
    }

    /// The registry used by the client's session.
    #[must_use]
    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.registry
    }
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.inner.addr)
            .field("state", &self.inner.lifecycle.state())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Drop for ClientInner<T> {
    fn drop(&mut self) {
        if self.lifecycle.state() == LifecycleState::Running {
            warn!("Client for {} dropped while running", self.addr);
        }
        self.lifecycle.shutdown().cancel();
    }
}
