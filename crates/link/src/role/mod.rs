//! Client and server roles.

mod client;
mod server;

pub use client::Client;
pub use server::Server;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::CancellationToken;

/// Which side of a link a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Connected out to a server; sends heartbeats and discards replies.
    Client,
    /// Accepted from a listener; enforces receive timeouts and sends replies.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Lifecycle of a client or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Created, not started.
    Idle = 0,
    /// Started and serving.
    Running = 1,
    /// Stopped; cannot be restarted.
    Stopped = 2,
}

impl LifecycleState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Shared lifecycle bookkeeping for both roles.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Idle as u8),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `Idle` to `Running`. Fails if already started or stopped.
    pub(crate) fn begin(&self) -> Result<(), LifecycleState> {
        self.state
            .compare_exchange(
                LifecycleState::Idle as u8,
                LifecycleState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(LifecycleState::from_u8)
    }

    /// Undo a failed start.
    pub(crate) fn revert(&self) {
        let _ = self.state.compare_exchange(
            LifecycleState::Running as u8,
            LifecycleState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Move to `Stopped` and signal shutdown. Returns whether this call did it.
    pub(crate) fn stop(&self) -> bool {
        let previous = self
            .state
            .swap(LifecycleState::Stopped as u8, Ordering::AcqRel);
        self.shutdown.cancel();
        previous != LifecycleState::Stopped as u8
    }

    pub(crate) const fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}
