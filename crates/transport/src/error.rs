//! Error types for the transport layer

use std::io;
use thiserror::Error;

/// Transport operation errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to open a stream to the given address
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed {
        /// Address we tried to reach
        addr: String,
        /// Why it failed
        reason: String,
    },

    /// Something is already listening at the address
    #[error("Address already in use: {0}")]
    AddressInUse(String),

    /// Nothing is listening at the address
    #[error("No listener at {0}")]
    NoListener(String),

    /// The listener or stream was closed
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Create a connect failure for `addr`
    pub fn connect_failed(addr: impl ToString, reason: impl ToString) -> Self {
        Self::ConnectFailed {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }
}
