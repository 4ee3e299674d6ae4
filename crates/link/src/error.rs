//! Error types for links, sessions and roles.

use std::io;
use std::time::Duration;
use tether_transport::TransportError;
use thiserror::Error;

/// Result type alias for link operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for link operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying stream failed on read or write.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A received unit could not be decoded.
    #[error("Malformed message: {0}")]
    Malformed(#[from] CodecError),

    /// An application handler failed while processing a message.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// The listen or accept primitive failed.
    #[error("Accept error: {0}")]
    Accept(#[source] TransportError),

    /// Connection-level state errors.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Handlers cannot be registered for reserved message types.
    #[error("Message type {0} is reserved")]
    ReservedMessageType(&'static str),

    /// The role was stopped and cannot be started again.
    #[error("Role already stopped")]
    AlreadyStopped,

    /// The role has not been started.
    #[error("Role is not running")]
    NotRunning,

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Transport(TransportError::Io(err))
    }
}

impl Error {
    /// Whether the connection that produced this error can keep going.
    ///
    /// Only content errors inside an intact frame qualify.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Malformed(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

/// Connection state errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection is closing or closed.
    #[error("Connection closed")]
    Closed,

    /// The peer closed its side of the stream.
    #[error("Connection closed by peer")]
    PeerClosed,
}

/// Codec and framing errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload serialization failed.
    #[error("Failed to serialize {message_type}: {reason}")]
    Serialize {
        /// Type tag of the message.
        message_type: &'static str,
        /// Underlying serializer error.
        reason: String,
    },

    /// Payload deserialization failed.
    #[error("Failed to deserialize {message_type}: {reason}")]
    Deserialize {
        /// Type tag of the message.
        message_type: String,
        /// Underlying deserializer error.
        reason: String,
    },

    /// The envelope carries a different message type than requested.
    #[error("Unexpected message type: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Requested type tag.
        expected: &'static str,
        /// Type tag found in the envelope.
        actual: String,
    },

    /// Frame header announces a wire version we do not speak.
    #[error("Unsupported wire version {0}")]
    UnsupportedVersion(u8),

    /// Frame body exceeds the configured maximum.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame body.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame body does not match its checksum.
    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum of the received body.
        actual: u32,
    },

    /// Type tag is empty, too long or not UTF-8.
    #[error("Invalid message type tag: {0}")]
    InvalidTag(String),

    /// Fewer bytes than the frame requires.
    #[error("Truncated frame: needed {needed} bytes, got {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },
}

impl CodecError {
    /// Whether the frame boundary survived the error.
    ///
    /// Version and size errors come from the header itself, so the position
    /// of the next frame is unknown and the stream must be abandoned.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::UnsupportedVersion(_) | Self::FrameTooLarge { .. }
        )
    }
}

/// Errors raised by application handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler rejected the message.
    #[error("{0}")]
    Rejected(String),

    /// The handler could not build its reply.
    #[error("Failed to encode reply: {0}")]
    Reply(#[from] CodecError),

    /// Any other handler failure.
    #[error("Internal handler error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Create a rejection with a message.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Wrap any displayable failure.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(
            CodecError::ChecksumMismatch {
                expected: 1,
                actual: 2
            }
            .is_recoverable()
        );
        assert!(CodecError::InvalidTag("x".into()).is_recoverable());
        assert!(!CodecError::UnsupportedVersion(9).is_recoverable());
        assert!(!CodecError::FrameTooLarge { size: 10, max: 5 }.is_recoverable());

        let err: Error = CodecError::InvalidTag("x".into()).into();
        assert!(err.is_recoverable());
        assert!(!Error::Connection(ConnectionError::Closed).is_recoverable());
    }

    #[test]
    fn test_io_maps_to_transport() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, Error::Transport(TransportError::Io(_))));
    }
}
