//! Core message traits and types.

use super::codec;
use crate::error::CodecError;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Type tag identifying a message type on the wire.
pub type MessageType = &'static str;

/// Base trait for application messages.
///
/// Every type exchanged over a link implements this trait. The type tag is
/// the runtime identity used for dispatch, so it must be unique per type
/// within one application.
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use tether_link::Message;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Ping {
///     seq: u64,
/// }
///
/// impl Message for Ping {
///     const MESSAGE_TYPE: &'static str = "ping";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique type tag for this message type.
    const MESSAGE_TYPE: MessageType;
}

/// Reserved liveness message.
///
/// Sent by the heartbeat driver to reset the peer's receive-idle timer.
/// Never routed to application handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive;

impl Message for KeepAlive {
    const MESSAGE_TYPE: MessageType = "tether.keep_alive";
}

/// A decoded unit: the type tag plus its still-encoded payload.
///
/// Payload decoding is deferred until the registry knows which concrete
/// type the tag maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    message_type: String,
    payload: Bytes,
}

impl Envelope {
    /// Create an envelope from raw parts.
    pub fn new(message_type: impl Into<String>, payload: Bytes) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
        }
    }

    /// Encode a typed message into an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized.
    pub fn seal<M: Message>(message: &M) -> Result<Self, CodecError> {
        let payload = codec::encode(message).map_err(|reason| CodecError::Serialize {
            message_type: M::MESSAGE_TYPE,
            reason,
        })?;

        Ok(Self::new(M::MESSAGE_TYPE, payload))
    }

    /// Decode the payload as `M`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is not `M`'s or the payload is invalid.
    pub fn open<M: Message>(&self) -> Result<M, CodecError> {
        if !self.is::<M>() {
            return Err(CodecError::TypeMismatch {
                expected: M::MESSAGE_TYPE,
                actual: self.message_type.clone(),
            });
        }

        codec::decode(&self.payload).map_err(|reason| CodecError::Deserialize {
            message_type: self.message_type.clone(),
            reason,
        })
    }

    /// The keep-alive envelope, identical to `seal(&KeepAlive)`.
    #[must_use]
    pub fn keep_alive() -> Self {
        // CBOR null, the encoding of a unit struct
        Self::new(KeepAlive::MESSAGE_TYPE, Bytes::from_static(&[0xf6]))
    }

    /// Whether this is a keep-alive.
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        self.is::<KeepAlive>()
    }

    /// Whether this envelope carries an `M`.
    #[must_use]
    pub fn is<M: Message>(&self) -> bool {
        self.message_type == M::MESSAGE_TYPE
    }

    /// The type tag.
    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The encoded payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    impl Message for Greeting {
        const MESSAGE_TYPE: MessageType = "greeting";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Farewell {
        name: String,
    }

    impl Message for Farewell {
        const MESSAGE_TYPE: MessageType = "farewell";
    }

    #[test]
    fn test_seal_and_open() {
        let envelope = Envelope::seal(&Greeting {
            name: "world".to_string(),
        })
        .unwrap();

        assert_eq!(envelope.message_type(), "greeting");
        assert!(envelope.is::<Greeting>());

        let greeting: Greeting = envelope.open().unwrap();
        assert_eq!(greeting.name, "world");
    }

    #[test]
    fn test_open_wrong_type() {
        let envelope = Envelope::seal(&Greeting {
            name: "world".to_string(),
        })
        .unwrap();

        let result = envelope.open::<Farewell>();
        assert!(matches!(
            result,
            Err(CodecError::TypeMismatch {
                expected: "farewell",
                ..
            })
        ));
    }

    #[test]
    fn test_open_garbage_payload() {
        let envelope = Envelope::new("greeting", Bytes::from_static(&[0xFF, 0xFF, 0xFF]));
        assert!(matches!(
            envelope.open::<Greeting>(),
            Err(CodecError::Deserialize { .. })
        ));
    }

    #[test]
    fn test_keep_alive_matches_sealed() {
        let envelope = Envelope::keep_alive();
        assert!(envelope.is_keep_alive());
        assert!(!envelope.is::<Greeting>());
        assert_eq!(envelope, Envelope::seal(&KeepAlive).unwrap());
        assert_eq!(envelope.open::<KeepAlive>().unwrap(), KeepAlive);
    }
}
