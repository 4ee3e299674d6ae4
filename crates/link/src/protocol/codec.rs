//! CBOR payload encoding.
//!
//! Errors are returned as plain strings; callers attach the message type.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Encode a value into CBOR bytes.
///
/// # Errors
///
/// Returns the serializer's message if the value cannot be encoded.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, String> {
    let mut vec = Vec::new();
    ciborium::ser::into_writer(value, &mut vec).map_err(|e| e.to_string())?;
    Ok(Bytes::from(vec))
}

/// Decode CBOR bytes into a value.
///
/// # Errors
///
/// Returns the deserializer's message if the bytes are not a valid `T`.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, String> {
    ciborium::de::from_reader(data).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Command {
        Move { x: i32, y: i32 },
        Say(String),
        Quit,
    }

    #[test]
    fn test_enum_variants_survive() {
        for command in [
            Command::Move { x: -3, y: 7 },
            Command::Say("hi".to_string()),
            Command::Quit,
        ] {
            let encoded = encode(&command).unwrap();
            let decoded: Command = decode(&encoded).unwrap();
            assert_eq!(command, decoded);
        }
    }

    #[test]
    fn test_decode_error() {
        let result: Result<Command, String> = decode(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_empty() {
        let result: Result<Command, String> = decode(&[]);
        assert!(result.is_err());
    }
}
