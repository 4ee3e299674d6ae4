//! Message framing for the wire protocol.
//!
//! Every envelope travels as one frame:
//!
//! ```text
//! u32 body_len | u8 version | u32 crc32(body) | body
//! body = u16 tag_len | tag (UTF-8) | payload (CBOR)
//! ```
//!
//! All integers are big-endian.

use super::message::{Envelope, Message};
use crate::error::{CodecError, Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame body size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame header size (4 bytes length + 1 byte version + 4 bytes checksum).
pub const HEADER_SIZE: usize = 9;

/// Current wire version.
pub const WIRE_VERSION: u8 = 1;

const TAG_LEN_SIZE: usize = 2;

/// One item read off the wire.
#[derive(Debug)]
pub enum Inbound {
    /// A well-formed envelope.
    Message(Envelope),
    /// A frame whose boundaries were intact but whose body was not.
    ///
    /// The frame has been consumed; the next frame can still be read.
    Corrupt(CodecError),
}

/// Codec for encoding/decoding envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_frame_size: usize,
}

impl EnvelopeCodec {
    /// Create a new codec with the default size limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// The configured size limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a checked frame body into an envelope.
fn parse_body(mut body: Bytes) -> std::result::Result<Envelope, CodecError> {
    if body.len() < TAG_LEN_SIZE {
        return Err(CodecError::Truncated {
            needed: TAG_LEN_SIZE,
            available: body.len(),
        });
    }

    let tag_len = body.get_u16() as usize;
    if body.len() < tag_len {
        return Err(CodecError::Truncated {
            needed: tag_len,
            available: body.len(),
        });
    }
    if tag_len == 0 {
        return Err(CodecError::InvalidTag("empty".to_string()));
    }

    let tag = body.split_to(tag_len);
    let tag = std::str::from_utf8(&tag).map_err(|e| CodecError::InvalidTag(e.to_string()))?;

    Ok(Envelope::new(tag, body))
}

impl Decoder for EnvelopeCodec {
    type Item = Inbound;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming
        let mut header = &buf[..HEADER_SIZE];
        let body_len = header.get_u32() as usize;
        let version = header.get_u8();
        let checksum = header.get_u32();

        if version != WIRE_VERSION {
            return Err(CodecError::UnsupportedVersion(version).into());
        }

        if body_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            }
            .into());
        }

        let frame_len = HEADER_SIZE + body_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let body = buf.split_to(body_len).freeze();

        let actual = crc32fast::hash(&body);
        if actual != checksum {
            return Ok(Some(Inbound::Corrupt(CodecError::ChecksumMismatch {
                expected: checksum,
                actual,
            })));
        }

        Ok(Some(match parse_body(body) {
            Ok(envelope) => Inbound::Message(envelope),
            Err(e) => Inbound::Corrupt(e),
        }))
    }
}

impl Encoder<&Envelope> for EnvelopeCodec {
    type Error = Error;

    fn encode(&mut self, envelope: &Envelope, buf: &mut BytesMut) -> Result<()> {
        let tag = envelope.message_type().as_bytes();
        let payload = envelope.payload();

        if tag.is_empty() {
            return Err(CodecError::InvalidTag("empty".to_string()).into());
        }
        let tag_len = u16::try_from(tag.len())
            .map_err(|_| CodecError::InvalidTag(format!("{} bytes long", tag.len())))?;

        let body_len = TAG_LEN_SIZE + tag.len() + payload.len();
        if body_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            }
            .into());
        }
        let wire_len = u32::try_from(body_len).map_err(|_| CodecError::FrameTooLarge {
            size: body_len,
            max: self.max_frame_size,
        })?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&tag_len.to_be_bytes());
        hasher.update(tag);
        hasher.update(payload);

        buf.reserve(HEADER_SIZE + body_len);
        buf.put_u32(wire_len);
        buf.put_u8(WIRE_VERSION);
        buf.put_u32(hasher.finalize());
        buf.put_u16(tag_len);
        buf.put_slice(tag);
        buf.put_slice(payload);

        Ok(())
    }
}

/// Encode a typed message into one complete frame.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized or the frame would
/// exceed [`MAX_FRAME_SIZE`].
pub fn encode_message<M: Message>(message: &M) -> Result<Bytes> {
    let envelope = Envelope::seal(message)?;
    let mut buf = BytesMut::new();
    EnvelopeCodec::new().encode(&envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one frame from a byte slice.
///
/// Trailing bytes after the first frame are ignored.
///
/// # Errors
///
/// Returns [`Error::Malformed`] if the bytes do not start with a complete,
/// valid frame.
pub fn decode_message(bytes: &[u8]) -> Result<Envelope> {
    let mut buf = BytesMut::from(bytes);
    match EnvelopeCodec::new().decode(&mut buf)? {
        Some(Inbound::Message(envelope)) => Ok(envelope),
        Some(Inbound::Corrupt(e)) => Err(e.into()),
        None => {
            let needed = if bytes.len() < HEADER_SIZE {
                HEADER_SIZE
            } else {
                HEADER_SIZE + (&bytes[..4]).get_u32() as usize
            };
            Err(CodecError::Truncated {
                needed,
                available: bytes.len(),
            }
            .into())
        }
    }
}
