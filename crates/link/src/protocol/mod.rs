//! Wire protocol: messages, payload codec and framing.

pub mod codec;
pub mod framing;
pub mod message;

pub use framing::{
    EnvelopeCodec, HEADER_SIZE, Inbound, MAX_FRAME_SIZE, WIRE_VERSION, decode_message,
    encode_message,
};
pub use message::{Envelope, KeepAlive, Message, MessageType};
