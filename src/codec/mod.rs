//! Wire framing shared by every transport
//!
//! One format for every stream: a 4-byte big-endian payload length, a
//! 1-byte type tag, then exactly that many payload bytes. Binary media is
//! carried raw, control directives and recognition results as JSON, text
//! as UTF-8.

pub mod frame;
pub mod message;

pub use frame::{encode, CodecError, FrameCodec, DEFAULT_MAX_MESSAGE_LEN, HEADER_LEN};
pub use message::{Message, MessageKind, PROTOCOL_VERSION};
