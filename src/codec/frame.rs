use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, MessageKind};

/// Length prefix (4 bytes) plus type tag (1 byte)
pub const HEADER_LEN: usize = 5;

/// Default cap on a declared payload length (16 MiB)
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Malformed or truncated message
    #[error("framing error: {0}")]
    Framing(String),

    /// Declared (or outgoing) payload length is above the configured cap
    #[error("message length {declared} exceeds limit of {limit} bytes")]
    Oversize { declared: u64, limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed message codec
///
/// Wire layout:
///
/// ```text
/// [u32 BE: payload length] [u8: type tag] [payload bytes]
/// ```
///
/// The length counts payload bytes only. Oversized headers are rejected
/// before any buffer space is reserved for the payload.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_message_len: usize,
}

impl FrameCodec {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            max_message_len: max_message_len.min(u32::MAX as usize),
        }
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// Encode a message into a standalone buffer
    pub fn encode_to_bytes(&mut self, message: Message) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + message.len());
        self.encode(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a buffer that must hold exactly one complete message
    pub fn decode_exact(&mut self, data: &[u8]) -> Result<Message, CodecError> {
        let mut buf = BytesMut::from(data);
        let message = self.decode_eof(&mut buf)?.ok_or_else(|| {
            CodecError::Framing("empty buffer where a message was expected".to_string())
        })?;

        if !buf.is_empty() {
            return Err(CodecError::Framing(format!(
                "{} trailing bytes after {} message",
                buf.len(),
                message.kind
            )));
        }

        Ok(message)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Checked before touching `dst` so a rejected message leaves no partial frame
        if item.payload.len() > self.max_message_len {
            return Err(CodecError::Oversize {
                declared: item.payload.len() as u64,
                limit: self.max_message_len,
            });
        }

        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u32(item.payload.len() as u32);
        dst.put_u8(item.kind.tag());
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&src[..4]);
        let declared = u32::from_be_bytes(prefix) as usize;

        if declared > self.max_message_len {
            return Err(CodecError::Oversize {
                declared: declared as u64,
                limit: self.max_message_len,
            });
        }

        let kind = MessageKind::from_tag(src[4])?;

        let total = HEADER_LEN + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(declared).freeze();

        Ok(Some(Message { kind, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Framing(format!(
                "stream closed mid-message with {} buffered bytes",
                src.len()
            ))),
        }
    }
}

/// Encode one message with the default cap
pub fn encode(kind: MessageKind, payload: impl Into<Bytes>) -> Result<Bytes, CodecError> {
    FrameCodec::default().encode_to_bytes(Message::new(kind, payload))
}
