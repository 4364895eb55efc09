use bytes::Bytes;

use super::frame::CodecError;

/// Wire protocol version announced in the `hello` control directive.
pub const PROTOCOL_VERSION: u8 = 1;

/// Type tag carried in the byte that follows the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// JPEG-encoded camera frame (`F`)
    Frame,
    /// Raw 16-bit little-endian PCM (`A`)
    Audio,
    /// UTF-8 text query (`Q`)
    Query,
    /// JSON control directive (`C`)
    Control,
    /// UTF-8 text the device should speak (`S`)
    SpeechResponse,
    /// JSON recognition result (`R`)
    RecognitionResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Frame,
        MessageKind::Audio,
        MessageKind::Query,
        MessageKind::Control,
        MessageKind::SpeechResponse,
        MessageKind::RecognitionResponse,
    ];

    pub fn tag(self) -> u8 {
        match self {
            MessageKind::Frame => b'F',
            MessageKind::Audio => b'A',
            MessageKind::Query => b'Q',
            MessageKind::Control => b'C',
            MessageKind::SpeechResponse => b'S',
            MessageKind::RecognitionResponse => b'R',
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            b'F' => Ok(MessageKind::Frame),
            b'A' => Ok(MessageKind::Audio),
            b'Q' => Ok(MessageKind::Query),
            b'C' => Ok(MessageKind::Control),
            b'S' => Ok(MessageKind::SpeechResponse),
            b'R' => Ok(MessageKind::RecognitionResponse),
            other => Err(CodecError::Framing(format!(
                "unknown message type tag 0x{:02x}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Frame => "frame",
            MessageKind::Audio => "audio",
            MessageKind::Query => "query",
            MessageKind::Control => "control",
            MessageKind::SpeechResponse => "speech-response",
            MessageKind::RecognitionResponse => "recognition-response",
        };
        f.write_str(name)
    }
}

/// A single framed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Build a UTF-8 text message (queries and speech responses)
    pub fn text(kind: MessageKind, text: &str) -> Self {
        Self::new(kind, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Interpret the payload as UTF-8 text
    pub fn as_text(&self) -> Result<&str, CodecError> {
        std::str::from_utf8(&self.payload).map_err(|e| {
            CodecError::Framing(format!("{} payload is not valid UTF-8: {}", self.kind, e))
        })
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
