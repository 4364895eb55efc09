use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::capture::{AudioClip, Frame};
use crate::codec::{Message, MessageKind, PROTOCOL_VERSION};

/// JSON control directive carried in `control` messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlDirective {
    pub command: String,

    #[serde(default)]
    pub data: serde_json::Value,
}

impl ControlDirective {
    pub fn new(command: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }

    /// Sent by the device right after the command channel opens
    pub fn hello(device_id: &str, sample_rate: u32, channels: u16) -> Self {
        Self::new(
            "hello",
            json!({
                "device_id": device_id,
                "protocol_version": PROTOCOL_VERSION,
                "client": format!("classroom-link/{}", env!("CARGO_PKG_VERSION")),
                "audio": {
                    "format": "s16le",
                    "sample_rate": sample_rate,
                    "channels": channels,
                },
            }),
        )
    }

    /// Server request for the device to shut down
    pub fn is_stop(&self) -> bool {
        self.command.eq_ignore_ascii_case("stop")
    }
}

/// Identities recognized in a submitted frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub identities: Vec<String>,
}

/// Accepted encodings of a recognition payload
#[derive(Deserialize)]
#[serde(untagged)]
enum RecognitionPayload {
    Object(RecognitionResult),
    List(Vec<String>),
}

/// A discrete outbound event
#[derive(Debug, Clone)]
pub enum Event {
    /// Frame to run face recognition on
    Recognize(Frame),
    /// Recorded utterance for server-side speech recognition
    VoiceQuery(AudioClip),
    /// Typed (or locally transcribed) question
    TextQuery(String),
    Control(ControlDirective),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Recognize(_) => "recognize",
            Event::VoiceQuery(_) => "voice-query",
            Event::TextQuery(_) => "text-query",
            Event::Control(_) => "control",
        }
    }

    pub fn into_message(self) -> Result<Message, serde_json::Error> {
        Ok(match self {
            Event::Recognize(frame) => frame.into_message(),
            Event::VoiceQuery(clip) => clip.into_message(),
            Event::TextQuery(text) => Message::text(MessageKind::Query, &text),
            Event::Control(directive) => {
                Message::new(MessageKind::Control, Bytes::from(serde_json::to_vec(&directive)?))
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("{0} messages are not responses")]
    NotAResponse(MessageKind),

    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: MessageKind, reason: String },
}

/// A decoded reply from the server
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Text to speak
    Speech(String),
    /// Names recognized in a frame (possibly none)
    Recognition(RecognitionResult),
    /// Raw 16-bit little-endian PCM to play as is
    Audio(Bytes),
    Control(ControlDirective),
}

impl Response {
    pub fn kind(&self) -> MessageKind {
        match self {
            Response::Speech(_) => MessageKind::SpeechResponse,
            Response::Recognition(_) => MessageKind::RecognitionResponse,
            Response::Audio(_) => MessageKind::Audio,
            Response::Control(_) => MessageKind::Control,
        }
    }

    pub fn from_message(message: &Message) -> Result<Self, ResponseError> {
        let malformed = |reason: String| ResponseError::Malformed {
            kind: message.kind,
            reason,
        };

        match message.kind {
            MessageKind::SpeechResponse => {
                let text = message.as_text().map_err(|e| malformed(e.to_string()))?;
                Ok(Response::Speech(text.to_string()))
            }
            MessageKind::RecognitionResponse => {
                let payload: RecognitionPayload = serde_json::from_slice(&message.payload)
                    .map_err(|e| malformed(e.to_string()))?;
                Ok(Response::Recognition(match payload {
                    RecognitionPayload::Object(result) => result,
                    RecognitionPayload::List(identities) => RecognitionResult { identities },
                }))
            }
            MessageKind::Audio => {
                if message.len() % 2 != 0 {
                    return Err(malformed(format!(
                        "{} bytes is not whole 16-bit samples",
                        message.len()
                    )));
                }
                Ok(Response::Audio(message.payload.clone()))
            }
            MessageKind::Control => {
                let directive: ControlDirective = serde_json::from_slice(&message.payload)
                    .map_err(|e| malformed(e.to_string()))?;
                Ok(Response::Control(directive))
            }
            other => Err(ResponseError::NotAResponse(other)),
        }
    }

    pub fn into_message(self) -> Result<Message, serde_json::Error> {
        Ok(match self {
            Response::Speech(text) => Message::text(MessageKind::SpeechResponse, &text),
            Response::Recognition(result) => Message::new(
                MessageKind::RecognitionResponse,
                Bytes::from(serde_json::to_vec(&result)?),
            ),
            Response::Audio(pcm) => Message::new(MessageKind::Audio, pcm),
            Response::Control(directive) => {
                Message::new(MessageKind::Control, Bytes::from(serde_json::to_vec(&directive)?))
            }
        })
    }
}
