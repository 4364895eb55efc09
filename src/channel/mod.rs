//! Command/response channel
//!
//! Discrete events go out over the command session:
//! - a frame to recognize
//! - a recorded voice query (audio, or text when transcribed locally)
//! - a typed text query
//! - control directives (`hello` on connect)
//!
//! Replies come back as an unordered stream of speech, recognition and
//! control responses. There is no request id: a reply cannot be matched to
//! the event that caused it, so handlers react to the reply alone.

mod command;
mod messages;
mod router;
mod voice;

pub use command::{ChannelError, CommandChannel, Pending};
pub use messages::{ControlDirective, Event, RecognitionResult, Response, ResponseError};
pub use router::ResponseRouter;
pub use voice::{VoiceQuery, VoiceSubmission};
