//! Playback of spoken replies and audio
//!
//! A single worker renders [`PlaybackRequest`]s in FIFO order, each to
//! completion before the next begins. There is no coalescing and a playing
//! request is never interrupted by a newer one.

mod renderer;
mod sink;

pub use renderer::{PlaybackContent, PlaybackRequest, Renderer, SpeechRenderer};
pub use sink::{PlaybackSink, PlaybackStats};
