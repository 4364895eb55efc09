//! Capture data model and sources
//!
//! - [`Frame`], [`AudioChunk`], [`AudioClip`]: captured data
//! - [`CaptureSource`]: what a stream publisher samples
//! - [`FrameFeed`] / [`AudioFeed`]: shared feeds written by a capture driver
//!   and read by publishers, the command channel and the clip recorder
//! - [`CommandCapture`]: runs an external capture program
//! - [`WavReplay`] / [`ImageReplay`]: replay files instead of hardware

mod command;
mod file;
mod source;
mod types;

pub use command::{next_jpeg, CaptureOutput, CommandCapture};
pub use file::{AudioFile, ImageReplay, WavReplay};
pub use source::{
    AudioFeed, AudioSource, CaptureError, CaptureSource, ClipRecorder, FrameFeed, FrameSource,
};
pub use types::{AudioChunk, AudioClip, Frame, Sample};
