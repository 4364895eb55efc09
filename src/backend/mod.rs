//! Speech backends
//!
//! The device never does speech processing itself. It talks to:
//! - a [`Transcriber`] (speech-to-text) for local voice queries
//! - a [`Synthesizer`] (text-to-speech) for spoken replies
//! - an [`AudioOutput`] that plays rendered audio to completion
//!
//! The command implementations drive external programs over stdin/stdout.

mod command;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::capture::AudioClip;

pub use command::{CommandPlayer, CommandSpec, CommandSynthesizer, CommandTranscriber};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("speech recognition failed: {0}")]
    Recognition(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("audio output failed: {0}")]
    Output(String),
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Turn a recorded clip into text
    async fn transcribe(&self, clip: &AudioClip) -> Result<String, BackendError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Render text as a WAV buffer
    async fn synthesize(&self, text: &str) -> Result<Bytes, BackendError>;
}

#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play a WAV buffer, returning once playback has finished
    async fn play(&self, audio: Bytes) -> Result<(), BackendError>;
}
