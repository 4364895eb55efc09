use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::backend::{AudioOutput, BackendError, Synthesizer};

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackContent {
    /// Text to synthesize and speak
    Text(String),
    /// WAV audio to play as is
    Audio(Bytes),
}

#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub content: PlaybackContent,
    pub enqueued_at: DateTime<Utc>,
}

impl PlaybackRequest {
    pub fn new(content: PlaybackContent) -> Self {
        Self {
            content,
            enqueued_at: Utc::now(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(PlaybackContent::Text(text.into()))
    }

    pub fn audio(audio: impl Into<Bytes>) -> Self {
        Self::new(PlaybackContent::Audio(audio.into()))
    }
}

/// Renders one playback request to completion
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, content: &PlaybackContent) -> Result<(), BackendError>;
}

/// Text-to-speech followed by audio output
pub struct SpeechRenderer {
    synthesizer: Arc<dyn Synthesizer>,
    output: Arc<dyn AudioOutput>,
}

impl SpeechRenderer {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            synthesizer,
            output,
        }
    }
}

#[async_trait]
impl Renderer for SpeechRenderer {
    async fn render(&self, content: &PlaybackContent) -> Result<(), BackendError> {
        let audio = match content {
            PlaybackContent::Text(text) => self.synthesizer.synthesize(text).await?,
            PlaybackContent::Audio(audio) => audio.clone(),
        };
        self.output.play(audio).await
    }
}
