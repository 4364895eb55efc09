use std::sync::Arc;
use tracing::{info, warn};

use super::command::{ChannelError, CommandChannel, Pending};
use super::messages::Event;
use crate::backend::Transcriber;
use crate::capture::AudioClip;
use crate::playback::PlaybackSink;

/// How a voice query left the device
#[derive(Debug)]
pub enum VoiceSubmission {
    /// Transcribed locally and sent as a text query
    Text { text: String, pending: Pending },
    /// Sent as raw audio for server-side recognition
    Audio { pending: Pending },
    /// Nothing usable was heard; the fallback message was queued
    Unrecognized { reason: String },
}

/// Turns recorded utterances into queries
pub struct VoiceQuery {
    transcriber: Option<Arc<dyn Transcriber>>,
    playback: Arc<PlaybackSink>,
    fallback_message: String,
}

impl VoiceQuery {
    pub fn new(
        transcriber: Option<Arc<dyn Transcriber>>,
        playback: Arc<PlaybackSink>,
        fallback_message: impl Into<String>,
    ) -> Self {
        Self {
            transcriber,
            playback,
            fallback_message: fallback_message.into(),
        }
    }

    pub async fn submit(
        &self,
        channel: &CommandChannel,
        clip: AudioClip,
    ) -> Result<VoiceSubmission, ChannelError> {
        if clip.is_empty() {
            return Ok(self.unrecognized("no audio recorded".to_string()));
        }

        let Some(transcriber) = &self.transcriber else {
            info!(
                "Sending voice query as audio ({:.1}s)",
                clip.duration().as_secs_f64()
            );
            let pending = channel.submit(Event::VoiceQuery(clip))?;
            return Ok(VoiceSubmission::Audio { pending });
        };

        match transcriber.transcribe(&clip).await {
            Ok(text) => {
                info!("Voice query transcribed: {}", text);
                let pending = channel.submit(Event::TextQuery(text.clone()))?;
                Ok(VoiceSubmission::Text { text, pending })
            }
            Err(e) => Ok(self.unrecognized(e.to_string())),
        }
    }

    fn unrecognized(&self, reason: String) -> VoiceSubmission {
        warn!("Voice query not recognized: {}", reason);
        self.playback.speak(self.fallback_message.clone());
        VoiceSubmission::Unrecognized { reason }
    }
}
