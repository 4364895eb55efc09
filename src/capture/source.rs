use chrono::Utc;
use std::io;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::{AudioChunk, AudioClip, Frame, Sample};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to start capture program `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("capture I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("capture feed closed")]
    Closed,

    /// The driver's retry policy is exhausted; the device cannot continue
    #[error("{name} capture unavailable after {attempts} attempt(s): {reason}")]
    Unavailable {
        name: String,
        attempts: u32,
        reason: String,
    },

    #[error(
        "audio format mismatch: expected {expected_rate}Hz/{expected_channels}ch, got {rate}Hz/{channels}ch"
    )]
    FormatMismatch {
        expected_rate: u32,
        expected_channels: u16,
        rate: u32,
        channels: u16,
    },

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Something a stream publisher can sample
///
/// Implementations never block: `Ok(None)` means nothing new is ready and
/// the caller should skip this tick.
pub trait CaptureSource: Send {
    fn try_next(&mut self) -> Result<Option<Sample>, CaptureError>;
}

/// Latest-value camera feed
///
/// The capture driver overwrites the current frame; readers only ever see the
/// newest one, so a slow consumer never builds a backlog.
#[derive(Debug, Clone)]
pub struct FrameFeed {
    tx: watch::Sender<Option<Frame>>,
}

impl FrameFeed {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, frame: Frame) {
        self.tx.send_replace(Some(frame));
    }

    /// Most recent frame, if any was captured yet
    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }

    /// Source yielding each new frame once (frames already seen are skipped)
    pub fn subscribe(&self) -> FrameSource {
        FrameSource {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for FrameFeed {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FrameSource {
    rx: watch::Receiver<Option<Frame>>,
}

impl CaptureSource for FrameSource {
    fn try_next(&mut self) -> Result<Option<Sample>, CaptureError> {
        match self.rx.has_changed() {
            Ok(true) => Ok(self.rx.borrow_and_update().clone().map(Sample::Frame)),
            Ok(false) => Ok(None),
            Err(_) => Err(CaptureError::Closed),
        }
    }
}

/// Fan-out microphone feed
///
/// Each subscriber gets every chunk in order, up to the feed capacity; a
/// subscriber that falls further behind loses its oldest chunks.
#[derive(Debug, Clone)]
pub struct AudioFeed {
    tx: broadcast::Sender<AudioChunk>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFeed {
    pub fn new(capacity: usize, sample_rate: u32, channels: u16) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sample_rate,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn publish(&self, chunk: AudioChunk) {
        // No subscribers is not an error: nobody is listening right now
        let _ = self.tx.send(chunk);
    }

    pub fn subscribe(&self) -> AudioSource {
        AudioSource {
            rx: self.tx.subscribe(),
        }
    }

    /// Start collecting chunks into a clip until [`ClipRecorder::stop`]
    pub fn record(&self) -> ClipRecorder {
        ClipRecorder::start(self)
    }
}

pub struct AudioSource {
    rx: broadcast::Receiver<AudioChunk>,
}

impl CaptureSource for AudioSource {
    fn try_next(&mut self) -> Result<Option<Sample>, CaptureError> {
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => return Ok(Some(Sample::Audio(chunk))),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!("Audio source lagged, skipped {} chunk(s)", skipped);
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(CaptureError::Closed),
            }
        }
    }
}

/// Records one utterance from an [`AudioFeed`]
///
/// The clip covers exactly the chunks published between `start` and `stop`.
pub struct ClipRecorder {
    token: CancellationToken,
    task: JoinHandle<AudioClip>,
}

impl ClipRecorder {
    pub fn start(feed: &AudioFeed) -> Self {
        let mut rx = feed.tx.subscribe();
        let mut clip = AudioClip::new(feed.sample_rate, feed.channels, Utc::now());
        let token = CancellationToken::new();
        let stop = token.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(chunk) => push_chunk(&mut clip, chunk),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Clip recorder fell behind, lost {} chunk(s)", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            // Chunks already published before stop belong to the clip
            while let Ok(chunk) = rx.try_recv() {
                push_chunk(&mut clip, chunk);
            }

            clip.finish(Utc::now())
        });

        Self { token, task }
    }

    pub async fn stop(self) -> Result<AudioClip, CaptureError> {
        self.token.cancel();
        self.task
            .await
            .map_err(|e| CaptureError::Io(io::Error::other(e)))
    }
}

fn push_chunk(clip: &mut AudioClip, chunk: AudioChunk) {
    if let Err(e) = clip.push(chunk) {
        warn!("Dropping chunk from clip: {}", e);
    }
}
