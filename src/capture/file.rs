//! File-backed capture drivers, for running without hardware

use hound::WavReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::source::{AudioFeed, CaptureError, FrameFeed};
use super::types::{AudioChunk, Frame};

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()?;

        let duration_seconds =
            samples.len() as f64 / (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Cut into chunks of `chunk_samples` per channel; the last may be short
    pub fn chunks(&self, chunk_samples: usize) -> Vec<AudioChunk> {
        let step = chunk_samples.max(1) * self.channels.max(1) as usize;
        self.samples
            .chunks(step)
            .map(|samples| AudioChunk::from_samples(samples, self.sample_rate, self.channels))
            .collect()
    }
}

/// Replays a WAV file into an [`AudioFeed`] in real time
pub struct WavReplay {
    path: PathBuf,
    feed: AudioFeed,
    chunk_samples: usize,
    looped: bool,
}

impl WavReplay {
    pub fn new(path: impl Into<PathBuf>, feed: AudioFeed, chunk_samples: usize, looped: bool) -> Self {
        Self {
            path: path.into(),
            feed,
            chunk_samples,
            looped,
        }
    }

    pub async fn run(self, token: CancellationToken) -> Result<(), CaptureError> {
        let file = AudioFile::open(&self.path)?;
        if file.sample_rate != self.feed.sample_rate() || file.channels != self.feed.channels() {
            return Err(CaptureError::FormatMismatch {
                expected_rate: self.feed.sample_rate(),
                expected_channels: self.feed.channels(),
                rate: file.sample_rate,
                channels: file.channels,
            });
        }

        let chunks = file.chunks(self.chunk_samples);
        let Some(first) = chunks.first() else {
            info!("{} is empty, nothing to replay", file.path);
            return Ok(());
        };

        let mut ticker = tokio::time::interval(first.duration().max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            for chunk in &chunks {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    _ = ticker.tick() => {}
                }
                let mut chunk = chunk.clone();
                chunk.captured_at = chrono::Utc::now();
                self.feed.publish(chunk);
            }

            if !self.looped {
                info!("Finished replaying {}", file.path);
                return Ok(());
            }
        }
    }
}

/// Publishes one still image as a camera feed at a fixed interval
pub struct ImageReplay {
    path: PathBuf,
    feed: FrameFeed,
    source_id: String,
    interval: Duration,
}

impl ImageReplay {
    pub fn new(
        path: impl Into<PathBuf>,
        feed: FrameFeed,
        source_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            feed,
            source_id: source_id.into(),
            interval,
        }
    }

    pub async fn run(self, token: CancellationToken) -> Result<(), CaptureError> {
        let image = bytes::Bytes::from(tokio::fs::read(&self.path).await?);
        info!(
            "Replaying {} ({} bytes) as camera {}",
            self.path.display(),
            image.len(),
            self.source_id
        );

        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.feed.publish(Frame::new(image.clone(), self.source_id.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSource, Sample};

    fn write_wav(path: &Path, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_audio_file_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, &[1, 2, 3, 4, 5]);

        let file = AudioFile::open(&path).unwrap();
        assert_eq!(file.sample_rate, 16000);
        assert_eq!(file.samples.len(), 5);

        let chunks = file.chunks(2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].samples(), vec![5]);
    }

    #[test]
    fn test_audio_file_missing() {
        let result = AudioFile::open("/nonexistent/file.wav");
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wav_replay_publishes_all_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        write_wav(&path, &[0i16; 4800]);

        let feed = AudioFeed::new(16, 16000, 1);
        let mut source = feed.subscribe();
        let replay = WavReplay::new(&path, feed, 1600, false);

        replay.run(CancellationToken::new()).await.unwrap();

        let mut count = 0;
        while let Some(Sample::Audio(chunk)) = source.try_next().unwrap() {
            assert_eq!(chunk.samples().len(), 1600);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_wav_replay_rejects_other_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        write_wav(&path, &[0i16; 16]);

        let feed = AudioFeed::new(16, 44100, 2);
        let result = WavReplay::new(&path, feed, 160, false)
            .run(CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CaptureError::FormatMismatch { .. })));
    }
}
