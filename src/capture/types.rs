use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::io::Cursor;
use std::time::Duration;

use super::source::CaptureError;
use crate::codec::{Message, MessageKind};

/// One captured camera image (JPEG bytes)
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Compressed image bytes
    pub data: Bytes,
    /// When the frame was captured
    pub captured_at: DateTime<Utc>,
    /// Camera that produced the frame
    pub source_id: String,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, source_id: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            captured_at: Utc::now(),
            source_id: source_id.into(),
        }
    }

    pub fn into_message(self) -> Message {
        Message::new(MessageKind::Frame, self.data)
    }
}

/// Fixed-duration block of audio (16-bit PCM, little-endian, interleaved)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Raw PCM bytes
    pub pcm: Bytes,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// When the chunk was captured
    pub captured_at: DateTime<Utc>,
}

impl AudioChunk {
    pub fn new(pcm: impl Into<Bytes>, sample_rate: u32, channels: u16) -> Self {
        Self {
            pcm: pcm.into(),
            sample_rate,
            channels,
            captured_at: Utc::now(),
        }
    }

    pub fn from_samples(samples: &[i16], sample_rate: u32, channels: u16) -> Self {
        let mut pcm = BytesMut::with_capacity(samples.len() * 2);
        for sample in samples {
            pcm.put_i16_le(*sample);
        }
        Self::new(pcm.freeze(), sample_rate, channels)
    }

    pub fn samples(&self) -> Vec<i16> {
        self.pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Samples per channel
    pub fn frame_count(&self) -> usize {
        self.pcm.len() / 2 / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate as f64)
    }

    pub fn into_message(self) -> Message {
        Message::new(MessageKind::Audio, self.pcm)
    }
}

/// One spoken utterance: the chunks captured between a start and a stop
#[derive(Debug, Clone)]
pub struct AudioClip {
    sample_rate: u32,
    channels: u16,
    chunks: Vec<AudioChunk>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AudioClip {
    pub fn new(sample_rate: u32, channels: u16, started_at: DateTime<Utc>) -> Self {
        Self {
            sample_rate,
            channels,
            chunks: Vec::new(),
            started_at,
            finished_at: started_at,
        }
    }

    /// Append a chunk; every chunk must share the clip's format
    pub fn push(&mut self, chunk: AudioChunk) -> Result<(), CaptureError> {
        if chunk.sample_rate != self.sample_rate || chunk.channels != self.channels {
            return Err(CaptureError::FormatMismatch {
                expected_rate: self.sample_rate,
                expected_channels: self.channels,
                rate: chunk.sample_rate,
                channels: chunk.channels,
            });
        }
        self.chunks.push(chunk);
        Ok(())
    }

    pub fn finish(mut self, finished_at: DateTime<Utc>) -> Self {
        self.finished_at = finished_at;
        self
    }

    pub fn chunks(&self) -> &[AudioChunk] {
        &self.chunks
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.pcm.is_empty())
    }

    /// Duration of the captured audio (not wall-clock time)
    pub fn duration(&self) -> Duration {
        self.chunks.iter().map(AudioChunk::duration).sum()
    }

    /// All chunks concatenated in capture order
    pub fn pcm(&self) -> Bytes {
        let total = self.chunks.iter().map(|c| c.pcm.len()).sum();
        let mut pcm = BytesMut::with_capacity(total);
        for chunk in &self.chunks {
            pcm.extend_from_slice(&chunk.pcm);
        }
        pcm.freeze()
    }

    /// Render as an in-memory 16-bit WAV file
    pub fn to_wav(&self) -> Result<Vec<u8>, CaptureError> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for chunk in &self.chunks {
                for sample in chunk.samples() {
                    writer.write_sample(sample)?;
                }
            }
            writer.finalize()?;
        }

        Ok(cursor.into_inner())
    }

    pub fn into_message(self) -> Message {
        Message::new(MessageKind::Audio, self.pcm())
    }
}

/// A sample pulled from a capture source
#[derive(Debug, Clone)]
pub enum Sample {
    Frame(Frame),
    Audio(AudioChunk),
}

impl Sample {
    pub fn into_message(self) -> Message {
        match self {
            Sample::Frame(frame) => frame.into_message(),
            Sample::Audio(chunk) => chunk.into_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_samples_roundtrip() {
        let samples = vec![100i16, -200, 300, i16::MIN, i16::MAX];
        let chunk = AudioChunk::from_samples(&samples, 16000, 1);
        assert_eq!(chunk.pcm.len(), samples.len() * 2);
        assert_eq!(chunk.samples(), samples);
    }

    #[test]
    fn test_chunk_duration() {
        // 100ms at 16kHz mono
        let chunk = AudioChunk::from_samples(&[0i16; 1600], 16000, 1);
        assert_eq!(chunk.duration(), Duration::from_millis(100));

        // Stereo: 1600 samples = 800 frames = 50ms
        let stereo = AudioChunk::from_samples(&[0i16; 1600], 16000, 2);
        assert_eq!(stereo.frame_count(), 800);
        assert_eq!(stereo.duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_clip_rejects_mismatched_format() {
        let mut clip = AudioClip::new(16000, 1, Utc::now());
        clip.push(AudioChunk::from_samples(&[1, 2], 16000, 1)).unwrap();

        let err = clip
            .push(AudioChunk::from_samples(&[1, 2], 44100, 1))
            .unwrap_err();
        assert!(matches!(err, CaptureError::FormatMismatch { rate: 44100, .. }));
        assert_eq!(clip.chunks().len(), 1);
    }

    #[test]
    fn test_clip_pcm_preserves_order() {
        let mut clip = AudioClip::new(16000, 1, Utc::now());
        clip.push(AudioChunk::from_samples(&[1, 2], 16000, 1)).unwrap();
        clip.push(AudioChunk::from_samples(&[3, 4], 16000, 1)).unwrap();

        let message = clip.clone().into_message();
        assert_eq!(message.kind, MessageKind::Audio);
        assert_eq!(&message.payload[..], &[1, 0, 2, 0, 3, 0, 4, 0]);
        assert_eq!(clip.pcm(), message.payload);
    }

    #[test]
    fn test_clip_to_wav() {
        let mut clip = AudioClip::new(16000, 1, Utc::now());
        clip.push(AudioChunk::from_samples(&[0i16; 1600], 16000, 1))
            .unwrap();

        let wav = clip.to_wav().unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 1600);
    }

    #[test]
    fn test_empty_clip() {
        let clip = AudioClip::new(16000, 1, Utc::now());
        assert!(clip.is_empty());
        assert_eq!(clip.duration(), Duration::ZERO);
    }
}
