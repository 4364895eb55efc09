//! Capture drivers backed by an external program's stdout
//!
//! Camera programs are expected to write an MJPEG stream (concatenated JPEG
//! images); microphone programs raw s16le PCM.

use bytes::{Buf, Bytes, BytesMut};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::source::{AudioFeed, CaptureError, FrameFeed};
use super::types::{AudioChunk, Frame};
use crate::transport::RetryPolicy;

const READ_BUFFER: usize = 64 * 1024;

/// A partial JPEG larger than this is discarded as garbage
const MAX_JPEG_LEN: usize = 8 * 1024 * 1024;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Where a capture program's output goes
#[derive(Debug, Clone)]
pub enum CaptureOutput {
    /// MJPEG split into frames
    Frames { feed: FrameFeed, source_id: String },
    /// PCM cut into fixed-size chunks
    Audio { feed: AudioFeed, chunk_samples: usize },
}

/// Runs a capture program and publishes what it produces
///
/// The program is restarted when it exits or fails to start. A run that
/// produced data resets the failure count; once the retry policy is exhausted
/// the driver reports [`CaptureError::Unavailable`].
#[derive(Debug, Clone)]
pub struct CommandCapture {
    name: String,
    program: String,
    args: Vec<String>,
    output: CaptureOutput,
    retry: RetryPolicy,
}

enum RunEnd {
    Cancelled,
    Exited { produced: u64, reason: String },
}

impl CommandCapture {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        output: CaptureOutput,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            output,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until cancelled (Ok) or until the program cannot be kept alive
    pub async fn run(self, token: CancellationToken) -> Result<(), CaptureError> {
        let mut failures: u32 = 0;

        loop {
            let reason = match self.run_once(&token).await {
                Ok(RunEnd::Cancelled) => {
                    info!("{} capture stopped", self.name);
                    return Ok(());
                }
                Ok(RunEnd::Exited { produced, reason }) => {
                    if produced > 0 {
                        failures = 0;
                    }
                    reason
                }
                Err(e) => e.to_string(),
            };

            failures += 1;
            if self.retry.is_exhausted(failures) {
                error!(
                    "{} capture failed {} time(s), giving up: {}",
                    self.name, failures, reason
                );
                return Err(CaptureError::Unavailable {
                    name: self.name.clone(),
                    attempts: failures,
                    reason,
                });
            }

            let delay = self.retry.delay_after(failures);
            warn!(
                "{} capture interrupted ({}), restarting in {:?}",
                self.name, reason, delay
            );

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_once(&self, token: &CancellationToken) -> Result<RunEnd, CaptureError> {
        if token.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            CaptureError::Io(std::io::Error::other("capture program has no stdout"))
        })?;

        info!("{} capture started: {} {:?}", self.name, self.program, self.args);

        let mut buf = BytesMut::with_capacity(READ_BUFFER);
        let mut produced: u64 = 0;

        loop {
            let read = tokio::select! {
                _ = token.cancelled() => {
                    let _ = child.kill().await;
                    return Ok(RunEnd::Cancelled);
                }
                read = stdout.read_buf(&mut buf) => read?,
            };

            if read == 0 {
                break;
            }
            produced += self.drain(&mut buf);
        }

        let status = child.wait().await?;
        debug!(
            "{} capture program exited with {} after {} sample(s)",
            self.name, status, produced
        );

        Ok(RunEnd::Exited {
            produced,
            reason: format!("capture program exited with {}", status),
        })
    }

    /// Publish every complete sample in `buf`, returning how many
    fn drain(&self, buf: &mut BytesMut) -> u64 {
        let mut count = 0;

        match &self.output {
            CaptureOutput::Frames { feed, source_id } => {
                while let Some(jpeg) = next_jpeg(buf) {
                    feed.publish(Frame::new(jpeg, source_id.clone()));
                    count += 1;
                }
                if buf.len() > MAX_JPEG_LEN {
                    warn!(
                        "{} capture: discarding {} bytes without an end-of-image marker",
                        self.name,
                        buf.len()
                    );
                    buf.clear();
                }
            }
            CaptureOutput::Audio {
                feed,
                chunk_samples,
            } => {
                let chunk_bytes = (*chunk_samples).max(1) * feed.channels().max(1) as usize * 2;
                while buf.len() >= chunk_bytes {
                    let pcm = buf.split_to(chunk_bytes).freeze();
                    feed.publish(AudioChunk::new(pcm, feed.sample_rate(), feed.channels()));
                    count += 1;
                }
            }
        }

        count
    }
}

/// Split the next complete JPEG off the front of an MJPEG buffer
///
/// Bytes before the first start-of-image marker are discarded. Embedded EXIF
/// thumbnails are not handled.
pub fn next_jpeg(buf: &mut BytesMut) -> Option<Bytes> {
    let Some(start) = find(buf, &SOI) else {
        // Keep a trailing 0xFF: it may be the first half of a marker
        let keep = usize::from(buf.last() == Some(&0xFF));
        let discard = buf.len() - keep;
        buf.advance(discard);
        return None;
    };
    buf.advance(start);

    let end = find(&buf[SOI.len()..], &EOI)? + SOI.len() + EOI.len();
    Some(buf.split_to(end).freeze())
}

fn find(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut out = SOI.to_vec();
        out.extend_from_slice(body);
        out.extend_from_slice(&EOI);
        out
    }

    #[test]
    fn test_next_jpeg_splits_stream() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&jpeg(&[1, 2, 3]));
        stream.extend_from_slice(&jpeg(&[4, 5]));
        let mut buf = BytesMut::from(&stream[..]);

        assert_eq!(next_jpeg(&mut buf).unwrap(), Bytes::from(jpeg(&[1, 2, 3])));
        assert_eq!(next_jpeg(&mut buf).unwrap(), Bytes::from(jpeg(&[4, 5])));
        assert!(next_jpeg(&mut buf).is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_next_jpeg_waits_for_end_marker() {
        let full = jpeg(&[9, 9, 9]);
        let mut buf = BytesMut::from(&full[..4]);

        assert!(next_jpeg(&mut buf).is_none());
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(&full[4..]);
        assert_eq!(next_jpeg(&mut buf).unwrap(), Bytes::from(full));
    }

    #[test]
    fn test_next_jpeg_skips_garbage() {
        let mut stream = vec![0x00, 0x11, 0x22];
        stream.extend_from_slice(&jpeg(&[7]));
        let mut buf = BytesMut::from(&stream[..]);

        assert_eq!(next_jpeg(&mut buf).unwrap(), Bytes::from(jpeg(&[7])));
    }

    #[test]
    fn test_next_jpeg_keeps_split_marker() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0xFF][..]);
        assert!(next_jpeg(&mut buf).is_none());
        assert_eq!(&buf[..], &[0xFF]);

        buf.extend_from_slice(&[0xD8, 5, 0xFF, 0xD9]);
        assert_eq!(
            next_jpeg(&mut buf).unwrap(),
            Bytes::from_static(&[0xFF, 0xD8, 5, 0xFF, 0xD9])
        );
    }

    #[test]
    fn test_pcm_drain_cuts_fixed_chunks() {
        let feed = AudioFeed::new(8, 16000, 1);
        let mut source = feed.subscribe();
        let capture = CommandCapture::new(
            "microphone",
            "true",
            Vec::new(),
            CaptureOutput::Audio {
                feed: feed.clone(),
                chunk_samples: 2,
            },
            RetryPolicy::default(),
        );

        let mut buf = BytesMut::from(&[1u8, 0, 2, 0, 3, 0, 4, 0, 5][..]);
        assert_eq!(capture.drain(&mut buf), 2);
        assert_eq!(buf.len(), 1);

        use crate::capture::{CaptureSource, Sample};
        match source.try_next().unwrap() {
            Some(Sample::Audio(chunk)) => assert_eq!(chunk.samples(), vec![1, 2]),
            other => panic!("expected audio chunk, got {:?}", other),
        }
    }
}
