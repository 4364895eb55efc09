// Shared helpers for integration tests
//
// In-memory dialers, a scripted capture source and a recording renderer.

#![allow(dead_code)]

use async_trait::async_trait;
use classroom_link::backend::BackendError;
use classroom_link::capture::{CaptureError, CaptureSource, Frame, Sample};
use classroom_link::codec::{FrameCodec, DEFAULT_MAX_MESSAGE_LEN};
use classroom_link::playback::{PlaybackContent, Renderer};
use classroom_link::transport::{Dialer, Link};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

pub type ServerConn = Framed<DuplexStream, FrameCodec>;

/// Dialer that refuses every connection attempt
#[derive(Default)]
pub struct RefusingDialer {
    attempts: AtomicU32,
}

impl RefusingDialer {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for RefusingDialer {
    async fn dial(&self) -> io::Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))
    }

    fn target(&self) -> String {
        "refusing".to_string()
    }
}

/// Dialer backed by in-memory pipes; the server end of every connection is
/// handed to the test through a channel
pub struct PairDialer {
    codec: FrameCodec,
    buffer: usize,
    attempts: AtomicU32,
    servers: mpsc::UnboundedSender<DuplexStream>,
}

impl PairDialer {
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        Self::with_codec(buffer, FrameCodec::default())
    }

    pub fn with_codec(
        buffer: usize,
        codec: FrameCodec,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            codec,
            buffer,
            attempts: AtomicU32::new(0),
            servers,
        });
        (dialer, rx)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for PairDialer {
    async fn dial(&self) -> io::Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(self.buffer);
        self.servers
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no server"))?;
        Ok(Link::from_stream(client, self.codec))
    }

    fn target(&self) -> String {
        "duplex".to_string()
    }
}

/// Frame the server end of an in-memory connection
pub fn server_conn(stream: DuplexStream) -> ServerConn {
    Framed::new(stream, FrameCodec::new(DEFAULT_MAX_MESSAGE_LEN))
}

/// Next server end, failing the test if none shows up in time
pub async fn accept(servers: &mut mpsc::UnboundedReceiver<DuplexStream>) -> DuplexStream {
    tokio::time::timeout(Duration::from_secs(5), servers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("dialer dropped")
}

/// Capture source that always has a fresh frame
pub struct EndlessFrames {
    pub size: usize,
}

impl CaptureSource for EndlessFrames {
    fn try_next(&mut self) -> Result<Option<Sample>, CaptureError> {
        Ok(Some(Sample::Frame(Frame::new(vec![0xAB; self.size], "test"))))
    }
}

/// Renderer that records what it rendered and how many renders overlapped
#[derive(Default)]
pub struct RecordingRenderer {
    pub rendered: Mutex<Vec<PlaybackContent>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub delay: Duration,
    /// Text requests equal to this fail with a synthesis error
    pub fail_text: Option<String>,
}

impl RecordingRenderer {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing_on(text: &str) -> Self {
        Self {
            fail_text: Some(text.to_string()),
            ..Default::default()
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.rendered
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                PlaybackContent::Text(text) => Some(text.clone()),
                PlaybackContent::Audio(_) => None,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.rendered.lock().unwrap().len()
    }
}

#[async_trait]
impl Renderer for RecordingRenderer {
    async fn render(&self, content: &PlaybackContent) -> Result<(), BackendError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match (content, &self.fail_text) {
            (PlaybackContent::Text(text), Some(fail)) if text == fail => {
                Err(BackendError::Synthesis(format!("cannot synthesize `{}`", text)))
            }
            _ => {
                self.rendered.lock().unwrap().push(content.clone());
                Ok(())
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
