use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::renderer::{PlaybackContent, PlaybackRequest, Renderer};
use crate::backend::BackendError;

/// Playback counters at a point in time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybackStats {
    /// Requests waiting behind the current one
    pub queued: usize,
    /// Whether a request is rendering right now
    pub rendering: bool,
    pub rendered: u64,
    pub failed: u64,
    /// Fallback messages spoken after a synthesis failure
    pub fallbacks: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    rendering: AtomicBool,
    rendered: AtomicU64,
    failed: AtomicU64,
    fallbacks: AtomicU64,
}

/// Serializes speech and audio playback
///
/// Requests render one at a time in arrival order. Enqueueing never blocks.
pub struct PlaybackSink {
    tx: mpsc::UnboundedSender<PlaybackRequest>,
    token: CancellationToken,
    counters: Arc<Counters>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackSink {
    /// Spawn the playback worker
    ///
    /// `fallback_message` is spoken once when synthesizing a text request
    /// fails.
    pub fn start(renderer: Arc<dyn Renderer>, fallback_message: Option<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            renderer,
            fallback_message,
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(worker.run(rx, token.clone()));

        Self {
            tx,
            token,
            counters,
            task: Mutex::new(Some(task)),
        }
    }

    /// Append a request; returns false once the sink has stopped
    pub fn enqueue(&self, request: PlaybackRequest) -> bool {
        if self.token.is_cancelled() {
            debug!("Playback stopped, dropping request");
            return false;
        }

        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(request).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn speak(&self, text: impl Into<String>) -> bool {
        self.enqueue(PlaybackRequest::text(text))
    }

    /// Stop the worker; an in-progress render is abandoned
    pub async fn stop(&self) {
        self.token.cancel();

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Playback task panicked: {}", e);
            }
            info!("Playback stopped");
        }
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            queued: self.counters.queued.load(Ordering::SeqCst),
            rendering: self.counters.rendering.load(Ordering::SeqCst),
            rendered: self.counters.rendered.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            fallbacks: self.counters.fallbacks.load(Ordering::SeqCst),
        }
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Worker {
    renderer: Arc<dyn Renderer>,
    fallback_message: Option<String>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PlaybackRequest>, token: CancellationToken) {
        loop {
            let request = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);

            let waited = chrono::Utc::now().signed_duration_since(request.enqueued_at);
            debug!("Rendering playback request (waited {}ms)", waited.num_milliseconds());

            self.counters.rendering.store(true, Ordering::SeqCst);
            let finished = tokio::select! {
                biased;
                _ = token.cancelled() => false,
                _ = self.play(&request.content) => true,
            };
            self.counters.rendering.store(false, Ordering::SeqCst);

            if !finished {
                break;
            }
        }

        rx.close();
        self.counters.queued.store(0, Ordering::SeqCst);
    }

    async fn play(&self, content: &PlaybackContent) {
        match self.renderer.render(content).await {
            Ok(()) => {
                self.counters.rendered.fetch_add(1, Ordering::SeqCst);
            }
            Err(BackendError::Synthesis(reason)) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!("Speech synthesis failed: {}", reason);
                self.play_fallback(content).await;
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!("Playback failed: {}", e);
            }
        }
    }

    async fn play_fallback(&self, failed: &PlaybackContent) {
        let Some(fallback) = &self.fallback_message else {
            return;
        };
        if matches!(failed, PlaybackContent::Text(text) if text == fallback) {
            return;
        }

        self.counters.fallbacks.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self
            .renderer
            .render(&PlaybackContent::Text(fallback.clone()))
            .await
        {
            error!("Fallback message failed as well: {}", e);
        }
    }
}
