use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ticker::Ticker;
use crate::capture::{CaptureError, CaptureSource};
use crate::transport::{SessionError, TransportSession};

/// What a publisher does when a send fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendFailurePolicy {
    /// Reconnect the session (per its retry policy), then keep sampling
    #[default]
    Reconnect,
    /// Drop the sample and keep sampling; someone else owns reconnection
    Drop,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Name used in logs and stats ("camera", "microphone")
    pub name: String,
    pub on_send_failure: SendFailurePolicy,
}

/// Publisher counters at a point in time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublisherStats {
    pub name: String,
    pub running: bool,
    /// Ticks observed
    pub ticks: u64,
    /// Samples written to the session
    pub sent: u64,
    /// Ticks with no new sample
    pub skipped: u64,
    /// Samples lost to a failed or disconnected session
    pub dropped: u64,
    /// Successful reconnects
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    sent: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

/// Samples a capture source at a fixed rate and streams it over a session
///
/// Under [`SendFailurePolicy::Reconnect`] reconnects within one failure
/// streak are spaced by the session's retry policy; samples captured while
/// waiting are dropped.
pub struct StreamPublisher {
    name: String,
    token: CancellationToken,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamPublisher {
    /// Spawn the publishing loop
    pub fn start<S, T>(
        source: S,
        session: Arc<TransportSession>,
        ticker: T,
        config: PublisherConfig,
    ) -> Self
    where
        S: CaptureSource + 'static,
        T: Ticker + 'static,
    {
        let token = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        info!(
            "Starting {} publisher on session {} (on send failure: {:?})",
            config.name,
            session.name(),
            config.on_send_failure
        );

        let worker = Worker {
            name: config.name.clone(),
            policy: config.on_send_failure,
            session,
            counters: Arc::clone(&counters),
            token: token.clone(),
            failing: false,
            reconnect_streak: 0,
            next_reconnect: None,
            reconnected_at: None,
        };
        let task_running = Arc::clone(&running);
        let task = tokio::spawn(async move {
            worker.run(source, ticker).await;
            task_running.store(false, Ordering::SeqCst);
        });

        Self {
            name: config.name,
            token,
            running,
            counters,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Halt the loop. Once this returns the publisher sends nothing more.
    pub async fn stop(&self) {
        self.token.cancel();

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("{} publisher task panicked: {}", self.name, e);
            }
            info!("{} publisher stopped", self.name);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            name: self.name.clone(),
            running: self.is_running(),
            ticks: self.counters.ticks.load(Ordering::SeqCst),
            sent: self.counters.sent.load(Ordering::SeqCst),
            skipped: self.counters.skipped.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
            reconnects: self.counters.reconnects.load(Ordering::SeqCst),
        }
    }
}

impl Drop for StreamPublisher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Worker {
    name: String,
    policy: SendFailurePolicy,
    session: Arc<TransportSession>,
    counters: Arc<Counters>,
    token: CancellationToken,
    /// Inside a streak of failed sends
    failing: bool,
    /// Reconnect attempts since the link last proved stable
    reconnect_streak: u32,
    next_reconnect: Option<Instant>,
    reconnected_at: Option<Instant>,
}

impl Worker {
    async fn run<S: CaptureSource, T: Ticker>(mut self, mut source: S, mut ticker: T) {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.counters.ticks.fetch_add(1, Ordering::SeqCst);

            let sample = match source.try_next() {
                Ok(Some(sample)) => sample,
                Ok(None) => {
                    self.counters.skipped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                Err(CaptureError::Closed) => {
                    warn!("{} source closed, publisher exiting", self.name);
                    break;
                }
                Err(e) => {
                    debug!("{} source error: {}", self.name, e);
                    self.counters.skipped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
            };

            if !self.session.is_connected() {
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                self.on_failure(&SessionError::NotConnected);
                if !self.recover().await {
                    break;
                }
                continue;
            }

            // Dropping an in-flight send is safe: the framed writer keeps any
            // unwritten bytes of the message for the next flush.
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                result = self.session.send(sample.into_message()) => result,
            };

            match result {
                Ok(()) => {
                    self.counters.sent.fetch_add(1, Ordering::SeqCst);
                    if self.failing {
                        self.failing = false;
                        info!("{} publisher recovered", self.name);
                    }
                    self.settle();
                }
                Err(SessionError::Rejected(e)) => {
                    self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                    warn!("{} sample rejected: {}", self.name, e);
                }
                Err(e) => {
                    self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                    self.on_failure(&e);
                    if !self.recover().await {
                        break;
                    }
                }
            }
        }

        debug!("{} publisher loop exited", self.name);
    }

    /// Warn once per streak; the rest of the streak only at debug level
    fn on_failure(&mut self, error: &SessionError) {
        if self.failing {
            debug!("{} send failed: {}", self.name, error);
        } else {
            self.failing = true;
            warn!("{} send failed: {}", self.name, error);
        }
    }

    /// Apply the failure policy; false when cancelled meanwhile
    async fn recover(&mut self) -> bool {
        if self.policy == SendFailurePolicy::Drop {
            return !self.token.is_cancelled();
        }

        if self.next_reconnect.is_some_and(|at| Instant::now() < at) {
            return !self.token.is_cancelled();
        }

        let connected = tokio::select! {
            biased;
            _ = self.token.cancelled() => return false,
            result = self.session.connect() => result,
        };

        self.reconnect_streak += 1;
        let backoff = self.session.retry_policy().delay_after(self.reconnect_streak);
        let now = Instant::now();
        self.next_reconnect = Some(now + backoff);

        match connected {
            Ok(_) => {
                self.counters.reconnects.fetch_add(1, Ordering::SeqCst);
                self.reconnected_at = Some(now);
                if self.reconnect_streak == 1 {
                    info!("{} publisher reconnected to {}", self.name, self.session.name());
                } else {
                    debug!(
                        "{} publisher reconnected to {} (attempt {} in a row)",
                        self.name,
                        self.session.name(),
                        self.reconnect_streak
                    );
                }
            }
            Err(e) => debug!(
                "{} reconnect failed: {}; next attempt in {:?}",
                self.name, e, backoff
            ),
        }
        true
    }

    /// End the reconnect streak once a link outlives the backoff it earned
    fn settle(&mut self) {
        if self.reconnect_streak == 0 {
            return;
        }
        let earned = self.session.retry_policy().delay_after(self.reconnect_streak);
        let stable = self
            .reconnected_at
            .map_or(true, |at| at.elapsed() >= earned);
        if stable {
            self.reconnect_streak = 0;
            self.next_reconnect = None;
            self.reconnected_at = None;
        }
    }
}
