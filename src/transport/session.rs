use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::link::{Dialer, Link, LinkReader, LinkWriter};
use super::retry::RetryPolicy;
use crate::codec::{CodecError, Message};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    /// Retries exhausted (bounded policy) or connect aborted by `close()`
    #[error("failed to connect to {target} after {attempts} attempt(s): {reason}")]
    Connection {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("session is not connected")]
    NotConnected,

    /// The peer violated the framing protocol; the connection was dropped
    #[error("protocol violation: {0}")]
    Protocol(CodecError),

    /// The outgoing message was refused before anything was written
    #[error("message rejected: {0}")]
    Rejected(CodecError),
}

impl SessionError {
    /// Whether the error means the connection is gone (reconnect needed)
    pub fn is_disconnect(&self) -> bool {
        !matches!(self, SessionError::Rejected(_))
    }
}

/// Connection state machine
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Disconnected (close)
///                     |             \-----> Failed (transport error)
///                     \-> Failed (retries exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone)]
struct SessionStatus {
    state: SessionState,
    retry_count: u32,
    last_activity: Option<DateTime<Utc>>,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            retry_count: 0,
            last_activity: None,
            connected_at: None,
            last_error: None,
        }
    }
}

/// Point-in-time view of a transport session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub target: String,
    pub state: SessionState,

    /// Failed attempts during the current (or last) connect
    pub retry_count: u32,

    pub last_activity: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// One logical connection to the server
///
/// The read and write directions are held behind separate locks: writers are
/// serialized with each other (one whole message at a time) while a reader
/// never waits on a writer. State changes are broadcast over a watch channel
/// so that a blocked `send`/`receive` returns as soon as the session leaves
/// `Connected`, whichever task caused it.
pub struct TransportSession {
    name: String,
    dialer: Arc<dyn Dialer>,
    retry: RetryPolicy,
    writer: Mutex<Option<Box<dyn LinkWriter>>>,
    reader: Mutex<Option<Box<dyn LinkReader>>>,
    connect_lock: Mutex<()>,
    status: watch::Sender<SessionStatus>,
    sent: AtomicU64,
    received: AtomicU64,
}

impl TransportSession {
    pub fn new(name: impl Into<String>, dialer: Arc<dyn Dialer>, retry: RetryPolicy) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());

        Self {
            name: name.into(),
            dialer,
            retry,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            connect_lock: Mutex::new(()),
            status,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Number of messages written successfully over the session's lifetime
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> SessionInfo {
        let status = self.status.borrow().clone();

        SessionInfo {
            name: self.name.clone(),
            target: self.dialer.target(),
            state: status.state,
            retry_count: status.retry_count,
            last_activity: status.last_activity,
            connected_at: status.connected_at,
            last_error: status.last_error,
            messages_sent: self.sent_count(),
            messages_received: self.received_count(),
        }
    }

    /// Connect, retrying per the session's policy
    ///
    /// Concurrent callers are serialized; a caller that finds the session
    /// already connected returns immediately. `close()` aborts a connect in
    /// progress, including its retry delay.
    pub async fn connect(&self) -> Result<SessionInfo, SessionError> {
        let _guard = self.connect_lock.lock().await;

        if self.is_connected() {
            return Ok(self.info());
        }

        self.status.send_modify(|s| {
            s.state = SessionState::Connecting;
            s.retry_count = 0;
        });
        let _connecting = ConnectingGuard {
            status: &self.status,
        };

        let target = self.dialer.target();
        let mut state_rx = self.status.subscribe();
        info!(session = %self.name, "Connecting to {}", target);

        let mut attempts: u32 = 0;
        loop {
            let dialed = tokio::select! {
                result = self.dialer.dial() => Some(result),
                _ = wait_until(&mut state_rx, |s| s != SessionState::Connecting) => None,
            };

            let result = match dialed {
                Some(result) => result,
                None => return Err(self.aborted(&target, attempts)),
            };

            match result {
                Ok(link) => {
                    self.install(link).await;

                    let now = Utc::now();
                    let connected = self.status.send_if_modified(|s| {
                        if s.state != SessionState::Connecting {
                            return false;
                        }
                        s.state = SessionState::Connected;
                        s.retry_count = attempts;
                        s.connected_at = Some(now);
                        s.last_activity = Some(now);
                        s.last_error = None;
                        true
                    });

                    if !connected {
                        self.writer.lock().await.take();
                        self.reader.lock().await.take();
                        return Err(self.aborted(&target, attempts + 1));
                    }

                    info!(
                        session = %self.name,
                        "Connected to {} after {} failed attempt(s)",
                        target, attempts
                    );
                    return Ok(self.info());
                }
                Err(e) => {
                    attempts += 1;
                    let reason = e.to_string();
                    self.status.send_modify(|s| {
                        s.retry_count = attempts;
                        s.last_error = Some(reason.clone());
                    });

                    if attempts == 1 {
                        warn!(session = %self.name, "Connection to {} failed: {}", target, reason);
                    } else {
                        debug!(
                            session = %self.name,
                            "Connection attempt {} to {} failed: {}",
                            attempts, target, reason
                        );
                    }

                    if self.retry.is_exhausted(attempts) {
                        self.status.send_if_modified(|s| {
                            if s.state != SessionState::Connecting {
                                return false;
                            }
                            s.state = SessionState::Failed;
                            true
                        });
                        warn!(
                            session = %self.name,
                            "Giving up on {} after {} attempt(s)",
                            target, attempts
                        );
                        return Err(SessionError::Connection {
                            target,
                            attempts,
                            reason,
                        });
                    }

                    let delay = self.retry.delay_after(attempts);
                    let closed = tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        _ = wait_until(&mut state_rx, |s| s != SessionState::Connecting) => true,
                    };
                    if closed {
                        return Err(self.aborted(&target, attempts));
                    }
                }
            }
        }
    }

    /// Write one message; no other writer can interleave with it
    pub async fn send(&self, message: Message) -> Result<(), SessionError> {
        let mut state_rx = self.status.subscribe();
        let mut writer_slot = self.writer.lock().await;

        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let Some(writer) = writer_slot.as_mut() else {
            return Err(SessionError::NotConnected);
        };

        let kind = message.kind;
        let len = message.len();

        let outcome = tokio::select! {
            result = writer.write_message(message) => Some(result),
            _ = wait_until(&mut state_rx, |s| s != SessionState::Connected) => None,
        };

        match outcome {
            Some(Ok(())) => {
                self.sent.fetch_add(1, Ordering::SeqCst);
                self.touch();
                debug!(session = %self.name, "Sent {} message ({} bytes)", kind, len);
                Ok(())
            }
            Some(Err(e @ CodecError::Oversize { .. })) => Err(SessionError::Rejected(e)),
            Some(Err(e)) => {
                writer_slot.take();
                let reason = e.to_string();
                self.fail(&reason);
                Err(SessionError::ConnectionLost(reason))
            }
            None => {
                writer_slot.take();
                Err(SessionError::ConnectionLost(
                    "session closed during send".to_string(),
                ))
            }
        }
    }

    /// Wait for the next complete message
    pub async fn receive(&self) -> Result<Message, SessionError> {
        let mut state_rx = self.status.subscribe();
        let mut reader_slot = self.reader.lock().await;

        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let Some(reader) = reader_slot.as_mut() else {
            return Err(SessionError::NotConnected);
        };

        let outcome = tokio::select! {
            result = reader.read_message() => Some(result),
            _ = wait_until(&mut state_rx, |s| s != SessionState::Connected) => None,
        };

        match outcome {
            Some(Ok(Some(message))) => {
                self.received.fetch_add(1, Ordering::SeqCst);
                self.touch();
                debug!(
                    session = %self.name,
                    "Received {} message ({} bytes)",
                    message.kind,
                    message.len()
                );
                Ok(message)
            }
            Some(Ok(None)) => {
                reader_slot.take();
                let reason = "peer closed the connection";
                self.fail(reason);
                Err(SessionError::ConnectionLost(reason.to_string()))
            }
            Some(Err(CodecError::Io(e))) => {
                reader_slot.take();
                let reason = e.to_string();
                self.fail(&reason);
                Err(SessionError::ConnectionLost(reason))
            }
            Some(Err(e)) => {
                reader_slot.take();
                self.fail(&e.to_string());
                Err(SessionError::Protocol(e))
            }
            None => {
                reader_slot.take();
                Err(SessionError::ConnectionLost("session closed".to_string()))
            }
        }
    }

    /// Release the connection. Safe to call repeatedly and from any task.
    pub async fn close(&self) {
        let was_open = self.status.send_if_modified(|s| {
            if s.state == SessionState::Disconnected {
                return false;
            }
            s.state = SessionState::Disconnected;
            true
        });

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session = %self.name, "Shutdown error: {}", e),
                Err(_) => debug!(session = %self.name, "Shutdown timed out"),
            }
        }
        self.reader.lock().await.take();

        if was_open {
            info!(session = %self.name, "Session closed");
        }
    }

    async fn install(&self, link: Link) {
        let Link { reader, writer } = link;
        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
    }

    /// Connected -> Failed; later failures of the same link are ignored
    fn fail(&self, reason: &str) {
        let failed = self.status.send_if_modified(|s| {
            if s.state != SessionState::Connected {
                return false;
            }
            s.state = SessionState::Failed;
            s.last_error = Some(reason.to_string());
            true
        });

        if failed {
            warn!(session = %self.name, "Session failed: {}", reason);
        }
    }

    fn touch(&self) {
        // Activity is not a state change; don't wake watchers
        self.status.send_if_modified(|s| {
            s.last_activity = Some(Utc::now());
            false
        });
    }

    fn aborted(&self, target: &str, attempts: u32) -> SessionError {
        debug!(session = %self.name, "Connect to {} aborted by close", target);
        SessionError::Connection {
            target: target.to_string(),
            attempts,
            reason: "session closed while connecting".to_string(),
        }
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("name", &self.name)
            .field("target", &self.dialer.target())
            .field("state", &self.state())
            .finish()
    }
}

/// Leaves `Connecting` if a connect future is dropped before it finishes
struct ConnectingGuard<'a> {
    status: &'a watch::Sender<SessionStatus>,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.status.send_if_modified(|s| {
            if s.state != SessionState::Connecting {
                return false;
            }
            s.state = SessionState::Disconnected;
            true
        });
    }
}

async fn wait_until(
    state_rx: &mut watch::Receiver<SessionStatus>,
    done: impl Fn(SessionState) -> bool,
) {
    loop {
        let state = state_rx.borrow_and_update().state;
        if done(state) {
            return;
        }
        if state_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
