use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::messages::{Event, Response};
use super::router::ResponseRouter;
use crate::codec::Message;
use crate::transport::{SessionError, TransportSession};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The session was lost or the channel stopped before the event went out
    #[error("command channel closed")]
    Closed,

    #[error("command queue full ({0} events pending)")]
    QueueFull(usize),

    /// The event could not be encoded or exceeds the message size cap
    #[error("event rejected: {0}")]
    Rejected(String),
}

struct Outbound {
    event: &'static str,
    message: Message,
    done: oneshot::Sender<Result<(), ChannelError>>,
}

/// Completion handle for a submitted event
#[derive(Debug)]
pub struct Pending {
    rx: oneshot::Receiver<Result<(), ChannelError>>,
}

impl Pending {
    /// Resolves once the event has been written to the session
    pub async fn wait(self) -> Result<(), ChannelError> {
        self.rx.await.unwrap_or(Err(ChannelError::Closed))
    }
}

/// Duplex channel for discrete events and server responses
///
/// Runs two tasks over a connected session: a writer draining a bounded
/// event queue, and a reader decoding responses and dispatching them through
/// the [`ResponseRouter`]. Either task failing closes the whole channel; the
/// owner is expected to reconnect the session and open a new channel with the
/// same router.
pub struct CommandChannel {
    session: Arc<TransportSession>,
    router: ResponseRouter,
    capacity: usize,
    queue: mpsc::Sender<Outbound>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandChannel {
    pub fn open(
        session: Arc<TransportSession>,
        router: ResponseRouter,
        capacity: usize,
    ) -> Result<Self, ChannelError> {
        if !session.is_connected() {
            return Err(ChannelError::Closed);
        }

        let capacity = capacity.max(1);
        let (queue, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();

        let writer = tokio::spawn(write_loop(Arc::clone(&session), rx, token.clone()));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&session),
            router.clone(),
            token.clone(),
        ));

        info!("Command channel open on session {}", session.name());

        Ok(Self {
            session,
            router,
            capacity,
            queue,
            token,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    pub fn router(&self) -> &ResponseRouter {
        &self.router
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    /// Queue an event without waiting for it to be written
    pub fn submit(&self, event: Event) -> Result<Pending, ChannelError> {
        if self.token.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let name = event.name();
        let message = event
            .into_message()
            .map_err(|e| ChannelError::Rejected(e.to_string()))?;

        let (done, rx) = oneshot::channel();
        let outbound = Outbound {
            event: name,
            message,
            done,
        };

        match self.queue.try_send(outbound) {
            Ok(()) => {
                debug!("Queued {} event", name);
                Ok(Pending { rx })
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(ChannelError::QueueFull(self.capacity)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    pub fn on_response<F>(&self, handler: F)
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.router.on_response(handler);
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the channel has closed, for any reason
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }

    /// Close the channel and wait for both tasks to finish
    ///
    /// Events still queued fail with [`ChannelError::Closed`]. The session
    /// itself is left to its owner.
    pub async fn stop(&self) {
        self.token.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Command channel task panicked: {}", e);
            }
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn write_loop(
    session: Arc<TransportSession>,
    mut rx: mpsc::Receiver<Outbound>,
    token: CancellationToken,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            outbound = rx.recv() => match outbound {
                Some(outbound) => outbound,
                None => break,
            },
        };

        // The framed writer keeps unwritten bytes of an abandoned send, so the
        // stream stays aligned for the session's next writer.
        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = outbound.done.send(Err(ChannelError::Closed));
                break;
            }
            sent = session.send(outbound.message) => sent,
        };

        match sent {
            Ok(()) => {
                debug!("Sent {} event", outbound.event);
                let _ = outbound.done.send(Ok(()));
            }
            Err(SessionError::Rejected(e)) => {
                warn!("{} event rejected: {}", outbound.event, e);
                let _ = outbound.done.send(Err(ChannelError::Rejected(e.to_string())));
            }
            Err(e) => {
                warn!("Command channel send failed: {}", e);
                let _ = outbound.done.send(Err(ChannelError::Closed));
                break;
            }
        }
    }

    token.cancel();
    rx.close();

    let mut failed = 0;
    while let Ok(outbound) = rx.try_recv() {
        let _ = outbound.done.send(Err(ChannelError::Closed));
        failed += 1;
    }
    if failed > 0 {
        info!("Command channel closed with {} queued event(s) failed", failed);
    }
}

async fn read_loop(session: Arc<TransportSession>, router: ResponseRouter, token: CancellationToken) {
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = session.receive() => received,
        };

        let message = match received {
            Ok(message) => message,
            Err(e) => {
                warn!("Command channel receive failed: {}", e);
                break;
            }
        };

        match Response::from_message(&message) {
            Ok(response) => {
                debug!("Dispatching {} response", response.kind());
                router.dispatch(&response);
            }
            Err(e) => warn!("Ignoring message from server: {}", e),
        }
    }

    token.cancel();
}
