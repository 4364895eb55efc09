// Integration tests for stream publishers
//
// Publishers are driven either by a real interval ticker or by a ticker the
// test steps by hand, against in-memory sessions.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use classroom_link::capture::{AudioChunk, AudioFeed, Frame, FrameFeed};
use classroom_link::codec::MessageKind;
use classroom_link::publisher::{
    IntervalTicker, PublisherConfig, SendFailurePolicy, StreamPublisher, Ticker,
};
use classroom_link::transport::{RetryPolicy, SessionState, TransportSession};
use common::{accept, eventually, server_conn, EndlessFrames, PairDialer};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Ticks once per message sent by the test
struct StepTicker {
    steps: mpsc::UnboundedReceiver<()>,
}

#[async_trait]
impl Ticker for StepTicker {
    async fn tick(&mut self) {
        if self.steps.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

fn step_ticker() -> (mpsc::UnboundedSender<()>, StepTicker) {
    let (tx, steps) = mpsc::unbounded_channel();
    (tx, StepTicker { steps })
}

fn config(name: &str, on_send_failure: SendFailurePolicy) -> PublisherConfig {
    PublisherConfig {
        name: name.to_string(),
        on_send_failure,
    }
}

fn retry() -> RetryPolicy {
    RetryPolicy::fixed(Some(3), Duration::from_millis(10))
}

#[tokio::test]
async fn test_sends_latest_frame_once() -> Result<()> {
    let (dialer, mut servers) = PairDialer::new(64 * 1024);
    let session = Arc::new(TransportSession::new("camera", dialer, retry()));
    session.connect().await?;
    let mut server = server_conn(accept(&mut servers).await);

    let feed = FrameFeed::new();
    let (steps, ticker) = step_ticker();
    let publisher = StreamPublisher::start(
        feed.subscribe(),
        Arc::clone(&session),
        ticker,
        config("camera", SendFailurePolicy::Reconnect),
    );

    // Two frames between ticks: only the newest goes out
    feed.publish(Frame::new(vec![1u8; 32], "camera0"));
    feed.publish(Frame::new(vec![2u8; 32], "camera0"));
    steps.send(())?;

    let message = server.next().await.expect("no message")?;
    assert_eq!(message.kind, MessageKind::Frame);
    assert_eq!(&message.payload[..], &[2u8; 32][..]);

    // Nothing new captured: the tick is skipped
    steps.send(())?;
    assert!(eventually(|| publisher.stats().skipped == 1).await);

    feed.publish(Frame::new(vec![3u8; 32], "camera0"));
    steps.send(())?;
    let message = server.next().await.expect("no message")?;
    assert_eq!(message.payload[0], 3);

    let stats = publisher.stats();
    assert_eq!(stats.ticks, 3);
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.dropped, 0);

    publisher.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_audio_chunks_sent_in_order() -> Result<()> {
    let (dialer, mut servers) = PairDialer::new(64 * 1024);
    let session = Arc::new(TransportSession::new("audio", dialer, retry()));
    session.connect().await?;
    let mut server = server_conn(accept(&mut servers).await);

    let feed = AudioFeed::new(16, 16_000, 1);
    let publisher = StreamPublisher::start(
        feed.subscribe(),
        Arc::clone(&session),
        IntervalTicker::new(Duration::from_millis(2)),
        config("microphone", SendFailurePolicy::Reconnect),
    );

    for i in 0..5i16 {
        feed.publish(AudioChunk::from_samples(&[i; 1024], 16_000, 1));
    }

    for i in 0..5i16 {
        let message = server.next().await.expect("no message")?;
        assert_eq!(message.kind, MessageKind::Audio);
        assert_eq!(message.len(), 2048);
        assert_eq!(i16::from_le_bytes([message.payload[0], message.payload[1]]), i);
    }

    publisher.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_no_sends_after_stop() -> Result<()> {
    let (dialer, mut servers) = PairDialer::new(1024 * 1024);
    let session = Arc::new(TransportSession::new("camera", dialer, retry()));
    session.connect().await?;
    let mut server = server_conn(accept(&mut servers).await);

    let publisher = StreamPublisher::start(
        EndlessFrames { size: 1000 },
        Arc::clone(&session),
        IntervalTicker::new(Duration::from_millis(5)),
        config("camera", SendFailurePolicy::Reconnect),
    );

    for _ in 0..3 {
        server.next().await.expect("no message")?;
    }

    publisher.stop().await;
    assert!(!publisher.is_running());
    assert!(!publisher.stats().running);

    let sent = session.sent_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.sent_count(), sent);

    // Stopping twice is harmless
    publisher.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_drop_policy_counts_dropped_samples() -> Result<()> {
    let (dialer, _servers) = PairDialer::new(1024);
    let session = Arc::new(TransportSession::new("camera", dialer.clone(), retry()));

    let publisher = StreamPublisher::start(
        EndlessFrames { size: 100 },
        Arc::clone(&session),
        IntervalTicker::new(Duration::from_millis(2)),
        config("camera", SendFailurePolicy::Drop),
    );

    assert!(eventually(|| publisher.stats().dropped >= 5).await);

    let stats = publisher.stats();
    assert!(stats.running);
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.reconnects, 0);

    // Reconnection is left to whoever owns the session
    assert_eq!(dialer.attempts(), 0);
    assert_eq!(session.state(), SessionState::Disconnected);

    publisher.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_reconnect_policy_recovers_lost_session() -> Result<()> {
    let (dialer, mut servers) = PairDialer::new(4096);
    let session = Arc::new(TransportSession::new("camera", dialer.clone(), retry()));
    session.connect().await?;
    let mut first = server_conn(accept(&mut servers).await);

    let publisher = StreamPublisher::start(
        EndlessFrames { size: 500 },
        Arc::clone(&session),
        IntervalTicker::new(Duration::from_millis(5)),
        config("camera", SendFailurePolicy::Reconnect),
    );

    first.next().await.expect("no message")?;
    drop(first);

    let mut second = server_conn(accept(&mut servers).await);
    let message = second.next().await.expect("no message")?;
    assert_eq!(message.kind, MessageKind::Frame);

    assert!(eventually(|| publisher.stats().reconnects >= 1).await);
    assert!(publisher.stats().dropped >= 1);
    assert_eq!(dialer.attempts(), 2);
    assert!(session.is_connected());

    publisher.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_publisher_exits_when_feed_closes() -> Result<()> {
    let (dialer, _servers) = PairDialer::new(1024);
    let session = Arc::new(TransportSession::new("camera", dialer, retry()));

    let feed = FrameFeed::new();
    let source = feed.subscribe();
    drop(feed);

    let publisher = StreamPublisher::start(
        source,
        session,
        IntervalTicker::new(Duration::from_millis(2)),
        config("camera", SendFailurePolicy::Drop),
    );

    assert!(eventually(|| !publisher.is_running()).await);
    assert_eq!(publisher.stats().sent, 0);

    publisher.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_reconnects_spaced_while_server_keeps_closing() -> Result<()> {
    let (dialer, mut servers) = PairDialer::new(4096);
    // Every connection is closed as soon as it is accepted
    tokio::spawn(async move {
        while let Some(server) = servers.recv().await {
            drop(server);
        }
    });

    let session = Arc::new(TransportSession::new(
        "camera",
        dialer.clone(),
        RetryPolicy::unbounded(Duration::from_millis(500), Duration::from_secs(5)),
    ));

    let (steps, ticker) = step_ticker();
    let publisher = StreamPublisher::start(
        EndlessFrames { size: 100 },
        Arc::clone(&session),
        ticker,
        config("camera", SendFailurePolicy::Reconnect),
    );

    for _ in 0..50 {
        steps.send(())?;
    }
    assert!(eventually(|| publisher.stats().ticks == 50).await);

    let stats = publisher.stats();
    assert!(stats.reconnects <= 2, "reconnected {} times", stats.reconnects);
    assert!(dialer.attempts() <= 2, "dialed {} times", dialer.attempts());
    assert!(stats.dropped >= 1);
    assert_eq!(stats.sent + stats.dropped, 50);

    publisher.stop().await;
    Ok(())
}
