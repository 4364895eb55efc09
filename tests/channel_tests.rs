// Integration tests for the command channel
//
// A fake server on the far end of an in-memory session receives events and
// replies with responses.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use classroom_link::backend::{BackendError, Transcriber};
use classroom_link::capture::{AudioChunk, AudioClip, Frame};
use classroom_link::channel::{
    ChannelError, CommandChannel, ControlDirective, Event, Response, ResponseRouter, VoiceQuery,
    VoiceSubmission,
};
use classroom_link::codec::{Message, MessageKind};
use classroom_link::playback::PlaybackSink;
use classroom_link::transport::{RetryPolicy, TransportSession};
use common::{accept, eventually, server_conn, PairDialer, RecordingRenderer, ServerConn};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;

async fn connected(buffer: usize) -> Result<(Arc<TransportSession>, DuplexStream)> {
    let (dialer, mut servers) = PairDialer::new(buffer);
    let session = Arc::new(TransportSession::new(
        "command",
        dialer,
        RetryPolicy::fixed(Some(1), Duration::from_millis(10)),
    ));
    session.connect().await?;
    let server = accept(&mut servers).await;
    Ok((session, server))
}

async fn next_message(server: &mut ServerConn) -> Result<Message> {
    let message = tokio::time::timeout(Duration::from_secs(5), server.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("server stream ended"))??;
    Ok(message)
}

fn clip(samples: usize) -> AudioClip {
    let mut clip = AudioClip::new(16_000, 1, Utc::now());
    if samples > 0 {
        clip.push(AudioChunk::from_samples(&vec![100i16; samples], 16_000, 1))
            .unwrap();
    }
    clip
}

struct FixedTranscriber(Result<String, String>);

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _clip: &AudioClip) -> Result<String, BackendError> {
        self.0.clone().map_err(BackendError::Recognition)
    }
}

#[tokio::test]
async fn test_recognize_round_trip() -> Result<()> {
    let (session, server) = connected(64 * 1024).await?;
    let mut server = server_conn(server);

    let responses = Arc::new(Mutex::new(Vec::new()));
    let channel = CommandChannel::open(session, ResponseRouter::new(), 8)?;
    {
        let responses = Arc::clone(&responses);
        channel.on_response(move |response| responses.lock().unwrap().push(response.clone()));
    }

    let pending = channel.submit(Event::Recognize(Frame::new(vec![0x5A; 50_000], "camera0")))?;

    let request = next_message(&mut server).await?;
    assert_eq!(request.kind, MessageKind::Frame);
    assert_eq!(request.len(), 50_000);
    pending.wait().await?;

    server
        .send(Message::text(
            MessageKind::SpeechResponse,
            "Hello Alice, attendance marked",
        ))
        .await?;

    assert!(eventually(|| !responses.lock().unwrap().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let responses = responses.lock().unwrap().clone();
    assert_eq!(
        responses,
        vec![Response::Speech("Hello Alice, attendance marked".to_string())]
    );

    channel.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_events_written_in_submission_order() -> Result<()> {
    let (session, server) = connected(64 * 1024).await?;
    let mut server = server_conn(server);
    let channel = CommandChannel::open(session, ResponseRouter::new(), 8)?;

    channel.submit(Event::TextQuery("who is absent today?".to_string()))?;
    channel.submit(Event::Control(ControlDirective::hello("room-7", 16_000, 1)))?;
    let last = channel.submit(Event::Recognize(Frame::new(vec![1u8; 10], "camera0")))?;
    last.wait().await?;

    let query = next_message(&mut server).await?;
    assert_eq!(query.kind, MessageKind::Query);
    assert_eq!(query.as_text()?, "who is absent today?");

    let control = next_message(&mut server).await?;
    assert_eq!(control.kind, MessageKind::Control);
    let directive: ControlDirective = serde_json::from_slice(&control.payload)?;
    assert_eq!(directive.command, "hello");
    assert_eq!(directive.data["device_id"], "room-7");

    assert_eq!(next_message(&mut server).await?.kind, MessageKind::Frame);

    channel.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_open_requires_connected_session() -> Result<()> {
    let (dialer, _servers) = PairDialer::new(1024);
    let session = Arc::new(TransportSession::new(
        "command",
        dialer,
        RetryPolicy::default(),
    ));

    let result = CommandChannel::open(session, ResponseRouter::new(), 8);
    assert!(matches!(result, Err(ChannelError::Closed)));
    Ok(())
}

#[tokio::test]
async fn test_full_queue_rejects_submit() -> Result<()> {
    // The server never reads, so the first event blocks the writer
    let (session, _server) = connected(64).await?;
    let channel = CommandChannel::open(session, ResponseRouter::new(), 1)?;

    let _first = channel.submit(Event::Recognize(Frame::new(vec![0u8; 100_000], "camera0")))?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _second = channel.submit(Event::TextQuery("queued".to_string()))?;
    let third = channel.submit(Event::TextQuery("one too many".to_string()));
    assert_eq!(third.unwrap_err(), ChannelError::QueueFull(1));

    channel.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_session_loss_fails_queued_events() -> Result<()> {
    let (session, server) = connected(64).await?;
    let channel = CommandChannel::open(Arc::clone(&session), ResponseRouter::new(), 8)?;

    let first = channel.submit(Event::Recognize(Frame::new(vec![0u8; 100_000], "camera0")))?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = channel.submit(Event::TextQuery("still waiting".to_string()))?;
    let third = channel.submit(Event::TextQuery("me too".to_string()))?;

    drop(server);

    assert_eq!(first.wait().await, Err(ChannelError::Closed));
    assert_eq!(second.wait().await, Err(ChannelError::Closed));
    assert_eq!(third.wait().await, Err(ChannelError::Closed));

    tokio::time::timeout(Duration::from_secs(1), channel.closed()).await?;
    assert!(channel.is_closed());
    assert!(!session.is_connected());

    let late = channel.submit(Event::TextQuery("too late".to_string()));
    assert!(matches!(late, Err(ChannelError::Closed)));

    channel.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_malformed_response_is_ignored() -> Result<()> {
    let (session, server) = connected(64 * 1024).await?;
    let mut server = server_conn(server);

    let responses = Arc::new(Mutex::new(Vec::new()));
    let router = ResponseRouter::new();
    {
        let responses = Arc::clone(&responses);
        router.on_response(move |response| responses.lock().unwrap().push(response.clone()));
    }
    let channel = CommandChannel::open(session, router, 8)?;

    server
        .send(Message::new(MessageKind::RecognitionResponse, b"not json".to_vec()))
        .await?;
    server
        .send(Message::new(MessageKind::Frame, vec![0xFF, 0xD8]))
        .await?;
    server
        .send(Message::new(
            MessageKind::RecognitionResponse,
            br#"{"identities": ["Alice"]}"#.to_vec(),
        ))
        .await?;

    assert!(eventually(|| !responses.lock().unwrap().is_empty()).await);
    assert!(!channel.is_closed());

    let responses = responses.lock().unwrap().clone();
    assert_eq!(responses.len(), 1);
    match &responses[0] {
        Response::Recognition(result) => assert_eq!(result.identities, vec!["Alice"]),
        other => panic!("unexpected response {:?}", other),
    }

    channel.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_all_handlers_see_each_response() -> Result<()> {
    let (session, server) = connected(64 * 1024).await?;
    let mut server = server_conn(server);
    let channel = CommandChannel::open(session, ResponseRouter::new(), 8)?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    for id in 0..2 {
        let seen = Arc::clone(&seen);
        channel.on_response(move |_| seen.lock().unwrap().push(id));
    }

    server
        .send(Message::text(MessageKind::SpeechResponse, "Quiet please"))
        .await?;

    assert!(eventually(|| seen.lock().unwrap().len() == 2).await);
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec![0, 1]);

    channel.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_voice_query_without_transcriber_sends_audio() -> Result<()> {
    let (session, server) = connected(64 * 1024).await?;
    let mut server = server_conn(server);
    let channel = CommandChannel::open(session, ResponseRouter::new(), 8)?;

    let renderer = Arc::new(RecordingRenderer::default());
    let playback = Arc::new(PlaybackSink::start(renderer.clone(), None));
    let voice = VoiceQuery::new(None, Arc::clone(&playback), "Sorry?");

    match voice.submit(&channel, clip(1600)).await? {
        VoiceSubmission::Audio { pending } => pending.wait().await?,
        other => panic!("unexpected submission {:?}", other),
    }

    let message = next_message(&mut server).await?;
    assert_eq!(message.kind, MessageKind::Audio);
    assert_eq!(message.len(), 3200);
    assert_eq!(renderer.count(), 0);

    channel.stop().await;
    playback.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_voice_query_with_transcriber_sends_text() -> Result<()> {
    let (session, server) = connected(64 * 1024).await?;
    let mut server = server_conn(server);
    let channel = CommandChannel::open(session, ResponseRouter::new(), 8)?;

    let renderer = Arc::new(RecordingRenderer::default());
    let playback = Arc::new(PlaybackSink::start(renderer.clone(), None));
    let transcriber: Arc<dyn Transcriber> =
        Arc::new(FixedTranscriber(Ok("what is next period".to_string())));
    let voice = VoiceQuery::new(Some(transcriber), Arc::clone(&playback), "Sorry?");

    match voice.submit(&channel, clip(1600)).await? {
        VoiceSubmission::Text { text, pending } => {
            assert_eq!(text, "what is next period");
            pending.wait().await?;
        }
        other => panic!("unexpected submission {:?}", other),
    }

    let message = next_message(&mut server).await?;
    assert_eq!(message.kind, MessageKind::Query);
    assert_eq!(message.as_text()?, "what is next period");

    channel.stop().await;
    playback.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unrecognized_voice_query_speaks_fallback() -> Result<()> {
    let (session, _server) = connected(64 * 1024).await?;
    let channel = CommandChannel::open(Arc::clone(&session), ResponseRouter::new(), 8)?;

    let renderer = Arc::new(RecordingRenderer::default());
    let playback = Arc::new(PlaybackSink::start(renderer.clone(), None));
    let transcriber: Arc<dyn Transcriber> =
        Arc::new(FixedTranscriber(Err("no speech detected".to_string())));
    let voice = VoiceQuery::new(Some(transcriber), Arc::clone(&playback), "Sorry, say again?");

    let submission = voice.submit(&channel, clip(1600)).await?;
    assert!(matches!(submission, VoiceSubmission::Unrecognized { .. }));

    // An empty recording never reaches the transcriber
    let submission = VoiceQuery::new(None, Arc::clone(&playback), "Sorry, say again?")
        .submit(&channel, clip(0))
        .await?;
    assert!(matches!(submission, VoiceSubmission::Unrecognized { .. }));

    assert!(eventually(|| renderer.count() == 2).await);
    assert_eq!(
        renderer.texts(),
        vec!["Sorry, say again?".to_string(), "Sorry, say again?".to_string()]
    );
    assert_eq!(session.sent_count(), 0);

    channel.stop().await;
    playback.stop().await;
    Ok(())
}
