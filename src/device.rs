//! Device lifecycle
//!
//! [`Device`] owns every long-running piece of the client: the three
//! transport sessions (camera, audio, command), the capture drivers feeding
//! them, the stream publishers, the command-channel supervisor and the
//! playback sink. The process entry point creates one, starts it, and stops
//! it on Ctrl-C, on a server `stop` directive, or when a capture driver is
//! permanently unavailable.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{CommandPlayer, CommandSynthesizer, CommandTranscriber, Transcriber};
use crate::capture::{
    AudioChunk, AudioClip, AudioFeed, CaptureError, CaptureOutput, CaptureSource, ClipRecorder,
    CommandCapture, FrameFeed, ImageReplay, WavReplay,
};
use crate::channel::{
    ChannelError, CommandChannel, ControlDirective, Event, RecognitionResult, Response,
    ResponseRouter, VoiceQuery, VoiceSubmission,
};
use crate::codec::FrameCodec;
use crate::config::{CaptureDriverConfig, Config, TransportKind};
use crate::playback::{PlaybackRequest, PlaybackSink, PlaybackStats, Renderer, SpeechRenderer};
use crate::publisher::{
    IntervalTicker, PublisherConfig, PublisherStats, SendFailurePolicy, StreamPublisher,
};
use crate::transport::{Dialer, SessionInfo, TcpDialer, TransportSession, WsDialer};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("command channel is not connected")]
    NotConnected,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("no camera frame captured yet")]
    NoFrame,

    #[error("microphone is disabled")]
    MicrophoneDisabled,

    #[error("a voice query is already being recorded")]
    AlreadyRecording,

    #[error("no voice query is being recorded")]
    NotRecording,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("playback has stopped")]
    PlaybackStopped,
}

/// Why the device asked to be shut down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ShutdownReason {
    /// The server sent a `stop` directive
    ServerRequested,
    /// A subsystem failed for good
    Fatal { subsystem: String, error: String },
}

struct ShutdownSignal {
    token: CancellationToken,
    reason: std::sync::Mutex<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: std::sync::Mutex::new(None),
        }
    }

    /// First reason wins
    fn trigger(&self, reason: ShutdownReason) {
        {
            let mut slot = self
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    fn reason(&self) -> Option<ShutdownReason> {
        self.reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// External speech collaborators
pub struct Backends {
    pub renderer: Arc<dyn Renderer>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
}

impl Backends {
    /// Command-driven backends as configured
    pub fn from_config(config: &Config) -> Self {
        let renderer = SpeechRenderer::new(
            Arc::new(CommandSynthesizer::new(config.playback.synthesizer.clone())),
            Arc::new(CommandPlayer::new(config.playback.player.clone())),
        );
        let transcriber = config
            .transcriber
            .clone()
            .map(|command| Arc::new(CommandTranscriber::new(command)) as Arc<dyn Transcriber>);

        Self {
            renderer: Arc::new(renderer),
            transcriber,
        }
    }
}

/// What happened to a voice query after recording stopped
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "sent_as", rename_all = "snake_case")]
pub enum VoiceOutcome {
    Text { text: String, duration_secs: f64 },
    Audio { duration_secs: f64 },
    Unrecognized { reason: String },
}

/// Point-in-time view of the whole device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: f64,
    pub sessions: Vec<SessionInfo>,
    pub publishers: Vec<PublisherStats>,
    pub command_channel_open: bool,
    pub responses_received: u64,
    pub last_recognition: Option<RecognitionResult>,
    pub voice_recording: bool,
    pub playback: PlaybackStats,
    pub shutdown: Option<ShutdownReason>,
}

pub struct Device {
    config: Config,
    started_at: DateTime<Utc>,

    camera_session: Arc<TransportSession>,
    audio_session: Arc<TransportSession>,
    command_session: Arc<TransportSession>,

    frames: FrameFeed,
    audio: AudioFeed,

    router: ResponseRouter,
    channel: RwLock<Option<Arc<CommandChannel>>>,
    playback: Arc<PlaybackSink>,
    voice: VoiceQuery,
    recorder: Mutex<Option<ClipRecorder>>,

    publishers: Mutex<Vec<StreamPublisher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    responses: Arc<AtomicU64>,
    last_recognition: Arc<std::sync::Mutex<Option<RecognitionResult>>>,

    /// Stops background tasks
    token: CancellationToken,
    shutdown: Arc<ShutdownSignal>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Device {
    pub fn new(config: Config, backends: Backends) -> Self {
        let codec = FrameCodec::new(config.codec.max_message_len);
        let session = |name: &str, port: u16| {
            Arc::new(TransportSession::new(
                name,
                dialer(&config, port, codec),
                config.server.retry.clone(),
            ))
        };
        let camera_session = session("camera", config.server.camera_port);
        let audio_session = session("audio", config.server.audio_port);
        let command_session = session("command", config.server.command_port);

        let frames = FrameFeed::new();
        let audio = AudioFeed::new(
            config.microphone.feed_capacity,
            config.microphone.sample_rate,
            config.microphone.channels,
        );

        let playback = Arc::new(PlaybackSink::start(
            backends.renderer,
            Some(config.playback.fallback_message.clone()),
        ));
        let voice = VoiceQuery::new(
            backends.transcriber,
            Arc::clone(&playback),
            config.playback.fallback_message.clone(),
        );

        let device = Self {
            started_at: Utc::now(),
            camera_session,
            audio_session,
            command_session,
            frames,
            audio,
            router: ResponseRouter::new(),
            channel: RwLock::new(None),
            playback,
            voice,
            recorder: Mutex::new(None),
            publishers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            responses: Arc::new(AtomicU64::new(0)),
            last_recognition: Arc::new(std::sync::Mutex::new(None)),
            token: CancellationToken::new(),
            shutdown: Arc::new(ShutdownSignal::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            config,
        };
        device.route_responses();
        device
    }

    pub fn device_id(&self) -> &str {
        &self.config.device.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &ResponseRouter {
        &self.router
    }

    pub fn frames(&self) -> &FrameFeed {
        &self.frames
    }

    pub fn audio(&self) -> &AudioFeed {
        &self.audio
    }

    /// Start capture, publishers and the command-channel supervisor
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Device already started");
            return;
        }

        info!(
            "Starting device {} (server {}, {:?})",
            self.config.device.id, self.config.server.host, self.config.server.transport
        );

        let mut tasks = Vec::new();

        if self.config.camera.enabled {
            tasks.push(self.spawn_camera_capture());
            self.start_stream(
                self.frames.subscribe(),
                Arc::clone(&self.camera_session),
                IntervalTicker::new(self.config.camera.interval()),
                PublisherConfig {
                    name: "camera".to_string(),
                    on_send_failure: self.config.camera.on_send_failure,
                },
                &mut tasks,
            )
            .await;
        }

        if self.config.microphone.enabled {
            tasks.push(self.spawn_microphone_capture());
            self.start_stream(
                self.audio.subscribe(),
                Arc::clone(&self.audio_session),
                IntervalTicker::new(self.config.microphone.chunk_duration()),
                PublisherConfig {
                    name: "microphone".to_string(),
                    on_send_failure: self.config.microphone.on_send_failure,
                },
                &mut tasks,
            )
            .await;
        }

        let device = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            device.supervise_commands().await;
        }));

        self.tasks.lock().await.extend(tasks);
        info!("Device {} started", self.config.device.id);
    }

    /// Resolves when the device wants the process to stop
    pub async fn shutdown_requested(&self) -> ShutdownReason {
        self.shutdown.token.cancelled().await;
        self.shutdown
            .reason()
            .unwrap_or(ShutdownReason::ServerRequested)
    }

    /// Stop everything; safe to call more than once
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping device {}", self.config.device.id);

        self.token.cancel();

        let publishers: Vec<StreamPublisher> = self.publishers.lock().await.drain(..).collect();
        for publisher in &publishers {
            publisher.stop().await;
        }

        let channel = self.channel.write().await.take();
        if let Some(channel) = channel {
            channel.stop().await;
        }

        let recorder = self.recorder.lock().await.take();
        if let Some(recorder) = recorder {
            if let Err(e) = recorder.stop().await {
                debug!("Discarding voice recording: {}", e);
            }
        }

        for session in self.sessions() {
            session.close().await;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Device task panicked: {}", e);
            }
        }

        self.playback.stop().await;
        info!("Device {} stopped", self.config.device.id);
    }

    pub async fn status(&self) -> DeviceStatus {
        let publishers = self
            .publishers
            .lock()
            .await
            .iter()
            .map(StreamPublisher::stats)
            .collect();
        let command_channel_open = self
            .channel
            .read()
            .await
            .as_ref()
            .is_some_and(|c| !c.is_closed());
        let voice_recording = self.recorder.lock().await.is_some();
        let last_recognition = self
            .last_recognition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let uptime = Utc::now().signed_duration_since(self.started_at);

        DeviceStatus {
            device_id: self.config.device.id.clone(),
            started_at: self.started_at,
            uptime_secs: uptime.num_milliseconds() as f64 / 1000.0,
            sessions: self.sessions().iter().map(|s| s.info()).collect(),
            publishers,
            command_channel_open,
            responses_received: self.responses.load(Ordering::SeqCst),
            last_recognition,
            voice_recording,
            playback: self.playback.stats(),
            shutdown: self.shutdown.reason(),
        }
    }

    /// Send a typed question; resolves once it is on the wire
    pub async fn submit_query(&self, text: &str) -> Result<(), DeviceError> {
        info!("Submitting text query: {}", text);
        self.submit(Event::TextQuery(text.to_string())).await
    }

    /// Send the latest camera frame for recognition
    pub async fn recognize(&self) -> Result<(), DeviceError> {
        let frame = self.frames.latest().ok_or(DeviceError::NoFrame)?;
        info!(
            "Submitting frame from {} for recognition ({} bytes)",
            frame.source_id,
            frame.data.len()
        );
        self.submit(Event::Recognize(frame)).await
    }

    pub async fn start_voice_query(&self) -> Result<(), DeviceError> {
        if !self.config.microphone.enabled {
            return Err(DeviceError::MicrophoneDisabled);
        }

        let mut recorder = self.recorder.lock().await;
        if recorder.is_some() {
            return Err(DeviceError::AlreadyRecording);
        }
        *recorder = Some(self.audio.record());
        info!("Voice query recording started");
        Ok(())
    }

    /// Finish recording and send the utterance
    pub async fn stop_voice_query(&self) -> Result<VoiceOutcome, DeviceError> {
        let recorder = self
            .recorder
            .lock()
            .await
            .take()
            .ok_or(DeviceError::NotRecording)?;
        let clip = recorder.stop().await?;
        let duration_secs = clip.duration().as_secs_f64();
        info!("Voice query recorded ({:.1}s)", duration_secs);

        let channel = self.current_channel().await?;
        match self.voice.submit(&channel, clip).await? {
            VoiceSubmission::Text { text, pending } => {
                pending.wait().await?;
                Ok(VoiceOutcome::Text {
                    text,
                    duration_secs,
                })
            }
            VoiceSubmission::Audio { pending } => {
                pending.wait().await?;
                Ok(VoiceOutcome::Audio { duration_secs })
            }
            VoiceSubmission::Unrecognized { reason } => Ok(VoiceOutcome::Unrecognized { reason }),
        }
    }

    pub fn speak(&self, text: &str) -> Result<(), DeviceError> {
        self.enqueue(PlaybackRequest::text(text))
    }

    pub fn play(&self, audio: bytes::Bytes) -> Result<(), DeviceError> {
        self.enqueue(PlaybackRequest::audio(audio))
    }

    fn enqueue(&self, request: PlaybackRequest) -> Result<(), DeviceError> {
        if self.playback.enqueue(request) {
            Ok(())
        } else {
            Err(DeviceError::PlaybackStopped)
        }
    }

    async fn submit(&self, event: Event) -> Result<(), DeviceError> {
        let channel = self.current_channel().await?;
        let pending = channel.submit(event)?;
        pending.wait().await?;
        Ok(())
    }

    async fn current_channel(&self) -> Result<Arc<CommandChannel>, DeviceError> {
        self.channel
            .read()
            .await
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
            .ok_or(DeviceError::NotConnected)
    }

    fn sessions(&self) -> [&Arc<TransportSession>; 3] {
        [
            &self.camera_session,
            &self.audio_session,
            &self.command_session,
        ]
    }

    fn route_responses(&self) {
        let playback = Arc::clone(&self.playback);
        let shutdown = Arc::clone(&self.shutdown);
        let responses = Arc::clone(&self.responses);
        let last_recognition = Arc::clone(&self.last_recognition);
        let sample_rate = self.config.playback.audio_sample_rate;
        let channels = self.config.playback.audio_channels;

        self.router.on_response(move |response| {
            responses.fetch_add(1, Ordering::SeqCst);

            match response {
                Response::Speech(text) => {
                    info!("Server says: {}", text);
                    playback.speak(text.clone());
                }
                Response::Recognition(result) => {
                    if result.identities.is_empty() {
                        info!("Recognition: nobody recognized");
                    } else {
                        info!("Recognition: {}", result.identities.join(", "));
                    }
                    *last_recognition
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(result.clone());
                }
                Response::Audio(pcm) if pcm.is_empty() => {
                    debug!("Ignoring empty audio from server");
                }
                Response::Audio(pcm) => match pcm_to_wav(pcm, sample_rate, channels) {
                    Ok(wav) => {
                        debug!("Server sent {} bytes of audio", pcm.len());
                        if !playback.enqueue(PlaybackRequest::audio(wav)) {
                            debug!("Playback stopped, dropping server audio");
                        }
                    }
                    Err(e) => warn!("Cannot play server audio: {}", e),
                },
                Response::Control(directive) if directive.is_stop() => {
                    info!("Server requested shutdown");
                    shutdown.trigger(ShutdownReason::ServerRequested);
                }
                Response::Control(directive) => {
                    debug!("Ignoring control directive `{}`", directive.command);
                }
            }
        });
    }

    async fn start_stream<S>(
        &self,
        source: S,
        session: Arc<TransportSession>,
        ticker: IntervalTicker,
        config: PublisherConfig,
        tasks: &mut Vec<JoinHandle<()>>,
    ) where
        S: CaptureSource + 'static,
    {
        let policy = config.on_send_failure;
        let publisher = StreamPublisher::start(source, Arc::clone(&session), ticker, config);
        self.publishers.lock().await.push(publisher);

        // With the drop policy the publisher never reconnects by itself
        let token = self.token.clone();
        let interval = self.config.server.reconnect_interval();
        tasks.push(tokio::spawn(async move {
            supervise_stream(session, policy, interval, token).await;
        }));
    }

    fn spawn_camera_capture(&self) -> JoinHandle<()> {
        let camera = &self.config.camera;
        let token = self.token.clone();

        match &camera.driver {
            CaptureDriverConfig::Command { program, args } => {
                let driver = CommandCapture::new(
                    "camera",
                    program.clone(),
                    args.clone(),
                    CaptureOutput::Frames {
                        feed: self.frames.clone(),
                        source_id: camera.source_id.clone(),
                    },
                    camera.restart.clone(),
                );
                self.spawn_capture("camera capture", driver.run(token))
            }
            CaptureDriverConfig::File { path, .. } => {
                let driver = ImageReplay::new(
                    path.clone(),
                    self.frames.clone(),
                    camera.source_id.clone(),
                    camera.interval(),
                );
                self.spawn_capture("camera capture", driver.run(token))
            }
        }
    }

    fn spawn_microphone_capture(&self) -> JoinHandle<()> {
        let microphone = &self.config.microphone;
        let token = self.token.clone();

        match &microphone.driver {
            CaptureDriverConfig::Command { program, args } => {
                let driver = CommandCapture::new(
                    "microphone",
                    program.clone(),
                    args.clone(),
                    CaptureOutput::Audio {
                        feed: self.audio.clone(),
                        chunk_samples: microphone.chunk_samples,
                    },
                    microphone.restart.clone(),
                );
                self.spawn_capture("microphone capture", driver.run(token))
            }
            CaptureDriverConfig::File { path, looped } => {
                let driver = WavReplay::new(
                    path.clone(),
                    self.audio.clone(),
                    microphone.chunk_samples,
                    *looped,
                );
                self.spawn_capture("microphone capture", driver.run(token))
            }
        }
    }

    fn spawn_capture<F>(&self, subsystem: &'static str, driver: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), CaptureError>> + Send + 'static,
    {
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                error!("{} failed: {}", subsystem, e);
                shutdown.trigger(ShutdownReason::Fatal {
                    subsystem: subsystem.to_string(),
                    error: e.to_string(),
                });
            }
        })
    }

    /// Keep a command channel open for the device's lifetime
    ///
    /// Every new channel reuses the device's response router and starts by
    /// announcing the device with a `hello` directive. A lost channel waits
    /// `reconnect_interval` before the next connect.
    async fn supervise_commands(&self) {
        let session = Arc::clone(&self.command_session);
        let interval = self.config.server.reconnect_interval();
        // Channels lost in a row, each before staying up a full interval
        let mut losses: u32 = 0;

        loop {
            let connected = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                connected = session.connect() => connected,
            };

            if let Err(e) = connected {
                warn!("Command session unavailable: {}; retrying in {:?}", e, interval);
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => continue,
                }
            }

            let opened_at = tokio::time::Instant::now();
            let channel = match CommandChannel::open(
                Arc::clone(&session),
                self.router.clone(),
                self.config.device.command_queue,
            ) {
                Ok(channel) => Some(Arc::new(channel)),
                Err(e) => {
                    debug!("Command session dropped before the channel opened: {}", e);
                    None
                }
            };

            if let Some(channel) = channel {
                let hello = ControlDirective::hello(
                    &self.config.device.id,
                    self.config.microphone.sample_rate,
                    self.config.microphone.channels,
                );
                if let Err(e) = channel.submit(Event::Control(hello)) {
                    warn!("Failed to queue hello directive: {}", e);
                }

                *self.channel.write().await = Some(Arc::clone(&channel));

                let stopping = tokio::select! {
                    _ = self.token.cancelled() => true,
                    _ = channel.closed() => false,
                };

                channel.stop().await;
                self.channel.write().await.take();

                if stopping {
                    break;
                }
            }

            if opened_at.elapsed() >= interval {
                losses = 0;
            }
            losses += 1;
            if losses == 1 {
                warn!("Command channel lost, reconnecting in {:?}", interval);
            } else {
                debug!(
                    "Command channel lost again ({} in a row), reconnecting in {:?}",
                    losses, interval
                );
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        debug!("Command supervisor exited");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Wrap raw s16le PCM in a WAV header for the audio player
fn pcm_to_wav(
    pcm: &bytes::Bytes,
    sample_rate: u32,
    channels: u16,
) -> Result<Vec<u8>, CaptureError> {
    let mut clip = AudioClip::new(sample_rate, channels, Utc::now());
    clip.push(AudioChunk::new(pcm.clone(), sample_rate, channels))?;
    clip.to_wav()
}

fn dialer(config: &Config, port: u16, codec: FrameCodec) -> Arc<dyn Dialer> {
    let target = config.server.target(port);
    match config.server.transport {
        TransportKind::Tcp => Arc::new(TcpDialer::new(target, codec)),
        TransportKind::Websocket => Arc::new(WsDialer::new(target, codec)),
    }
}

/// Initial connect for a stream session, plus reconnects under the drop policy
async fn supervise_stream(
    session: Arc<TransportSession>,
    policy: SendFailurePolicy,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    loop {
        if !session.is_connected() {
            let connected = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                connected = session.connect() => connected,
            };
            if let Err(e) = connected {
                warn!("{} session unavailable: {}", session.name(), e);
            }
        }

        if policy == SendFailurePolicy::Reconnect && session.is_connected() {
            return;
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
