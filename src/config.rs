use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::CommandSpec;
use crate::codec::DEFAULT_MAX_MESSAGE_LEN;
use crate::publisher::SendFailurePolicy;
use crate::transport::RetryPolicy;

/// Prefix for environment overrides, e.g. `CLASSROOM__SERVER__HOST`
pub const ENV_PREFIX: &str = "CLASSROOM";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub server: ServerConfig,
    pub codec: CodecConfig,
    pub camera: CameraConfig,
    pub microphone: MicrophoneConfig,
    pub playback: PlaybackConfig,

    /// Local speech-to-text for voice queries; absent means clips are sent
    /// to the server as audio
    pub transcriber: Option<CommandSpec>,

    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Announced to the server; generated when empty
    pub id: String,

    /// Pending events on the command channel before submissions are refused
    pub command_queue: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            command_queue: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Tcp,
    Websocket,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub transport: TransportKind,
    pub camera_port: u16,
    pub audio_port: u16,
    pub command_port: u16,

    /// Request path for WebSocket transports
    pub ws_path: String,

    /// Use `wss://` for WebSocket transports
    pub tls: bool,

    pub retry: RetryPolicy,

    /// Delay between command-channel reconnect rounds
    pub reconnect_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            transport: TransportKind::Tcp,
            camera_port: 8000,
            audio_port: 8001,
            command_port: 8002,
            ws_path: "/".to_string(),
            tls: false,
            retry: RetryPolicy::default(),
            reconnect_interval_ms: 5000,
        }
    }
}

impl ServerConfig {
    /// Dial target for one stream: `host:port` for TCP, a URL for WebSocket
    pub fn target(&self, port: u16) -> String {
        match self.transport {
            TransportKind::Tcp => format!("{}:{}", self.host, port),
            TransportKind::Websocket => {
                let scheme = if self.tls { "wss" } else { "ws" };
                let path = if self.ws_path.starts_with('/') {
                    self.ws_path.clone()
                } else {
                    format!("/{}", self.ws_path)
                };
                format!("{}://{}:{}{}", scheme, self.host, port, path)
            }
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Largest accepted payload, in bytes
    pub max_message_len: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// How a capture feed is produced
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureDriverConfig {
    /// Run a program and read its stdout
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Replay a file (JPEG still for the camera, WAV for the microphone)
    File {
        path: PathBuf,
        #[serde(default)]
        looped: bool,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CameraConfig {
    pub enabled: bool,
    pub source_id: String,

    /// Publishing interval; 40ms is about 25 frames per second
    pub interval_ms: u64,

    pub on_send_failure: SendFailurePolicy,
    pub driver: CaptureDriverConfig,

    /// Restart policy for the capture program
    pub restart: RetryPolicy,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_id: "camera0".to_string(),
            interval_ms: 40,
            on_send_failure: SendFailurePolicy::Reconnect,
            driver: CaptureDriverConfig::Command {
                program: "libcamera-vid".to_string(),
                args: [
                    "-t", "0", "--codec", "mjpeg", "--width", "640", "--height", "480",
                    "--framerate", "25", "-n", "-o", "-",
                ]
                .iter()
                .map(|a| a.to_string())
                .collect(),
            },
            restart: RetryPolicy::default(),
        }
    }
}

impl CameraConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MicrophoneConfig {
    pub enabled: bool,
    pub sample_rate: u32,
    pub channels: u16,

    /// Samples per channel in one chunk
    pub chunk_samples: usize,

    /// Chunks a slow reader may fall behind before losing the oldest
    pub feed_capacity: usize,

    pub on_send_failure: SendFailurePolicy,
    pub driver: CaptureDriverConfig,
    pub restart: RetryPolicy,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 16000,
            channels: 1,
            chunk_samples: 1024,
            feed_capacity: 256,
            on_send_failure: SendFailurePolicy::Reconnect,
            driver: CaptureDriverConfig::Command {
                program: "arecord".to_string(),
                args: ["-q", "-t", "raw", "-f", "S16_LE", "-r", "16000", "-c", "1"]
                    .iter()
                    .map(|a| a.to_string())
                    .collect(),
            },
            restart: RetryPolicy::default(),
        }
    }
}

impl MicrophoneConfig {
    /// Duration of one chunk; the audio publisher ticks at this rate
    pub fn chunk_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::from_millis(100);
        }
        Duration::from_secs_f64(self.chunk_samples as f64 / self.sample_rate as f64)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub synthesizer: CommandSpec,
    pub player: CommandSpec,

    /// Spoken when a reply cannot be synthesized or a voice query is not
    /// understood
    pub fallback_message: String,

    /// Format of raw PCM the server pushes for playback
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            synthesizer: CommandSpec::new("espeak", &["--stdout"]),
            player: CommandSpec::new("aplay", &["-q", "-"]),
            fallback_message: "Sorry, I did not catch that.".to_string(),
            audio_sample_rate: 24000,
            audio_channels: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl HttpConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Config {
    /// Load from an optional file, then apply `CLASSROOM__*` overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let mut cfg: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;

        if cfg.device.id.trim().is_empty() {
            cfg.device.id = format!("device-{}", uuid::Uuid::new_v4());
        }
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            bail!("server.host must not be empty");
        }
        if self.codec.max_message_len == 0 {
            bail!("codec.max_message_len must be positive");
        }
        if self.microphone.enabled {
            if self.microphone.sample_rate == 0 || self.microphone.channels == 0 {
                bail!("microphone sample_rate and channels must be positive");
            }
            if self.microphone.chunk_samples == 0 {
                bail!("microphone.chunk_samples must be positive");
            }
        }
        if self.playback.audio_sample_rate == 0 || self.playback.audio_channels == 0 {
            bail!("playback audio_sample_rate and audio_channels must be positive");
        }
        if self.camera.enabled && self.camera.interval_ms == 0 {
            bail!("camera.interval_ms must be positive");
        }
        Ok(())
    }
}
