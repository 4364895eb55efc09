pub mod backend;
pub mod capture;
pub mod channel;
pub mod codec;
pub mod config;
pub mod device;
pub mod http;
pub mod playback;
pub mod publisher;
pub mod transport;

pub use capture::{AudioChunk, AudioClip, AudioFeed, CaptureSource, Frame, FrameFeed, Sample};
pub use channel::{ChannelError, CommandChannel, Event, Response, ResponseRouter};
pub use codec::{CodecError, FrameCodec, Message, MessageKind};
pub use config::Config;
pub use device::{Backends, Device, DeviceError, DeviceStatus, ShutdownReason};
pub use http::{create_router, AppState};
pub use playback::{PlaybackRequest, PlaybackSink, Renderer};
pub use publisher::{IntervalTicker, StreamPublisher, Ticker};
pub use transport::{RetryPolicy, SessionError, SessionState, TransportSession};
