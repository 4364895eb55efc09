//! Stream publishers
//!
//! One publisher per modality (camera frames, microphone audio). Each one:
//! - samples its capture source on every tick, skipping when nothing is new
//! - sends the sample as one `frame`/`audio` message
//! - on failure drops the sample and reconnects or carries on, per policy
//!
//! Backpressure is by dropping: a publisher never queues samples.

mod stream;
mod ticker;

pub use stream::{PublisherConfig, PublisherStats, SendFailurePolicy, StreamPublisher};
pub use ticker::{IntervalTicker, Ticker};
