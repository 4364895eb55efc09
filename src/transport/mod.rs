//! Transport sessions
//!
//! A [`TransportSession`] owns one connection to the server and provides:
//! - connect with a configurable retry policy
//! - atomic message sends (writers are serialized)
//! - blocking receives that never contend with writers
//! - idempotent close that interrupts pending operations
//!
//! The connection itself comes from a [`Dialer`]: TCP or WebSocket.

mod link;
mod retry;
mod session;
mod ws;

pub use link::{Dialer, Link, LinkReader, LinkWriter, TcpDialer};
pub use retry::RetryPolicy;
pub use session::{SessionError, SessionInfo, SessionState, TransportSession};
pub use ws::WsDialer;
