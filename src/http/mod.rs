//! HTTP API for local control (kiosk UI, scripts)
//!
//! This module provides a REST API for triggering discrete events:
//! - GET /health - Health check
//! - GET /status - Device status snapshot
//! - POST /query - Send a text query `{"text": ...}`
//! - POST /recognize - Send the latest camera frame for recognition
//! - POST /voice/start - Start recording a voice query
//! - POST /voice/stop - Stop recording and send the voice query
//! - POST /speak - Speak text locally `{"text": ...}`
//! - POST /play - Play a WAV body locally

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
