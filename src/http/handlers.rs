use super::state::AppState;
use crate::channel::ChannelError;
use crate::device::DeviceError;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn accepted(status: &str, message: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        Json(AcceptedResponse {
            status: status.to_string(),
            message: message.into(),
        }),
    )
        .into_response()
}

fn bad_request(error: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn device_error(error: DeviceError) -> Response {
    let status = match &error {
        DeviceError::NotConnected | DeviceError::Channel(ChannelError::Closed) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DeviceError::Channel(ChannelError::QueueFull(_)) => StatusCode::TOO_MANY_REQUESTS,
        DeviceError::Channel(ChannelError::Rejected(_)) => StatusCode::PAYLOAD_TOO_LARGE,
        DeviceError::NoFrame => StatusCode::SERVICE_UNAVAILABLE,
        DeviceError::MicrophoneDisabled
        | DeviceError::AlreadyRecording
        | DeviceError::NotRecording => StatusCode::CONFLICT,
        DeviceError::Capture(_) | DeviceError::PlaybackStopped => {
            error!("Request failed: {}", error);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /status
/// Sessions, publishers, playback and the last recognition result
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.device.status().await))
}

/// POST /query
/// Send a typed question to the server
pub async fn submit_query(
    State(state): State<AppState>,
    Json(req): Json<TextRequest>,
) -> impl IntoResponse {
    let text = req.text.trim();
    if text.is_empty() {
        return bad_request("text must not be empty");
    }

    match state.device.submit_query(text).await {
        Ok(()) => accepted("sent", "Query sent"),
        Err(e) => device_error(e),
    }
}

/// POST /recognize
/// Send the latest camera frame for recognition
pub async fn recognize(State(state): State<AppState>) -> impl IntoResponse {
    match state.device.recognize().await {
        Ok(()) => accepted("sent", "Frame sent for recognition"),
        Err(e) => device_error(e),
    }
}

/// POST /voice/start
/// Begin recording a voice query
pub async fn start_voice(State(state): State<AppState>) -> impl IntoResponse {
    match state.device.start_voice_query().await {
        Ok(()) => accepted("recording", "Voice recording started"),
        Err(e) => device_error(e),
    }
}

/// POST /voice/stop
/// Stop recording and send the voice query
pub async fn stop_voice(State(state): State<AppState>) -> impl IntoResponse {
    match state.device.stop_voice_query().await {
        Ok(outcome) => {
            info!("Voice query finished: {:?}", outcome);
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => device_error(e),
    }
}

/// POST /speak
/// Queue text for speech output
pub async fn speak(
    State(state): State<AppState>,
    Json(req): Json<TextRequest>,
) -> impl IntoResponse {
    if req.text.trim().is_empty() {
        return bad_request("text must not be empty");
    }

    match state.device.speak(&req.text) {
        Ok(()) => accepted("queued", "Speech queued"),
        Err(e) => device_error(e),
    }
}

/// POST /play
/// Queue a WAV body for playback
pub async fn play(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    if body.is_empty() {
        return bad_request("request body must contain audio");
    }

    let len = body.len();
    match state.device.play(body) {
        Ok(()) => accepted("queued", format!("{} bytes of audio queued", len)),
        Err(e) => device_error(e),
    }
}
