use super::handlers;
use super::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Upper bound for uploaded audio on `/play`
const MAX_AUDIO_BODY: usize = 16 * 1024 * 1024;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::get_status))
        // Discrete events
        .route("/query", post(handlers::submit_query))
        .route("/recognize", post(handlers::recognize))
        .route("/voice/start", post(handlers::start_voice))
        .route("/voice/stop", post(handlers::stop_voice))
        // Local playback
        .route("/speak", post(handlers::speak))
        .route(
            "/play",
            post(handlers::play).layer(DefaultBodyLimit::max(MAX_AUDIO_BODY)),
        )
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
