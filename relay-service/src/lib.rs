//! ScribeAR relay: a real-time audio-to-transcript fan-out service.
//!
//! Each session has one authenticated audio producer and any number of
//! authenticated subscribers. The relay owns the per-session room state,
//! bridges audio to the transcription backend over a framed WebSocket
//! stream, and fans transcripts out to every subscriber, with at most one
//! backend connection per session.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod rooms;
pub mod state;
pub mod transcription;
pub mod ws_audio;
pub mod ws_transcript;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the full HTTP/WebSocket router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/rooms", get(http::list_rooms).post(http::create_room))
        .route("/rooms/{session_id}", get(http::get_room))
        .route("/audio/{session_id}", get(ws_audio::audio_ws_handler))
        .route(
            "/transcription/{session_id}",
            get(ws_transcript::transcript_ws_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
