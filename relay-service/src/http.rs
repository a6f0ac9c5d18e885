//! Room REST surface and health probe.
//!
//! Unauthenticated by contract: the REST surface carries no secrets and
//! exists so a kiosk can pin per-session transcription config before its
//! audio socket connects.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use scribear_proto::{CreateRoomRequest, CreateRoomResponse, RoomInfo, RoomListResponse};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::RelayError;
use crate::state::AppState;

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "reqId": Uuid::new_v4(), "status": "ok" }))
}

/// POST /rooms creates a room with pinned transcription config.
pub async fn create_room(
    State(state): State<AppState>,
    Json(body): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<CreateRoomResponse>), RelayError> {
    if let Some(config) = &body.transcription_config {
        config.validate().map_err(RelayError::InvalidConfig)?;
    }

    let room = state
        .rooms
        .create_room(&body.session_id, body.transcription_config)?;
    info!(session_id = %body.session_id, "room created via REST");

    Ok((
        StatusCode::CREATED,
        Json(CreateRoomResponse {
            session_id: body.session_id,
            transcription_config: room.config().clone(),
        }),
    ))
}

/// GET /rooms
pub async fn list_rooms(State(state): State<AppState>) -> Json<RoomListResponse> {
    let rooms = state.rooms.list_rooms();
    let count = rooms.len();
    Json(RoomListResponse { rooms, count })
}

/// GET /rooms/{session_id}
pub async fn get_room(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<RoomInfo>, RelayError> {
    state
        .rooms
        .get_room(&session_id)
        .map(|room| Json(room.info()))
        .ok_or(RelayError::RoomNotFound(session_id))
}
