//! Audio ingress: the per-session producer socket.
//!
//! One socket per room may hold the source slot. Binary frames are opaque
//! and forwarded to the room's backend client; text frames are ignored.
//! Silence is valid, so there is no read timeout.

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use jwt_common::TokenClaims;
use tracing::{debug, info, warn};

use crate::auth::{authenticate, close_code, TokenQuery};
use crate::rooms::SourceAttachment;
use crate::state::AppState;

/// GET /audio/{session_id}?token=... upgrades the producer socket.
pub async fn audio_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
) -> Response {
    match authenticate(&state, &session_id, query.token.as_deref()) {
        Ok(claims) => {
            ws.on_upgrade(move |socket| handle_audio_socket(socket, session_id, claims, state))
        }
        Err(rejection) => rejection,
    }
}

async fn handle_audio_socket(
    mut socket: WebSocket,
    session_id: String,
    claims: TokenClaims,
    state: AppState,
) {
    if !claims.scope.allows_source() {
        warn!(session_id, scope = %claims.scope, "audio socket rejected: scope mismatch");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::SCOPE_DENIED,
                reason: Utf8Bytes::from_static(
                    "Unauthorized: token scope does not allow audio streaming",
                ),
            })))
            .await;
        return;
    }

    let Some(SourceAttachment { room, mut shutdown }) = state.rooms.set_audio_source(&session_id)
    else {
        info!(session_id, "audio socket rejected: room already has a source");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::SOURCE_TAKEN,
                reason: Utf8Bytes::from_static("Room already has an audio source"),
            })))
            .await;
        return;
    };

    info!(session_id, source_id = ?claims.source_id, "audio source connected");

    let mut room_closed = false;
    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(Message::Binary(frame))) => room.forward_audio(frame),
                Some(Ok(Message::Text(_))) => {
                    debug!(session_id, "ignoring text frame on audio socket");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong are answered by the transport
                Some(Err(e)) => {
                    debug!(session_id, error = %e, "audio socket error");
                    break;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    room_closed = true;
                    break;
                }
            }
        }
    }

    if room_closed {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from_static("Room closed"),
            })))
            .await;
    }

    state.rooms.remove_audio_source(&room);
    info!(session_id, "audio source detached");
}
