//! Transcript egress: subscriber sockets.
//!
//! Server-to-client only. Each subscriber drains its own receiver of the
//! room's broadcast channel, so delivery is FIFO per subscriber and a slow
//! peer can only lose its own oldest messages, never stall the room.

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use jwt_common::TokenClaims;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::auth::{authenticate, close_code, TokenQuery};
use crate::rooms::Subscription;
use crate::state::AppState;

/// GET /transcription/{session_id}?token=... upgrades a subscriber socket.
pub async fn transcript_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
) -> Response {
    match authenticate(&state, &session_id, query.token.as_deref()) {
        Ok(claims) => {
            ws.on_upgrade(move |socket| handle_transcript_socket(socket, session_id, claims, state))
        }
        Err(rejection) => rejection,
    }
}

async fn handle_transcript_socket(
    mut socket: WebSocket,
    session_id: String,
    claims: TokenClaims,
    state: AppState,
) {
    if !claims.scope.allows_sink() {
        warn!(session_id, scope = %claims.scope, "transcript socket rejected: scope mismatch");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::SCOPE_DENIED,
                reason: Utf8Bytes::from_static(
                    "Unauthorized: token scope does not allow receiving transcripts",
                ),
            })))
            .await;
        return;
    }

    let Subscription {
        room,
        mut transcripts,
        mut shutdown,
    } = state.rooms.add_subscriber(&session_id);

    info!(
        session_id,
        subscribers = room.subscriber_count(),
        "subscriber connected"
    );

    let (mut sender, mut receiver) = socket.split();

    // Forward the room's transcript stream to this subscriber.
    let forward_session = session_id.clone();
    let mut forward_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                result = transcripts.recv() => match result {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            session_id = %forward_session,
                            skipped,
                            "subscriber lagging; oldest transcripts dropped"
                        );
                    }
                    Err(RecvError::Closed) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: Utf8Bytes::from_static("Room closed"),
                            })))
                            .await;
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: Utf8Bytes::from_static("Room closed"),
                            })))
                            .await;
                        break;
                    }
                }
            }
        }
    });

    // No inbound traffic is expected; drain it to observe the close.
    let drain_session = session_id.clone();
    let mut drain_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(_) => debug!(
                    session_id = %drain_session,
                    "ignoring inbound frame on transcript socket"
                ),
                Err(e) => {
                    debug!(session_id = %drain_session, error = %e, "transcript socket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut forward_task => drain_task.abort(),
        _ = &mut drain_task => forward_task.abort(),
    }

    state.rooms.remove_subscriber(&room);
    info!(session_id, "subscriber disconnected");
}
