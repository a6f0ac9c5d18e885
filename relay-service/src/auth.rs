//! Pre-upgrade authentication gate for the WebSocket endpoints.
//!
//! Browser WebSocket clients cannot set request headers, so the bearer token
//! rides in the `token` query parameter. Everything that can be checked
//! before the upgrade (token presence, signature, issuer, expiry, session
//! binding) is rejected with a plain 401; scope enforcement happens after the
//! upgrade so the handler can answer with the 4003 close code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use jwt_common::TokenClaims;
use serde::Deserialize;
use tracing::warn;

use crate::state::AppState;

/// Application close codes (the 4000 range is reserved for applications).
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    /// Room already has an audio source.
    pub const SOURCE_TAKEN: u16 = 4001;
    /// Token scope does not allow the attempted role.
    pub const SCOPE_DENIED: u16 = 4003;
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Validates the `token` query parameter and binds it to the session named in
/// the URL path. Failure detail goes to the log; the wire gets a generic 401.
pub fn authenticate(
    state: &AppState,
    session_id: &str,
    token: Option<&str>,
) -> Result<TokenClaims, Response> {
    let Some(token) = token else {
        warn!(session_id, "websocket rejected: missing token");
        return Err((StatusCode::UNAUTHORIZED, "Missing authentication token").into_response());
    };

    let claims = match state.verifier.verify(token) {
        Ok(claims) => claims,
        Err(reason) => {
            warn!(session_id, %reason, "websocket rejected: invalid token");
            return Err((StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response());
        }
    };

    if claims.session_id != session_id {
        warn!(
            session_id,
            token_session = %claims.session_id,
            "websocket rejected: token bound to another session"
        );
        return Err((StatusCode::UNAUTHORIZED, "Token is not valid for this session").into_response());
    }

    Ok(claims)
}
