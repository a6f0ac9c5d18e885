//! Error taxonomy for the REST surface.
//!
//! WebSocket-side failures never pass through here: auth failures are
//! rejected before the upgrade (401) or signalled with close codes 4001/4003
//! by the handlers, and transport errors are contained to their own
//! connection.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("room {0} already exists")]
    RoomExists(String),
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("invalid transcription config: {0}")]
    InvalidConfig(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::RoomExists(_) => StatusCode::CONFLICT,
            Self::RoomNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_taxonomy() {
        assert_eq!(
            RelayError::RoomExists("S1".into()).into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RelayError::RoomNotFound("S1".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::InvalidConfig("sampleRate".into())
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
    }
}
