//! Wire types for the ScribeAR relay.
//!
//! Three surfaces share these shapes:
//! - the subscriber WebSocket (`/transcription/{sessionId}`), which carries
//!   [`TranscriptMessage`] as JSON text frames,
//! - the transcription backend stream, which receives the two
//!   [`BackendHandshake`] frames and then replies with the same
//!   [`TranscriptMessage`] layout,
//! - the room REST surface (`/rooms`), which exchanges [`RoomInfo`] and the
//!   create-room request/response bodies.
//!
//! Transcript payloads are relayed verbatim: the relay never reinterprets
//! `text`/`starts`/`ends`, it only re-frames them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Word-aligned transcript content as produced by the backend.
///
/// `starts`/`ends` are per-word timestamps in seconds; the backend may omit
/// them entirely, in which case they serialize as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegments {
    pub text: Vec<String>,
    pub starts: Option<Vec<f64>>,
    pub ends: Option<Vec<f64>>,
}

/// A transcript frame, tagged by `type`.
///
/// `ip_transcript` is the current best guess for the in-flight utterance and
/// overwrites any prior in-progress text; `final_transcript` is committed,
/// append-only text. Unknown tags deserialize to [`TranscriptMessage::Unknown`]
/// so a newer backend cannot kill the stream; the relay never serializes that
/// variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptMessage {
    IpTranscript(TranscriptSegments),
    FinalTranscript(TranscriptSegments),
    #[serde(other, skip_serializing)]
    Unknown,
}

/// The two mandatory frames the relay sends after opening a backend stream,
/// in order: `AUTH`, then `CONFIG`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendHandshake {
    #[serde(rename = "AUTH")]
    Auth { api_key: String },
    #[serde(rename = "CONFIG")]
    Config { config: StreamConfig },
}

/// Audio stream parameters announced to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub num_channels: u16,
}

/// Per-session transcription configuration, pinned at room creation and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscriptionSessionConfig {
    pub provider_key: String,
    pub use_ssl: bool,
    pub sample_rate: u32,
    pub num_channels: u16,
}

impl Default for TranscriptionSessionConfig {
    fn default() -> Self {
        Self {
            provider_key: "whisper".to_string(),
            use_ssl: false,
            sample_rate: 16_000,
            num_channels: 1,
        }
    }
}

impl TranscriptionSessionConfig {
    /// Rejects configs the backend handshake could not represent.
    pub fn validate(&self) -> Result<(), String> {
        if self.provider_key.is_empty() {
            return Err("providerKey must not be empty".to_string());
        }
        if self.sample_rate == 0 {
            return Err("sampleRate must be a positive integer".to_string());
        }
        if self.num_channels == 0 {
            return Err("numChannels must be a positive integer".to_string());
        }
        Ok(())
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            sample_rate: self.sample_rate,
            num_channels: self.num_channels,
        }
    }
}

/// Snapshot of one room, as returned by the REST surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub session_id: String,
    pub has_source: bool,
    pub subscriber_count: usize,
    pub transcription_connected: bool,
    pub created_at: DateTime<Utc>,
    pub transcription_session_config: TranscriptionSessionConfig,
}

/// Body of `POST /rooms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_config: Option<TranscriptionSessionConfig>,
}

/// 201 body of `POST /rooms`: the sessionId with the effective config echoed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub session_id: String,
    pub transcription_config: TranscriptionSessionConfig,
}

/// Body of `GET /rooms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomInfo>,
    pub count: usize,
}
