//! Startup configuration, read once from the environment.

use jwt_common::{DEFAULT_ISSUER, MIN_SECRET_LEN};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Filter string for the tracing subscriber (`LOG_LEVEL`).
    pub log_level: String,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    /// `host[:port]` of the transcription backend. The scheme is not fixed
    /// here: each room's `useSsl` flag picks `ws://` or `wss://`.
    pub transcription_service_authority: String,
    pub transcription_api_key: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(|key| std::env::var(key).ok())
    }

    fn load(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = get("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match get("PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "PORT",
                reason: format!("not a port number: {raw}"),
            })?,
            None => 8080,
        };
        let log_level = get("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                var: "JWT_SECRET",
                reason: format!("must be at least {MIN_SECRET_LEN} characters"),
            });
        }
        let jwt_issuer = get("JWT_ISSUER").unwrap_or_else(|| DEFAULT_ISSUER.to_string());

        let backend_url = get("TRANSCRIPTION_SERVICE_URL")
            .ok_or(ConfigError::Missing("TRANSCRIPTION_SERVICE_URL"))?;
        let transcription_service_authority =
            authority_of(&backend_url).ok_or_else(|| ConfigError::Invalid {
                var: "TRANSCRIPTION_SERVICE_URL",
                reason: format!("expected host[:port], got {backend_url}"),
            })?;
        let transcription_api_key =
            get("TRANSCRIPTION_API_KEY").ok_or(ConfigError::Missing("TRANSCRIPTION_API_KEY"))?;

        Ok(Self {
            host,
            port,
            log_level,
            jwt_secret,
            jwt_issuer,
            transcription_service_authority,
            transcription_api_key,
        })
    }
}

/// Accepts either a bare `host[:port]` or a ws/wss/http/https URL and returns
/// the authority part.
fn authority_of(raw: &str) -> Option<String> {
    let rest = ["ws://", "wss://", "http://", "https://"]
        .iter()
        .find_map(|scheme| raw.strip_prefix(scheme))
        .unwrap_or(raw);
    let authority = rest.trim_end_matches('/');
    (!authority.is_empty() && !authority.contains('/')).then(|| authority.to_string())
}
