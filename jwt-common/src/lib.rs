//! Claims and verification for the short-lived bearer tokens the
//! session-manager issues to kiosks and students.
//!
//! The relay only *verifies* tokens (HS256, shared symmetric secret). The
//! [`mint`] helper exists for tests and the smoke client behind the `mint`
//! feature and is deliberately not compiled into the relay.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default issuer expected in the `iss` claim.
pub const DEFAULT_ISSUER: &str = "scribear-session-manager";

/// Minimum length of the shared HMAC secret.
pub const MIN_SECRET_LEN: usize = 32;

/// What a token allows its holder to do within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Stream audio into the session.
    Source,
    /// Receive transcripts from the session.
    Sink,
    /// Either role.
    Both,
}

impl Scope {
    pub fn allows_source(self) -> bool {
        matches!(self, Self::Source | Self::Both)
    }

    pub fn allows_sink(self) -> bool {
        matches!(self, Self::Sink | Self::Both)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Source => "source",
            Self::Sink => "sink",
            Self::Both => "both",
        })
    }
}

/// Claims carried by a relay token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// The session this token is bound to; the unit of routing and
    /// authorization.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub scope: Scope,
    /// Optional producer identity, carried for log attribution only.
    #[serde(rename = "sourceId", skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub iss: String,
    /// Expiry as seconds since the Unix epoch.
    pub exp: usize,
}

/// Why a token was rejected. Callers log the variant and collapse it to a
/// generic "invalid" outward.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("wrong issuer")]
    WrongIssuer,
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => Self::BadSignature,
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidIssuer => Self::WrongIssuer,
            ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => Self::WrongIssuer,
            _ => Self::Malformed,
        }
    }
}

/// Validates bearer tokens against the shared secret and expected issuer.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, issuer: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.validate_exp = true;
        validation.leeway = 60; // clock skew between issuer and relay

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError> {
        decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(VerifyError::from)
    }
}

/// Signs `claims` with `secret`. Test/tooling helper; the relay never calls
/// this.
#[cfg(any(test, feature = "mint"))]
pub fn mint(secret: &str, claims: &TokenClaims) -> Result<String, jsonwebtoken::errors::Error> {
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(Algorithm::HS256),
        claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "a-test-secret-that-is-long-enough-to-pass";

    fn now_secs() -> usize {
        #[allow(clippy::expect_used)]
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch");
        now.as_secs() as usize
    }

    fn claims(scope: Scope, exp_offset_secs: i64) -> TokenClaims {
        TokenClaims {
            session_id: "S1".to_string(),
            scope,
            source_id: None,
            iss: DEFAULT_ISSUER.to_string(),
            exp: (now_secs() as i64 + exp_offset_secs) as usize,
        }
    }

    #[test]
    fn valid_token_round_trips() {
        let verifier = TokenVerifier::new(SECRET, DEFAULT_ISSUER);
        let token = mint(SECRET, &claims(Scope::Source, 3600)).unwrap();

        let verified = verifier.verify(&token).unwrap();
        assert_eq!(verified.session_id, "S1");
        assert_eq!(verified.scope, Scope::Source);
        assert!(verified.source_id.is_none());
    }

    #[test]
    fn source_id_claim_survives() {
        let verifier = TokenVerifier::new(SECRET, DEFAULT_ISSUER);
        let mut c = claims(Scope::Both, 3600);
        c.source_id = Some("kiosk-12".to_string());
        let token = mint(SECRET, &c).unwrap();

        assert_eq!(
            verifier.verify(&token).unwrap().source_id.as_deref(),
            Some("kiosk-12")
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let verifier = TokenVerifier::new(SECRET, DEFAULT_ISSUER);
        // Far enough in the past to clear the 60s leeway.
        let token = mint(SECRET, &claims(Scope::Sink, -3600)).unwrap();

        assert_eq!(verifier.verify(&token), Err(VerifyError::Expired));
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let verifier = TokenVerifier::new(SECRET, DEFAULT_ISSUER);
        let mut c = claims(Scope::Sink, 3600);
        c.iss = "someone-else".to_string();
        let token = mint(SECRET, &c).unwrap();

        assert_eq!(verifier.verify(&token), Err(VerifyError::WrongIssuer));
    }

    #[test]
    fn wrong_secret_is_a_bad_signature() {
        let verifier = TokenVerifier::new(SECRET, DEFAULT_ISSUER);
        let token = mint("another-secret-also-long-enough-to-use", &claims(Scope::Sink, 3600))
            .unwrap();

        assert_eq!(verifier.verify(&token), Err(VerifyError::BadSignature));
    }

    #[test]
    fn garbage_is_malformed() {
        let verifier = TokenVerifier::new(SECRET, DEFAULT_ISSUER);
        assert_eq!(
            verifier.verify("not.a.token"),
            Err(VerifyError::Malformed)
        );
        assert_eq!(verifier.verify(""), Err(VerifyError::Malformed));
    }

    #[test]
    fn scope_lattice() {
        assert!(Scope::Source.allows_source());
        assert!(!Scope::Source.allows_sink());
        assert!(Scope::Sink.allows_sink());
        assert!(!Scope::Sink.allows_source());
        assert!(Scope::Both.allows_source());
        assert!(Scope::Both.allows_sink());
    }

    #[test]
    fn scope_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Scope::Both).unwrap(), r#""both""#);
        let parsed: Scope = serde_json::from_str(r#""sink""#).unwrap();
        assert_eq!(parsed, Scope::Sink);
    }
}
