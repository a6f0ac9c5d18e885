//! Shared application state: the token verifier and the room manager, wired
//! with plain constructors and handed to every handler.

use std::sync::Arc;

use jwt_common::TokenVerifier;

use crate::config::Config;
use crate::rooms::RoomManager;
use crate::transcription::BackendSettings;

#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<TokenVerifier>,
    pub rooms: Arc<RoomManager>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self {
            verifier: Arc::new(TokenVerifier::new(&config.jwt_secret, &config.jwt_issuer)),
            rooms: Arc::new(RoomManager::new(BackendSettings {
                authority: config.transcription_service_authority.clone(),
                api_key: config.transcription_api_key.clone(),
            })),
        }
    }
}
