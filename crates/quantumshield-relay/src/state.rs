//! Shared application state handed to every handler.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::directory::UserDirectory;
use crate::friends::FriendStore;
use crate::jwt::JwtService;
use crate::rate_limit::RateLimits;
use crate::ws::{PayloadCaps, RelayService, RoomRegistry};

pub struct AppState {
    pub jwt: JwtService,
    pub directory: Arc<dyn UserDirectory>,
    pub friends: Arc<dyn FriendStore>,
    pub relay: Arc<RelayService>,
    pub limits: Arc<RateLimits>,
    pub config: RelayConfig,
}

impl AppState {
    /// Wire the relay engine, room registry, and rate limits from config and
    /// the two store boundaries.
    pub fn new(
        config: RelayConfig,
        directory: Arc<dyn UserDirectory>,
        friends: Arc<dyn FriendStore>,
    ) -> Self {
        let jwt = JwtService::new(config.auth.jwt_secret.as_bytes());
        let limits = Arc::new(RateLimits::new(
            config.limits.events_per_minute,
            config.limits.friend_requests_per_hour,
            config.limits.http_requests_per_minute,
        ));
        let relay = Arc::new(RelayService::new(
            Arc::clone(&directory),
            Arc::clone(&friends),
            Arc::new(RoomRegistry::new()),
            Arc::clone(&limits),
            PayloadCaps {
                max_message_ciphertext_bytes: config.limits.max_message_ciphertext_bytes,
                max_file_data_bytes: config.limits.max_file_data_bytes,
            },
        ));
        Self {
            jwt,
            directory,
            friends,
            relay,
            limits,
            config,
        }
    }
}
