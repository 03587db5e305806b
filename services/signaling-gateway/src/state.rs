//! Shared gateway state: everything `ws_handler` needs to build a fresh
//! `SessionContext` per accepted connection, plus the config values the
//! HTTP boundary itself reads (bind address, allowed origins).

use std::sync::Arc;

use room_state::{MemoryRoomUserBroker, RoomUserStore};
use rpc_engine::HandlerRegistry;
use session_lease::SessionLease;
use token_codec::TokenCodec;

use crate::auth::TokenVerifier;
use crate::config::GatewayConfig;
use crate::handlers;
use crate::media_registry::MediaEngineRegistry;
use crate::rooms::RoomDirectory;
use crate::session::SessionContext;

#[derive(Clone)]
pub struct AppState {
    pub server_id: Arc<str>,
    pub allowed_origins: Arc<[String]>,
    pub rooms: Arc<RoomDirectory>,
    pub media_registry: Arc<dyn MediaEngineRegistry>,
    pub token_codec: Arc<TokenCodec>,
    pub token_verifier: Arc<dyn TokenVerifier>,
    pub room_users: Arc<RoomUserStore>,
    pub lease_store: Arc<dyn session_lease::LeaseStore>,
    pub registry: Arc<HandlerRegistry<SessionContext>>,
}

impl AppState {
    /// # Panics
    /// Panics if the session controller's methods fail to register, which
    /// only happens on a duplicate method name — a programming error, not a
    /// runtime condition.
    #[must_use]
    pub fn new(
        config: &GatewayConfig,
        rooms: Arc<RoomDirectory>,
        media_registry: Arc<dyn MediaEngineRegistry>,
        token_verifier: Arc<dyn TokenVerifier>,
        lease_store: Arc<dyn session_lease::LeaseStore>,
    ) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        handlers::register(&registry).expect("session controller method registration");
        Self {
            server_id: Arc::from(config.server_id.as_str()),
            allowed_origins: Arc::from(config.allowed_origins.as_slice()),
            rooms,
            media_registry,
            token_codec: Arc::new(TokenCodec::new(&config.token_key).expect("config validated key length")),
            token_verifier,
            room_users: Arc::new(RoomUserStore::new(Arc::new(MemoryRoomUserBroker::new()))),
            lease_store,
            registry,
        }
    }

    #[must_use]
    pub fn new_lease(&self, user_id: &str, connection_id: &str) -> Arc<SessionLease> {
        Arc::new(SessionLease::new(Arc::clone(&self.lease_store), self.server_id.to_string(), user_id.to_owned(), connection_id.to_owned()))
    }
}
