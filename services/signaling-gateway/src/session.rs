//! Per-connection state the session controller's handlers close over
//! (`C` in `rpc_engine::Connection<C>`). Everything here is `Arc`-shared so
//! `SessionContext` stays cheaply `Clone`, as `Connection` requires —
//! mutable per-connection state (the joined anchor) lives behind its own
//! mutex so every handler invocation sees the same state, not a snapshot.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use media_engine_client::Anchor;
use room_state::RoomUserStore;
use session_lease::SessionLease;
use token_codec::TokenCodec;
use tokio::sync::Mutex as AsyncMutex;

use crate::media_registry::MediaEngineRegistry;
use crate::rooms::RoomDirectory;

/// What `join` materializes; cleared on `leave` or on connection close.
#[derive(Clone)]
pub struct JoinedState {
    pub anchor: Arc<dyn Anchor>,
    pub nonce: String,
}

#[derive(Clone)]
pub struct SessionContext {
    pub connection_id: String,
    pub user_id: String,
    pub room_id: String,
    pub rooms: Arc<RoomDirectory>,
    pub media_registry: Arc<dyn MediaEngineRegistry>,
    pub token_codec: Arc<TokenCodec>,
    pub room_users: Arc<RoomUserStore>,
    pub lease: Arc<SessionLease>,
    pub joined: Arc<AsyncMutex<Option<JoinedState>>>,
    /// Set by `leave`; the `/ws` loop checks this after every dispatched
    /// request and closes the connection once it sees it.
    pub close_requested: Arc<AtomicBool>,
}

impl SessionContext {
    #[must_use]
    pub fn new(
        connection_id: String,
        user_id: String,
        room_id: String,
        rooms: Arc<RoomDirectory>,
        media_registry: Arc<dyn MediaEngineRegistry>,
        token_codec: Arc<TokenCodec>,
        room_users: Arc<RoomUserStore>,
        lease: Arc<SessionLease>,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            room_id,
            rooms,
            media_registry,
            token_codec,
            room_users,
            lease,
            joined: Arc::new(AsyncMutex::new(None)),
            close_requested: Arc::new(AtomicBool::new(false)),
        }
    }
}
