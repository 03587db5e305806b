//! Media engine admin API (§6.3): opaque-transport room/forwarder CRUD plus
//! anchor-instance lifecycle, modeled as traits so the signaling session
//! controller and the media-node reconciler never depend on a concrete
//! media-engine transport.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use control_proto::SessionDescription;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaEngineError {
    #[error("room or resource already existed")]
    AlreadyExisted,
    #[error("room or resource not found")]
    NotFound,
    #[error("request returned a non-success response")]
    NoneSuccessResponse,
    #[error("request failed: {0}")]
    FailedRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub media_room_id: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderSummary {
    pub stream_id: i64,
    pub host: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnchorEvent {
    pub jsep: Option<SessionDescription>,
}

/// Required media-engine admin operations (§6.3).
#[async_trait::async_trait]
pub trait MediaEngineClient: Send + Sync {
    async fn create_room(&self, media_room_id: i64, description: &str, pin: &str) -> Result<(), MediaEngineError>;

    /// "not found" is idempotent: treat it as success.
    async fn destroy_room(&self, media_room_id: i64) -> Result<(), MediaEngineError>;

    async fn list_rooms(&self) -> Result<Vec<RoomSummary>, MediaEngineError>;

    async fn create_rtp_forwarder(
        &self,
        media_room_id: i64,
        host: IpAddr,
        port: u16,
    ) -> Result<i64, MediaEngineError>;

    async fn list_rtp_forwarders(&self, media_room_id: i64) -> Result<Vec<ForwarderSummary>, MediaEngineError>;

    /// "not found" is idempotent: treat it as success.
    async fn stop_rtp_forwarder(&self, media_room_id: i64, stream_id: i64) -> Result<(), MediaEngineError>;

    /// `session_id`/`handle_id` of `0` means "create new"; otherwise adopts
    /// the existing pair.
    async fn create_anchor_instance(
        &self,
        connection_id: &str,
        session_id: i64,
        handle_id: i64,
    ) -> Result<Arc<dyn Anchor>, MediaEngineError>;
}

/// A materialized (session_id, handle_id) pair and the operations the
/// signaling session controller drives against it.
#[async_trait::async_trait]
pub trait Anchor: Send + Sync {
    fn session_id(&self) -> i64;
    fn handle_id(&self) -> i64;

    /// `Ok(true)` if the session still exists upstream.
    async fn check(&self) -> Result<bool, MediaEngineError>;

    async fn join(&self, room_description: &str, sdp: SessionDescription) -> Result<(), MediaEngineError>;

    async fn ice_candidate(&self, candidate: serde_json::Value) -> Result<(), MediaEngineError>;

    async fn keep_alive(&self) -> Result<(), MediaEngineError>;

    /// Drains one batch of pending events; callers loop until they observe
    /// one with `jsep.is_some()`.
    async fn get_events(&self) -> Result<Vec<AnchorEvent>, MediaEngineError>;
}

struct RoomRecord {
    description: String,
    forwarders: HashMap<i64, ForwarderSummary>,
}

struct AnchorState {
    events: Vec<AnchorEvent>,
    exists: bool,
}

/// In-memory [`MediaEngineClient`] test double.
pub struct FakeMediaEngine {
    rooms: Mutex<HashMap<i64, RoomRecord>>,
    anchors: Arc<Mutex<HashMap<(i64, i64), AnchorState>>>,
    next_stream_id: AtomicI64,
    next_session_id: AtomicI64,
}

impl FakeMediaEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            anchors: Arc::new(Mutex::new(HashMap::new())),
            next_stream_id: AtomicI64::new(1),
            next_session_id: AtomicI64::new(1),
        })
    }

    /// Test hook: push an answer event for `(session_id, handle_id)` so a
    /// pending `offer` resolves.
    pub fn push_answer(&self, session_id: i64, handle_id: i64, sdp: SessionDescription) {
        self.anchors
            .lock()
            .expect("fake media engine poisoned")
            .entry((session_id, handle_id))
            .or_insert_with(|| AnchorState { events: Vec::new(), exists: true })
            .events
            .push(AnchorEvent { jsep: Some(sdp) });
    }

    /// Test hook: mark an anchor as gone so `Check` reports non-existence.
    pub fn kill_anchor(&self, session_id: i64, handle_id: i64) {
        if let Some(state) = self
            .anchors
            .lock()
            .expect("fake media engine poisoned")
            .get_mut(&(session_id, handle_id))
        {
            state.exists = false;
        }
    }
}

#[async_trait::async_trait]
impl MediaEngineClient for FakeMediaEngine {
    async fn create_room(&self, media_room_id: i64, description: &str, _pin: &str) -> Result<(), MediaEngineError> {
        let mut rooms = self.rooms.lock().expect("fake media engine poisoned");
        if rooms.contains_key(&media_room_id) {
            return Err(MediaEngineError::AlreadyExisted);
        }
        rooms.insert(
            media_room_id,
            RoomRecord {
                description: description.to_owned(),
                forwarders: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn destroy_room(&self, media_room_id: i64) -> Result<(), MediaEngineError> {
        self.rooms.lock().expect("fake media engine poisoned").remove(&media_room_id);
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<RoomSummary>, MediaEngineError> {
        Ok(self
            .rooms
            .lock()
            .expect("fake media engine poisoned")
            .iter()
            .map(|(id, record)| RoomSummary {
                media_room_id: *id,
                description: record.description.clone(),
            })
            .collect())
    }

    async fn create_rtp_forwarder(
        &self,
        media_room_id: i64,
        host: IpAddr,
        port: u16,
    ) -> Result<i64, MediaEngineError> {
        let mut rooms = self.rooms.lock().expect("fake media engine poisoned");
        let room = rooms.get_mut(&media_room_id).ok_or(MediaEngineError::NotFound)?;
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        room.forwarders.insert(stream_id, ForwarderSummary { stream_id, host, port });
        Ok(stream_id)
    }

    async fn list_rtp_forwarders(&self, media_room_id: i64) -> Result<Vec<ForwarderSummary>, MediaEngineError> {
        let rooms = self.rooms.lock().expect("fake media engine poisoned");
        let room = rooms.get(&media_room_id).ok_or(MediaEngineError::NotFound)?;
        Ok(room.forwarders.values().cloned().collect())
    }

    async fn stop_rtp_forwarder(&self, media_room_id: i64, stream_id: i64) -> Result<(), MediaEngineError> {
        if let Some(room) = self.rooms.lock().expect("fake media engine poisoned").get_mut(&media_room_id) {
            room.forwarders.remove(&stream_id);
        }
        Ok(())
    }

    async fn create_anchor_instance(
        &self,
        _connection_id: &str,
        session_id: i64,
        handle_id: i64,
    ) -> Result<Arc<dyn Anchor>, MediaEngineError> {
        let (session_id, handle_id) = if session_id == 0 && handle_id == 0 {
            let sid = self.next_session_id.fetch_add(1, Ordering::SeqCst);
            let hid = self.next_session_id.fetch_add(1, Ordering::SeqCst);
            (sid, hid)
        } else {
            (session_id, handle_id)
        };
        self.anchors
            .lock()
            .expect("fake media engine poisoned")
            .entry((session_id, handle_id))
            .or_insert_with(|| AnchorState { events: Vec::new(), exists: true });
        Ok(Arc::new(FakeAnchor {
            session_id,
            handle_id,
            anchors: Arc::clone(&self.anchors),
        }))
    }
}

struct FakeAnchor {
    session_id: i64,
    handle_id: i64,
    anchors: Arc<Mutex<HashMap<(i64, i64), AnchorState>>>,
}

#[async_trait::async_trait]
impl Anchor for FakeAnchor {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    fn handle_id(&self) -> i64 {
        self.handle_id
    }

    async fn check(&self) -> Result<bool, MediaEngineError> {
        let anchors = self.anchors.lock().expect("fake media engine poisoned");
        Ok(anchors.get(&(self.session_id, self.handle_id)).is_some_and(|s| s.exists))
    }

    async fn join(&self, _room_description: &str, _sdp: SessionDescription) -> Result<(), MediaEngineError> {
        Ok(())
    }

    async fn ice_candidate(&self, _candidate: serde_json::Value) -> Result<(), MediaEngineError> {
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), MediaEngineError> {
        Ok(())
    }

    async fn get_events(&self) -> Result<Vec<AnchorEvent>, MediaEngineError> {
        let mut anchors = self.anchors.lock().expect("fake media engine poisoned");
        let state = anchors
            .get_mut(&(self.session_id, self.handle_id))
            .ok_or(MediaEngineError::NotFound)?;
        Ok(std::mem::take(&mut state.events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_room_rejects_duplicate() {
        let engine = FakeMediaEngine::new();
        engine.create_room(100_000, "R1", "1234").await.unwrap();
        assert_eq!(
            engine.create_room(100_000, "R1", "1234").await,
            Err(MediaEngineError::AlreadyExisted)
        );
    }

    #[tokio::test]
    async fn destroy_and_stop_forwarder_are_idempotent() {
        let engine = FakeMediaEngine::new();
        engine.destroy_room(999).await.unwrap();
        engine.stop_rtp_forwarder(999, 1).await.unwrap();
    }

    #[tokio::test]
    async fn anchor_zero_ids_creates_fresh_session() {
        let engine = FakeMediaEngine::new();
        let anchor = engine.create_anchor_instance("conn-1", 0, 0).await.unwrap();
        assert_ne!(anchor.session_id(), 0);
        assert_ne!(anchor.handle_id(), 0);
        assert!(anchor.check().await.unwrap());
    }

    #[tokio::test]
    async fn killed_anchor_fails_check() {
        let engine = FakeMediaEngine::new();
        let anchor = engine.create_anchor_instance("conn-1", 0, 0).await.unwrap();
        engine.kill_anchor(anchor.session_id(), anchor.handle_id());
        assert!(!anchor.check().await.unwrap());
    }

    #[tokio::test]
    async fn get_events_returns_pushed_answer() {
        let engine = FakeMediaEngine::new();
        let anchor = engine.create_anchor_instance("conn-1", 0, 0).await.unwrap();
        engine.push_answer(
            anchor.session_id(),
            anchor.handle_id(),
            SessionDescription { kind: "answer".into(), sdp: "v=0".into() },
        );
        let events = anchor.get_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].jsep.is_some());
    }
}
