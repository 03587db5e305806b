//! Media-node reconciler (§4.8): on every room event, derives four
//! predicates from the entity and the local active-rooms map, then applies
//! the six ordered transitions. `restart_detected` re-derives the active
//! map straight from the media engine and re-asserts every room.

use std::collections::HashMap;
use std::sync::Arc;

use control_proto::{MediaNodeBinding, MediaNodeBindingStatus, MixerEndpoint, RoomEntity, RoomStatus};
use kv_watch::{ChangeError, ChangeHandler, KvStore, PrefixedWatcher, StartError, TransformError, Transformer};
use kv_watch::merge_room_subkey;
use media_engine_client::{MediaEngineClient, MediaEngineError};
use rand::rngs::OsRng;
use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::active::ActiveRoom;

const ROOM_ID_LOW: i64 = 100_000;
const ROOM_ID_HIGH: i64 = 1_000_000;
const CREATE_ROOM_ATTEMPTS: u32 = 5;

fn random_media_room_id() -> i64 {
    OsRng.gen_range(ROOM_ID_LOW..ROOM_ID_HIGH)
}

fn is_assigned_to_us(self_id: &str, room: &RoomEntity) -> bool {
    room.meta.is_some()
        && room
            .live_meta
            .as_ref()
            .is_some_and(|lm| lm.bound_media_node == self_id && lm.status == RoomStatus::OnAir)
}

fn mixer_endpoint(room: &RoomEntity) -> Option<MixerEndpoint> {
    room.mixer_binding.as_ref().map(|b| b.mixer).filter(|ep| ep.port != 0)
}

struct ReconcilerState {
    self_id: String,
    canary_room_id: String,
    engine: Arc<dyn MediaEngineClient>,
    store: Arc<dyn KvStore>,
    rooms_prefix: String,
    active: AsyncMutex<HashMap<String, ActiveRoom>>,
}

fn binding_key(state: &ReconcilerState, id: &str) -> String {
    format!("{}{id}/media_node_binding", state.rooms_prefix)
}

async fn write_binding(state: &ReconcilerState, id: &str, binding: MediaNodeBinding) {
    let key = binding_key(state, id);
    let value = serde_json::to_vec(&binding).expect("MediaNodeBinding always serializes");
    if let Err(err) = state.store.put(&key, value).await {
        warn!(room_id = %id, error = %err, "failed to write media node binding");
    }
}

async fn clear_binding(state: &ReconcilerState, id: &str) {
    let key = binding_key(state, id);
    if let Err(err) = state.store.delete(&key).await {
        warn!(room_id = %id, error = %err, "failed to clear media node binding");
    }
}

async fn create_media_room(engine: &Arc<dyn MediaEngineClient>, description: &str, pin: &str) -> Result<i64, MediaEngineError> {
    let mut last_err = MediaEngineError::AlreadyExisted;
    for _ in 0..CREATE_ROOM_ATTEMPTS {
        let candidate = random_media_room_id();
        match engine.create_room(candidate, description, pin).await {
            Ok(()) => return Ok(candidate),
            Err(MediaEngineError::AlreadyExisted) => last_err = MediaEngineError::AlreadyExisted,
            Err(other) => return Err(other),
        }
    }
    Err(last_err)
}

async fn create_room_transition(
    state: &ReconcilerState,
    active: &mut HashMap<String, ActiveRoom>,
    id: &str,
    room: &RoomEntity,
) -> Result<(), MediaEngineError> {
    let pin = room.meta.as_ref().map(|m| m.pin.as_str()).unwrap_or("");
    let media_room_id = create_media_room(&state.engine, id, pin).await?;
    active.insert(
        id.to_owned(),
        ActiveRoom { media_room_id, stream_id: None, endpoint: None },
    );
    write_binding(state, id, MediaNodeBinding { status: MediaNodeBindingStatus::RoomCreated, stream_id: None }).await;
    Ok(())
}

async fn destroy_room_transition(
    state: &ReconcilerState,
    active: &mut HashMap<String, ActiveRoom>,
    id: &str,
) -> Result<(), MediaEngineError> {
    if let Some(room) = active.remove(id) {
        state.engine.destroy_room(room.media_room_id).await?;
    }
    clear_binding(state, id).await;
    Ok(())
}

async fn create_forwarder_transition(
    state: &ReconcilerState,
    active: &mut HashMap<String, ActiveRoom>,
    id: &str,
    endpoint: MixerEndpoint,
) -> Result<(), MediaEngineError> {
    let media_room_id = active.get(id).map(|a| a.media_room_id).ok_or(MediaEngineError::NotFound)?;
    let stream_id = state.engine.create_rtp_forwarder(media_room_id, endpoint.ip, endpoint.port).await?;
    if let Some(room) = active.get_mut(id) {
        room.stream_id = Some(stream_id);
        room.endpoint = Some(endpoint);
    }
    write_binding(
        state,
        id,
        MediaNodeBinding { status: MediaNodeBindingStatus::Forwarding, stream_id: Some(stream_id) },
    )
    .await;
    Ok(())
}

async fn stop_forwarder_transition(
    state: &ReconcilerState,
    active: &mut HashMap<String, ActiveRoom>,
    id: &str,
) -> Result<(), MediaEngineError> {
    let Some(room) = active.get(id).cloned() else { return Ok(()) };
    if let Some(stream_id) = room.stream_id {
        state.engine.stop_rtp_forwarder(room.media_room_id, stream_id).await?;
    }
    if let Some(room) = active.get_mut(id) {
        room.stream_id = None;
        room.endpoint = None;
    }
    write_binding(state, id, MediaNodeBinding { status: MediaNodeBindingStatus::NotForwarding, stream_id: None }).await;
    Ok(())
}

async fn reconcile_one(state: &Arc<ReconcilerState>, id: &str, composite: Option<&RoomEntity>) -> Result<(), ChangeError> {
    let assigned_to_us = composite.is_some_and(|room| is_assigned_to_us(&state.self_id, room));
    let mut active = state.active.lock().await;
    let has_local_room = active.contains_key(id);

    if assigned_to_us && !has_local_room {
        let room = composite.expect("assigned_to_us implies a composite");
        create_room_transition(state, &mut active, id, room).await.map_err(|e| ChangeError(e.to_string()))?;
    } else if !assigned_to_us && has_local_room {
        destroy_room_transition(state, &mut active, id).await.map_err(|e| ChangeError(e.to_string()))?;
        return Ok(());
    } else if !assigned_to_us && !has_local_room {
        return Ok(());
    }

    let desired_endpoint = composite.and_then(mixer_endpoint);
    let should_forward = assigned_to_us && desired_endpoint.is_some();
    let has_forwarder = active.get(id).is_some_and(|a| a.stream_id.is_some());

    if should_forward && !has_forwarder {
        let endpoint = desired_endpoint.expect("should_forward implies Some");
        create_forwarder_transition(state, &mut active, id, endpoint)
            .await
            .map_err(|e| ChangeError(e.to_string()))?;
    } else if !should_forward && has_forwarder {
        stop_forwarder_transition(state, &mut active, id).await.map_err(|e| ChangeError(e.to_string()))?;
    } else if should_forward && has_forwarder {
        let current_endpoint = active.get(id).and_then(|a| a.endpoint);
        if current_endpoint != desired_endpoint {
            let endpoint = desired_endpoint.expect("should_forward implies Some");
            stop_forwarder_transition(state, &mut active, id).await.map_err(|e| ChangeError(e.to_string()))?;
            create_forwarder_transition(state, &mut active, id, endpoint)
                .await
                .map_err(|e| ChangeError(e.to_string()))?;
        }
    }
    Ok(())
}

struct RoomTransformer;

impl Transformer<RoomEntity> for RoomTransformer {
    fn new_state(
        &self,
        _id: &str,
        sub_key_type: &str,
        raw: Option<&[u8]>,
        current: Option<&RoomEntity>,
    ) -> Result<Option<RoomEntity>, TransformError> {
        merge_room_subkey(current, sub_key_type, raw)
    }
}

struct RoomChangeHandler {
    state: Arc<ReconcilerState>,
}

#[async_trait::async_trait]
impl ChangeHandler<RoomEntity> for RoomChangeHandler {
    async fn on_change(&self, id: &str, composite: Option<&RoomEntity>) -> Result<(), ChangeError> {
        reconcile_one(&self.state, id, composite).await
    }
}

/// C8: one instance runs per media node, co-located with its media engine.
pub struct MediaNodeReconciler {
    state: Arc<ReconcilerState>,
    watcher: PrefixedWatcher<RoomEntity>,
}

impl MediaNodeReconciler {
    #[must_use]
    pub fn new(
        self_id: impl Into<String>,
        canary_room_id: impl Into<String>,
        engine: Arc<dyn MediaEngineClient>,
        store: Arc<dyn KvStore>,
        rooms_prefix: impl Into<String>,
    ) -> Self {
        let rooms_prefix = rooms_prefix.into();
        let state = Arc::new(ReconcilerState {
            self_id: self_id.into(),
            canary_room_id: canary_room_id.into(),
            engine,
            store: Arc::clone(&store),
            rooms_prefix: rooms_prefix.clone(),
            active: AsyncMutex::new(HashMap::new()),
        });
        let change_handler = Arc::new(RoomChangeHandler { state: Arc::clone(&state) });
        Self {
            watcher: PrefixedWatcher::new(store, rooms_prefix, None, Arc::new(RoomTransformer), change_handler),
            state,
        }
    }

    pub async fn start(&self, external_cancel: CancellationToken) -> Result<(), StartError> {
        self.watcher.start(external_cancel).await
    }

    pub async fn stop(&self) {
        self.watcher.stop().await;
    }

    /// Invoked by an external canary-room monitor. Re-derives the active map
    /// directly from the media engine (skipping the canary room), stops any
    /// forwarder whose endpoint no longer matches the cached room state,
    /// then forces the watcher to re-snapshot and re-assert every room.
    pub async fn restart_detected(&self) {
        if let Err(err) = self.rebuild_active_from_engine().await {
            warn!(error = %err, "failed to rebuild active-rooms map from media engine");
        }
        self.watcher.restart().await;
    }

    async fn rebuild_active_from_engine(&self) -> Result<(), MediaEngineError> {
        let rooms = self.state.engine.list_rooms().await?;
        let mut fresh = HashMap::new();
        for room in rooms {
            if room.description == self.state.canary_room_id {
                continue;
            }
            let forwarders = self.state.engine.list_rtp_forwarders(room.media_room_id).await?;
            let forwarder = forwarders.first();
            fresh.insert(
                room.description.clone(),
                ActiveRoom {
                    media_room_id: room.media_room_id,
                    stream_id: forwarder.map(|f| f.stream_id),
                    endpoint: forwarder.map(|f| MixerEndpoint { ip: f.host, port: f.port }),
                },
            );
        }

        for (id, room) in self.watcher.cached_entries().await {
            let Some(active_room) = fresh.get(&id) else { continue };
            let cached_endpoint = mixer_endpoint(&room);
            if cached_endpoint != active_room.endpoint {
                if let Some(stream_id) = active_room.stream_id {
                    if let Err(err) = self.state.engine.stop_rtp_forwarder(active_room.media_room_id, stream_id).await {
                        warn!(room_id = %id, error = %err, "failed to stop stale forwarder during rebuild");
                    }
                }
                if let Some(entry) = fresh.get_mut(&id) {
                    entry.stream_id = None;
                    entry.endpoint = None;
                }
            }
        }

        *self.state.active.lock().await = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_proto::{MixerBinding, RoomMeta};
    use kv_watch::MemoryKvStore;
    use media_engine_client::FakeMediaEngine;
    use serde_json::json;
    use std::net::IpAddr;

    fn prefix() -> &'static str {
        "rooms/"
    }

    fn put_assigned_room(store: &MemoryKvStore, id: &str, node: &str, mixer_port: u16) {
        store.put(
            format!("rooms/{id}/meta"),
            serde_json::to_vec(&RoomMeta { pin: "1234".into(), max_anchors: 8, created_at: 0 }).unwrap(),
        );
        store.put(
            format!("rooms/{id}/live_meta"),
            serde_json::to_vec(&json!({
                "bound_media_node": node,
                "bound_mixer": "mixer-1",
                "status": "on_air",
                "nonce": "n1",
            }))
            .unwrap(),
        );
        if mixer_port != 0 {
            store.put(
                format!("rooms/{id}/mixer_binding"),
                serde_json::to_vec(&MixerBinding {
                    mixer: MixerEndpoint { ip: "127.0.0.1".parse::<IpAddr>().unwrap(), port: mixer_port },
                })
                .unwrap(),
            );
        }
    }

    #[tokio::test]
    async fn assigned_room_creates_media_room_and_binding() {
        let store = Arc::new(MemoryKvStore::new());
        put_assigned_room(&store, "r1", "node-1", 0);
        let engine = FakeMediaEngine::new();
        let reconciler = MediaNodeReconciler::new(
            "node-1",
            "canary",
            engine.clone() as Arc<dyn MediaEngineClient>,
            store.clone() as Arc<dyn KvStore>,
            prefix(),
        );
        reconciler.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let rooms = engine.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].description, "r1");

        let snap = store.get("rooms/r1/media_node_binding").await.unwrap();
        assert_eq!(snap.kvs.len(), 1);
        reconciler.stop().await;
    }

    #[tokio::test]
    async fn room_not_assigned_to_us_is_ignored() {
        let store = Arc::new(MemoryKvStore::new());
        put_assigned_room(&store, "r1", "node-2", 0);
        let engine = FakeMediaEngine::new();
        let reconciler = MediaNodeReconciler::new(
            "node-1",
            "canary",
            engine.clone() as Arc<dyn MediaEngineClient>,
            store as Arc<dyn KvStore>,
            prefix(),
        );
        reconciler.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(engine.list_rooms().await.unwrap().is_empty());
        reconciler.stop().await;
    }

    #[tokio::test]
    async fn assigned_room_with_mixer_creates_forwarder() {
        let store = Arc::new(MemoryKvStore::new());
        put_assigned_room(&store, "r1", "node-1", 5000);
        let engine = FakeMediaEngine::new();
        let reconciler = MediaNodeReconciler::new(
            "node-1",
            "canary",
            engine.clone() as Arc<dyn MediaEngineClient>,
            store.clone() as Arc<dyn KvStore>,
            prefix(),
        );
        reconciler.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let rooms = engine.list_rooms().await.unwrap();
        let forwarders = engine.list_rtp_forwarders(rooms[0].media_room_id).await.unwrap();
        assert_eq!(forwarders.len(), 1);
        assert_eq!(forwarders[0].port, 5000);
        reconciler.stop().await;
    }

    #[tokio::test]
    async fn removing_assignment_destroys_room() {
        let store = Arc::new(MemoryKvStore::new());
        put_assigned_room(&store, "r1", "node-1", 0);
        let engine = FakeMediaEngine::new();
        let reconciler = MediaNodeReconciler::new(
            "node-1",
            "canary",
            engine.clone() as Arc<dyn MediaEngineClient>,
            store.clone() as Arc<dyn KvStore>,
            prefix(),
        );
        reconciler.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(engine.list_rooms().await.unwrap().len(), 1);

        store.delete("rooms/r1/live_meta");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(engine.list_rooms().await.unwrap().is_empty());
        reconciler.stop().await;
    }

    #[tokio::test]
    async fn restart_detected_repairs_drifted_forwarder() {
        let store = Arc::new(MemoryKvStore::new());
        put_assigned_room(&store, "r1", "node-1", 6000);
        let engine = FakeMediaEngine::new();
        let reconciler = MediaNodeReconciler::new(
            "node-1",
            "canary",
            engine.clone() as Arc<dyn MediaEngineClient>,
            store.clone() as Arc<dyn KvStore>,
            prefix(),
        );
        reconciler.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let media_room_id = engine.list_rooms().await.unwrap()[0].media_room_id;
        let before = engine.list_rtp_forwarders(media_room_id).await.unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].port, 6000);

        // Simulate the media engine having restarted with a forwarder that no
        // longer matches what's bound in the KV store.
        engine.stop_rtp_forwarder(media_room_id, before[0].stream_id).await.unwrap();
        engine
            .create_rtp_forwarder(media_room_id, "127.0.0.1".parse().unwrap(), 9999)
            .await
            .unwrap();

        reconciler.restart_detected().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let after = engine.list_rtp_forwarders(media_room_id).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].port, 6000);
        reconciler.stop().await;
    }
}
