//! Housekeeping loop (§4.7.3): every 30s, sweeps stale rooms and flags
//! rooms whose bound media node or mixer has gone unstable.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use control_proto::RoomStatus;
use kv_watch::{HealthyModuleWatcher, KvStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::room_stats::RoomStatsWatcher;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const FAILED_TO_START_AGE: Duration = Duration::from_secs(10 * 60);
const MAX_AGE: Duration = Duration::from_secs(3 * 60 * 60);
const DISCARD_GRACE: Duration = Duration::from_secs(60);

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

struct Handle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs [`check_stale_rooms`] and [`check_room_modules`] on a 30s tick.
/// Per-room failures are logged, never abort the loop.
pub struct Housekeeping {
    store: Arc<dyn KvStore>,
    rooms_prefix: String,
    room_stats: Arc<RoomStatsWatcher>,
    media_nodes: Arc<HealthyModuleWatcher>,
    mixers: Arc<HealthyModuleWatcher>,
    interval: Duration,
    handle: tokio::sync::Mutex<Option<Handle>>,
}

impl Housekeeping {
    #[must_use]
    pub fn new(
        store: Arc<dyn KvStore>,
        rooms_prefix: impl Into<String>,
        room_stats: Arc<RoomStatsWatcher>,
        media_nodes: Arc<HealthyModuleWatcher>,
        mixers: Arc<HealthyModuleWatcher>,
    ) -> Self {
        Self {
            store,
            rooms_prefix: rooms_prefix.into(),
            room_stats,
            media_nodes,
            mixers,
            interval: DEFAULT_INTERVAL,
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.check_stale_rooms().await;
                        this.check_room_modules().await;
                    }
                }
            }
        });
        *guard = Some(Handle { cancel, task });
    }

    pub async fn stop(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }

    async fn check_stale_rooms(&self) {
        let now = now_unix();
        for (room_id, room) in self.room_stats.cached_entries().await {
            let stale_reason = match &room.meta {
                None => Some("malformed"),
                Some(meta) => {
                    let age = now.saturating_sub(meta.created_at);
                    match &room.live_meta {
                        None if age > FAILED_TO_START_AGE.as_secs() as i64 => Some("failed_to_start"),
                        Some(lm) if lm.status == RoomStatus::OnAir && age > MAX_AGE.as_secs() as i64 => Some("max_age"),
                        Some(lm) => match lm.discard_at {
                            Some(discard_at) if now.saturating_sub(discard_at) > DISCARD_GRACE.as_secs() as i64 => {
                                Some("grace_expired")
                            }
                            _ => None,
                        },
                        None => None,
                    }
                }
            };
            if let Some(reason) = stale_reason {
                warn!(room_id = %room_id, reason, "deleting stale room");
                if let Err(err) = self.delete_room(&room_id).await {
                    warn!(room_id = %room_id, error = %err, "failed to delete stale room");
                }
            }
        }
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), kv_watch::KvError> {
        for sub_key in ["meta", "live_meta", "media_node_binding", "mixer_binding"] {
            let key = format!("{}{room_id}/{sub_key}", self.rooms_prefix);
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    async fn check_room_modules(&self) {
        for (room_id, room) in self.room_stats.cached_entries().await {
            let Some(live_meta) = room.live_meta.as_ref().filter(|lm| lm.status == RoomStatus::OnAir) else {
                continue;
            };
            let node_stable = self
                .media_nodes
                .get(&live_meta.bound_media_node)
                .await
                .is_some_and(|m| m.is_stable());
            let mixer_stable = self.mixers.get(&live_meta.bound_mixer).await.is_some_and(|m| m.is_stable());
            if !node_stable {
                warn!(room_id = %room_id, node = %live_meta.bound_media_node, "bound media node no longer stable");
            }
            if !mixer_stable {
                warn!(room_id = %room_id, mixer = %live_meta.bound_mixer, "bound mixer no longer stable");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_proto::RoomMeta;
    use kv_watch::MemoryKvStore;
    use serde_json::json;

    fn meta(created_at: i64) -> Vec<u8> {
        serde_json::to_vec(&RoomMeta { pin: "1".into(), max_anchors: 4, created_at }).unwrap()
    }

    fn on_air_live_meta() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "bound_media_node": "node-1",
            "bound_mixer": "mixer-1",
            "status": "on_air",
            "nonce": "n1",
        }))
        .unwrap()
    }

    async fn setup(store: Arc<MemoryKvStore>) -> (Arc<RoomStatsWatcher>, Arc<HealthyModuleWatcher>, Arc<HealthyModuleWatcher>) {
        let room_stats = Arc::new(RoomStatsWatcher::new(store.clone() as Arc<dyn KvStore>, "rooms/"));
        room_stats.start(CancellationToken::new()).await.unwrap();
        let media_nodes = Arc::new(HealthyModuleWatcher::new(store.clone() as Arc<dyn KvStore>, "media_nodes/"));
        media_nodes.start(CancellationToken::new()).await.unwrap();
        let mixers = Arc::new(HealthyModuleWatcher::new(store as Arc<dyn KvStore>, "mixers/"));
        mixers.start(CancellationToken::new()).await.unwrap();
        (room_stats, media_nodes, mixers)
    }

    #[tokio::test]
    async fn deletes_room_missing_live_meta_past_failed_to_start_age() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("rooms/r1/meta", meta(0));
        let (room_stats, media_nodes, mixers) = setup(Arc::clone(&store)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let housekeeping = Arc::new(Housekeeping::new(
            store.clone() as Arc<dyn KvStore>,
            "rooms/",
            room_stats,
            media_nodes,
            mixers,
        ));
        housekeeping.check_stale_rooms().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snap = store.get("rooms/r1/").await.unwrap();
        assert!(snap.kvs.is_empty());
    }

    #[tokio::test]
    async fn leaves_fresh_room_without_live_meta_untouched() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("rooms/r1/meta", meta(now_unix()));
        let (room_stats, media_nodes, mixers) = setup(Arc::clone(&store)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let housekeeping = Arc::new(Housekeeping::new(
            store.clone() as Arc<dyn KvStore>,
            "rooms/",
            room_stats,
            media_nodes,
            mixers,
        ));
        housekeeping.check_stale_rooms().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snap = store.get("rooms/r1/").await.unwrap();
        assert_eq!(snap.kvs.len(), 1);
    }

    #[tokio::test]
    async fn deletes_room_past_max_age_while_on_air() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("rooms/r1/meta", meta(0));
        store.put("rooms/r1/live_meta", on_air_live_meta());
        let (room_stats, media_nodes, mixers) = setup(Arc::clone(&store)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let housekeeping = Arc::new(Housekeeping::new(
            store.clone() as Arc<dyn KvStore>,
            "rooms/",
            room_stats,
            media_nodes,
            mixers,
        ));
        housekeeping.check_stale_rooms().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snap = store.get("rooms/r1/").await.unwrap();
        assert!(snap.kvs.is_empty());
    }
}
