//! Read-only room directory: the session controller only needs to look up
//! `RoomEntity` by id (join's room-meta/live-meta checks, offer's room-meta
//! check), never to react to changes — so this wraps a
//! [`PrefixedWatcher`] with a [`NoopChangeHandler`], reusing the C7/C8
//! room-entity merge rule (`merge_room_subkey`) directly.

use std::sync::Arc;

use control_proto::RoomEntity;
use kv_watch::{merge_room_subkey, KvStore, NoopChangeHandler, PrefixedWatcher, StartError, TransformError, Transformer};
use tokio_util::sync::CancellationToken;

struct RoomEntityTransformer;

impl Transformer<RoomEntity> for RoomEntityTransformer {
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

pub struct RoomDirectory {
    watcher: PrefixedWatcher<RoomEntity>,
}

impl RoomDirectory {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            watcher: PrefixedWatcher::new(store, prefix, None, Arc::new(RoomEntityTransformer), Arc::new(NoopChangeHandler)),
        }
    }

    pub async fn start(&self, cancel: CancellationToken) -> Result<(), StartError> {
        self.watcher.start(cancel).await
    }

    pub async fn stop(&self) {
        self.watcher.stop().await;
    }

    pub async fn get(&self, room_id: &str) -> Option<RoomEntity> {
        self.watcher.get_cached_state(room_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_proto::{LiveMeta, RoomMeta, RoomStatus};
    use kv_watch::MemoryKvStore;
    use serde_json::json;

    #[tokio::test]
    async fn looks_up_room_by_id_after_start() {
        let store = Arc::new(MemoryKvStore::new());
        store.put(
            "rooms/R1/meta",
            serde_json::to_vec(&RoomMeta { pin: "1234".into(), max_anchors: 8, created_at: 0 }).unwrap(),
        );
        store.put(
            "rooms/R1/live_meta",
            serde_json::to_vec(&json!({
                "bound_media_node": "node-1",
                "bound_mixer": "mixer-1",
                "status": "on_air",
                "nonce": "n1",
            }))
            .unwrap(),
        );
        let directory = RoomDirectory::new(store, "rooms/");
        directory.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let room = directory.get("R1").await.unwrap();
        assert_eq!(room.meta.unwrap().pin, "1234");
        assert!(room.live_meta.unwrap().status == RoomStatus::OnAir);
        directory.stop().await;
    }

    #[tokio::test]
    async fn unknown_room_is_none() {
        let store = Arc::new(MemoryKvStore::new());
        let directory = RoomDirectory::new(store, "rooms/");
        directory.start(CancellationToken::new()).await.unwrap();
        assert!(directory.get("nope").await.is_none());
        directory.stop().await;
    }
}
