//! Room-stats-augmented watcher (§4.7): a [`PrefixedWatcher`] over room
//! sub-keys that additionally tracks `janus_usage`/`mixer_usage` — how many
//! on-air rooms are currently bound to each media node and mixer.

use std::sync::{Arc, RwLock};

use control_proto::{RoomEntity, RoomStatus};
use kv_watch::{
    merge_room_subkey, ChangeError, ChangeHandler, KvStore, PrefixedWatcher, StartError, TransformError, Transformer,
};
use tokio_util::sync::CancellationToken;

use crate::module_usage::ModuleUsage;

struct RoomStatsTransformer {
    janus: Arc<RwLock<ModuleUsage>>,
    mixer: Arc<RwLock<ModuleUsage>>,
}

impl Transformer<RoomEntity> for RoomStatsTransformer {
    fn new_state(
        &self,
        _id: &str,
        sub_key_type: &str,
        raw: Option<&[u8]>,
        current: Option<&RoomEntity>,
    ) -> Result<Option<RoomEntity>, TransformError> {
        merge_room_subkey(current, sub_key_type, raw)
    }

    fn rebuild_start(&self) {
        self.janus.write().expect("janus usage lock poisoned").clear();
        self.mixer.write().expect("mixer usage lock poisoned").clear();
    }

    fn rebuild_state(&self, id: &str, composite: &RoomEntity) -> Result<(), TransformError> {
        apply_live_meta(&self.janus, &self.mixer, id, composite);
        Ok(())
    }
}

struct RoomStatsChangeHandler {
    janus: Arc<RwLock<ModuleUsage>>,
    mixer: Arc<RwLock<ModuleUsage>>,
}

#[async_trait::async_trait]
impl ChangeHandler<RoomEntity> for RoomStatsChangeHandler {
    async fn on_change(&self, id: &str, composite: Option<&RoomEntity>) -> Result<(), ChangeError> {
        match composite {
            Some(entity) => apply_live_meta(&self.janus, &self.mixer, id, entity),
            None => {
                self.janus.write().expect("janus usage lock poisoned").set(id, "");
                self.mixer.write().expect("mixer usage lock poisoned").set(id, "");
            }
        }
        Ok(())
    }
}

fn apply_live_meta(janus: &Arc<RwLock<ModuleUsage>>, mixer: &Arc<RwLock<ModuleUsage>>, id: &str, entity: &RoomEntity) {
    let (node, mix) = match entity.live_meta.as_ref() {
        Some(lm) if lm.status == RoomStatus::OnAir => (lm.bound_media_node.as_str(), lm.bound_mixer.as_str()),
        _ => ("", ""),
    };
    janus.write().expect("janus usage lock poisoned").set(id, node);
    mixer.write().expect("mixer usage lock poisoned").set(id, mix);
}

/// C7's room-prefix watcher, augmented with the `janus_usage`/`mixer_usage`
/// counters the pick operation and housekeeping read from.
pub struct RoomStatsWatcher {
    watcher: PrefixedWatcher<RoomEntity>,
    janus: Arc<RwLock<ModuleUsage>>,
    mixer: Arc<RwLock<ModuleUsage>>,
}

impl RoomStatsWatcher {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        let janus = Arc::new(RwLock::new(ModuleUsage::new()));
        let mixer = Arc::new(RwLock::new(ModuleUsage::new()));
        let transformer = Arc::new(RoomStatsTransformer {
            janus: Arc::clone(&janus),
            mixer: Arc::clone(&mixer),
        });
        let change_handler = Arc::new(RoomStatsChangeHandler {
            janus: Arc::clone(&janus),
            mixer: Arc::clone(&mixer),
        });
        Self {
            watcher: PrefixedWatcher::new(store, prefix, None, transformer, change_handler),
            janus,
            mixer,
        }
    }

    pub async fn start(&self, external_cancel: CancellationToken) -> Result<(), StartError> {
        self.watcher.start(external_cancel).await
    }

    pub async fn stop(&self) {
        self.watcher.stop().await;
    }

    pub async fn restart(&self) {
        self.watcher.restart().await;
    }

    pub async fn get(&self, room_id: &str) -> Option<RoomEntity> {
        self.watcher.get_cached_state(room_id).await
    }

    pub async fn cached_entries(&self) -> Vec<(String, RoomEntity)> {
        self.watcher.cached_entries().await
    }

    #[must_use]
    pub fn janus_stream_count(&self, id: &str) -> i64 {
        self.janus.read().expect("janus usage lock poisoned").count(id)
    }

    #[must_use]
    pub fn mixer_stream_count(&self, id: &str) -> i64 {
        self.mixer.read().expect("mixer usage lock poisoned").count(id)
    }
}
