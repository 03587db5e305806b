//! Pick operation (§4.7.2): choose uniformly among healthy, pickable
//! modules that still have spare capacity.

use kv_watch::HealthyModuleWatcher;
use rand::seq::SliceRandom;

/// Returns the chosen module id, or `""` if no healthy module has capacity.
/// `current_streams` is the module's live stream count, typically
/// [`crate::room_stats::RoomStatsWatcher::janus_stream_count`] or
/// `mixer_stream_count`.
pub async fn pick(healthy: &HealthyModuleWatcher, current_streams: impl Fn(&str) -> i64) -> String {
    let mut candidates = Vec::new();
    for id in healthy.get_all_healthy() {
        let Some(module) = healthy.get(&id).await else {
            continue;
        };
        if !module.is_pickable() {
            continue;
        }
        let capacity = module.heartbeat.as_ref().map_or(0, |h| h.capacity);
        if capacity <= 0 || current_streams(&id) >= capacity {
            continue;
        }
        candidates.push(id);
    }
    candidates.choose(&mut rand::thread_rng()).cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_watch::{KvStore, MemoryKvStore};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn heartbeat(capacity: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({"host": "h", "capacity": capacity, "started_at": 0, "status": "healthy"})).unwrap()
    }

    fn mark() -> Vec<u8> {
        serde_json::to_vec(&json!({"label": "ready"})).unwrap()
    }

    #[tokio::test]
    async fn picks_the_only_candidate_with_capacity() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("modules/node-1/heartbeat", heartbeat(4));
        store.put("modules/node-1/mark", mark());
        store.put("modules/node-2/heartbeat", heartbeat(0));
        store.put("modules/node-2/mark", mark());
        let watcher = HealthyModuleWatcher::new(store as Arc<dyn KvStore>, "modules/");
        watcher.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let chosen = pick(&watcher, |_| 0).await;
        assert_eq!(chosen, "node-1");
        watcher.stop().await;
    }

    #[tokio::test]
    async fn skips_module_already_at_capacity() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("modules/node-1/heartbeat", heartbeat(2));
        store.put("modules/node-1/mark", mark());
        let watcher = HealthyModuleWatcher::new(store as Arc<dyn KvStore>, "modules/");
        watcher.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let chosen = pick(&watcher, |_| 2).await;
        assert_eq!(chosen, "");
        watcher.stop().await;
    }

    #[tokio::test]
    async fn empty_healthy_set_returns_empty_string() {
        let store = Arc::new(MemoryKvStore::new());
        let watcher = HealthyModuleWatcher::new(store as Arc<dyn KvStore>, "modules/");
        watcher.start(CancellationToken::new()).await.unwrap();
        let chosen = pick(&watcher, |_| 0).await;
        assert_eq!(chosen, "");
        watcher.stop().await;
    }
}
