//! Healthy-module watcher (C3): a specialization of [`PrefixedWatcher`] over
//! `{heartbeat, mark}` sub-keys that additionally maintains a derived
//! "healthy set".

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use control_proto::ModuleEntity;
use tokio_util::sync::CancellationToken;

use crate::entity::{ChangeHandler, Transformer};
use crate::errors::{ChangeError, StartError, TransformError};
use crate::kv_store::KvStore;
use crate::watcher::PrefixedWatcher;

pub(crate) fn parse_optional<T: serde::de::DeserializeOwned>(
    raw: Option<&[u8]>,
) -> Result<Option<T>, TransformError> {
    match raw {
        Some(bytes) => serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|e| TransformError(e.to_string())),
        None => Ok(None),
    }
}

struct HealthyTransformer {
    healthy: Arc<RwLock<HashSet<String>>>,
}

impl Transformer<ModuleEntity> for HealthyTransformer {
    fn new_state(
        &self,
        _id: &str,
        sub_key_type: &str,
        raw: Option<&[u8]>,
        current: Option<&ModuleEntity>,
    ) -> Result<Option<ModuleEntity>, TransformError> {
        let mut next = current.cloned().unwrap_or_default();
        match sub_key_type {
            "heartbeat" => next.heartbeat = parse_optional(raw)?,
            "mark" => next.mark = parse_optional(raw)?,
            other => {
                tracing::debug!(sub_key_type = other, "ignoring unexpected sub-key type");
            }
        }
        Ok(Some(next))
    }

    fn rebuild_start(&self) {
        self.healthy.write().expect("healthy set poisoned").clear();
    }

    fn rebuild_state(&self, id: &str, composite: &ModuleEntity) -> Result<(), TransformError> {
        if composite.is_healthy() {
            self.healthy
                .write()
                .expect("healthy set poisoned")
                .insert(id.to_owned());
        }
        Ok(())
    }
}

struct HealthyChangeHandler {
    healthy: Arc<RwLock<HashSet<String>>>,
}

#[async_trait::async_trait]
impl ChangeHandler<ModuleEntity> for HealthyChangeHandler {
    async fn on_change(
        &self,
        id: &str,
        composite: Option<&ModuleEntity>,
    ) -> Result<(), ChangeError> {
        let mut healthy = self.healthy.write().expect("healthy set poisoned");
        match composite {
            Some(c) if c.is_healthy() => {
                healthy.insert(id.to_owned());
            }
            _ => {
                healthy.remove(id);
            }
        }
        Ok(())
    }
}

/// C3: watches `{heartbeat, mark}` sub-keys under a module prefix (media
/// nodes or mixers) and exposes the derived healthy set alongside the
/// underlying composite cache.
pub struct HealthyModuleWatcher {
    watcher: PrefixedWatcher<ModuleEntity>,
    healthy: Arc<RwLock<HashSet<String>>>,
}

impl HealthyModuleWatcher {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        let healthy = Arc::new(RwLock::new(HashSet::new()));
        let allowed = Some(["heartbeat".to_owned(), "mark".to_owned()].into_iter().collect());
        let transformer = Arc::new(HealthyTransformer {
            healthy: Arc::clone(&healthy),
        });
        let change_handler = Arc::new(HealthyChangeHandler {
            healthy: Arc::clone(&healthy),
        });
        Self {
            watcher: PrefixedWatcher::new(store, prefix, allowed, transformer, change_handler),
            healthy,
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

    pub async fn get(&self, id: &str) -> Option<ModuleEntity> {
        self.watcher.get_cached_state(id).await
    }

    #[must_use]
    pub fn has(&self, id: &str) -> bool {
        self.healthy.read().expect("healthy set poisoned").contains(id)
    }

    #[must_use]
    pub fn get_all_healthy(&self) -> Vec<String> {
        self.healthy
            .read()
            .expect("healthy set poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
