//! The composite-entity contract (C4) and the per-entity callback traits
//! that drive a [`crate::watcher::PrefixedWatcher`] (C2).

use crate::errors::{ChangeError, TransformError};

/// Pure data with merge rules: a setter per sub-key type, an `is_empty`
/// predicate, null-safe accessors. Implementations never touch the KV store
/// or any other I/O; the watcher serializes all mutation.
pub trait CompositeEntity: Default + Clone + Send + Sync + 'static {
    fn is_empty(&self) -> bool;
}

impl CompositeEntity for control_proto::ModuleEntity {
    fn is_empty(&self) -> bool {
        control_proto::ModuleEntity::is_empty(self)
    }
}

impl CompositeEntity for control_proto::RoomEntity {
    fn is_empty(&self) -> bool {
        control_proto::RoomEntity::is_empty(self)
    }
}

/// Defines entity semantics for one composite type: how a raw sub-key event
/// folds into the current composite, and how to project the cache into
/// consumer-owned derived state on rebuild.
pub trait Transformer<E: CompositeEntity>: Send + Sync {
    /// Deterministic, side-effect-free: produce the merged composite after
    /// applying one sub-key event. `raw` is `None` for a delete. Returning
    /// `Ok(None)` means the entity is now empty and must be evicted.
    fn new_state(
        &self,
        id: &str,
        sub_key_type: &str,
        raw: Option<&[u8]>,
        current: Option<&E>,
    ) -> Result<Option<E>, TransformError>;

    fn rebuild_start(&self) {}

    fn rebuild_state(&self, _id: &str, _composite: &E) -> Result<(), TransformError> {
        Ok(())
    }

    fn rebuild_end(&self) {}
}

/// Consumer-supplied per-entity change callback (spec §4.2 "change
/// callback"). Failure triggers the retry-with-backoff policy in §4.2.2.
#[async_trait::async_trait]
pub trait ChangeHandler<E: CompositeEntity>: Send + Sync {
    async fn on_change(&self, id: &str, composite: Option<&E>) -> Result<(), ChangeError>;
}

/// A [`ChangeHandler`] that ignores every change; useful where only the
/// cache and derived-state rebuild matter (e.g. C3's healthy set, which
/// maintains itself from the rebuild hook and needs no per-change action).
pub struct NoopChangeHandler;

#[async_trait::async_trait]
impl<E: CompositeEntity> ChangeHandler<E> for NoopChangeHandler {
    async fn on_change(&self, _id: &str, _composite: Option<&E>) -> Result<(), ChangeError> {
        Ok(())
    }
}
