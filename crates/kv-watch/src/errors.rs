use thiserror::Error;

use crate::kv_store::KvError;

/// Failure from a state-transformer's `new_state`/`rebuild_*` hooks.
#[derive(Debug, Error, Clone)]
#[error("transform failed: {0}")]
pub struct TransformError(pub String);

/// Failure from a per-entity change callback; triggers retry per §4.2.2.
#[derive(Debug, Error, Clone)]
#[error("change callback failed: {0}")]
pub struct ChangeError(pub String);

/// A watch/snapshot cycle aborted and must be retried from the outer loop.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("kv store error: {0}")]
    Store(#[from] KvError),
    #[error("transform hook failed: {0}")]
    Transform(#[from] TransformError),
    #[error("watch stream ended")]
    StreamEnded,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("already started")]
    AlreadyStarted,
    #[error("context cancelled before initial snapshot loaded")]
    Cancelled,
}
