//! Reactive state-convergence fabric: the prefixed KV watcher (C2), its
//! healthy-module specialization (C3), and the composite-entity contract
//! (C4) that both build on.
//!
//! Mirrors the teacher's layering — a generic cache-maintenance loop with
//! pluggable merge and change hooks — adapted from the single-purpose
//! forwarder journal pattern into a reusable watcher over an abstract
//! `KvStore`.

pub mod entity;
pub mod errors;
pub mod healthy;
pub mod kv_store;
pub mod room;
pub mod watcher;

pub use entity::{ChangeHandler, CompositeEntity, NoopChangeHandler, Transformer};
pub use errors::{ChangeError, CycleError, StartError, TransformError};
pub use healthy::HealthyModuleWatcher;
pub use kv_store::{parse_key, Kv, KvError, KvStore, MemoryKvStore, ParsedKey, Snapshot, WatchBatch, WatchEvent};
pub use room::merge_room_subkey;
pub use watcher::PrefixedWatcher;
