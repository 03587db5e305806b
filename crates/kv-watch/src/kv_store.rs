//! The KV store external interface (spec §6.1) and an in-memory test double.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Mutex;

use futures_util::stream::Stream;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// A single key/value pair as read from the store. An empty `value` is only
/// ever produced by a [`WatchEvent::Delete`]; `Get` never returns tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kv {
    pub key: String,
    pub value: Vec<u8>,
}

/// Result of a linearizable prefix read.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub revision: i64,
    pub kvs: Vec<Kv>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(Kv),
    Delete(Kv),
}

#[derive(Debug, Clone)]
pub struct WatchBatch {
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

#[derive(Debug, Error, Clone)]
pub enum KvError {
    #[error("watch channel closed or compacted")]
    WatchAborted,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchBatch, KvError>> + Send>>;

/// Linearizable-read + revisioned-watch KV store (spec §6.1), plus the
/// write path other components use to publish sub-key state (room bindings,
/// housekeeping deletes) into the same store.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, prefix: &str) -> Result<Snapshot, KvError>;

    fn watch(&self, prefix: &str, from_revision: i64) -> WatchStream;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// Parsed form of a composite key `{prefix}{entity_id}/{sub_key_type}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub entity_id: String,
    pub sub_key_type: String,
}

/// Parse `key` as `{prefix}{entity_id}/{sub_key_type}`.
///
/// An empty `entity_id` is legal. A suffix containing more than one `/` is
/// rejected, as is a key that does not start with `prefix` or has no `/` at
/// all.
#[must_use]
pub fn parse_key(prefix: &str, key: &str) -> Option<ParsedKey> {
    let suffix = key.strip_prefix(prefix)?;
    let mut parts = suffix.splitn(3, '/');
    let entity_id = parts.next()?;
    let sub_key_type = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some(ParsedKey {
        entity_id: entity_id.to_owned(),
        sub_key_type: sub_key_type.to_owned(),
    })
}

struct MemoryState {
    kvs: BTreeMap<String, Vec<u8>>,
    revision: i64,
}

/// In-memory [`KvStore`] test double. `put`/`delete` bump the revision and
/// broadcast a one-event batch to every open watch stream.
pub struct MemoryKvStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<WatchBatch>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            state: Mutex::new(MemoryState {
                kvs: BTreeMap::new(),
                revision: 0,
            }),
            events,
        }
    }

    pub fn put(&self, key: impl Into<String>, value: Vec<u8>) -> i64 {
        let key = key.into();
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        state.revision += 1;
        let revision = state.revision;
        state.kvs.insert(key.clone(), value.clone());
        let batch = WatchBatch {
            revision,
            events: vec![WatchEvent::Put(Kv { key, value })],
        };
        let _ = self.events.send(batch);
        revision
    }

    pub fn delete(&self, key: impl Into<String>) -> i64 {
        let key = key.into();
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        state.revision += 1;
        let revision = state.revision;
        state.kvs.remove(&key);
        let batch = WatchBatch {
            revision,
            events: vec![WatchEvent::Delete(Kv {
                key,
                value: Vec::new(),
            })],
        };
        let _ = self.events.send(batch);
        revision
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, prefix: &str) -> Result<Snapshot, KvError> {
        let state = self.state.lock().expect("memory store mutex poisoned");
        let kvs = state
            .kvs
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(key, value)| Kv {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        Ok(Snapshot {
            revision: state.revision,
            kvs,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        MemoryKvStore::put(self, key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        MemoryKvStore::delete(self, key.to_owned());
        Ok(())
    }

    fn watch(&self, prefix: &str, from_revision: i64) -> WatchStream {
        let prefix = prefix.to_owned();
        let rx = self.events.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(batch) if batch.revision >= from_revision => {
                let events: Vec<_> = batch
                    .events
                    .into_iter()
                    .filter(|e| match e {
                        WatchEvent::Put(kv) | WatchEvent::Delete(kv) => kv.key.starts_with(&prefix),
                    })
                    .collect();
                if events.is_empty() {
                    None
                } else {
                    Some(Ok(WatchBatch {
                        revision: batch.revision,
                        events,
                    }))
                }
            }
            Ok(_) => None,
            Err(_lagged) => Some(Err(KvError::WatchAborted)),
        });
        Box::pin(stream)
    }
}
