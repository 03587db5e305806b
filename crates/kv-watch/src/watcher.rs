//! Prefixed watcher (C2): get-and-watch cache maintenance over a [`KvStore`]
//! prefix, serialized through a [`KeyedScheduler`] sink so that at most one
//! change-callback invocation per entity id is ever in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use keyed_scheduler::{next_retry_delay, KeyedScheduler};
use tokio::sync::{oneshot, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::entity::{ChangeHandler, CompositeEntity, Transformer};
use crate::errors::{CycleError, StartError};
use crate::kv_store::{parse_key, KvStore, WatchEvent};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

struct RunHandle {
    cancel: CancellationToken,
    cycle_cancel: Arc<std::sync::Mutex<CancellationToken>>,
    task: JoinHandle<()>,
}

struct Inner<E: CompositeEntity> {
    store: Arc<dyn KvStore>,
    prefix: String,
    allowed_sub_keys: Option<HashSet<String>>,
    transformer: Arc<dyn Transformer<E>>,
    change_handler: Arc<dyn ChangeHandler<E>>,
    cache: RwLock<HashMap<String, E>>,
    retry_delay: Duration,
}

/// Construction inputs and runtime handle for C2's get-and-watch loop.
///
/// `Start`/`Stop`/`Restart` are safe to call from any task; `Start` is the
/// only one that awaits, and only until the first snapshot+rebuild cycle
/// completes (or the passed-in token is cancelled first).
pub struct PrefixedWatcher<E: CompositeEntity> {
    inner: Arc<Inner<E>>,
    handle: AsyncMutex<Option<RunHandle>>,
}

impl<E: CompositeEntity> PrefixedWatcher<E> {
    pub fn new(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        allowed_sub_keys: Option<HashSet<String>>,
        transformer: Arc<dyn Transformer<E>>,
        change_handler: Arc<dyn ChangeHandler<E>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                prefix: prefix.into(),
                allowed_sub_keys,
                transformer,
                change_handler,
                cache: RwLock::new(HashMap::new()),
                retry_delay: DEFAULT_RETRY_DELAY,
            }),
            handle: AsyncMutex::new(None),
        }
    }

    /// Blocks until the initial snapshot is loaded, or `external_cancel` is
    /// triggered first. On success, background processing is running.
    pub async fn start(&self, external_cancel: CancellationToken) -> Result<(), StartError> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return Err(StartError::AlreadyStarted);
        }

        let cancel = CancellationToken::new();
        let cycle_cancel = Arc::new(std::sync::Mutex::new(CancellationToken::new()));
        let (ready_tx, ready_rx) = oneshot::channel();

        let inner = Arc::clone(&self.inner);
        let task_cancel = cancel.clone();
        let task_cycle_cancel = Arc::clone(&cycle_cancel);
        let task = tokio::spawn(async move {
            run_outer_loop(inner, task_cancel, task_cycle_cancel, ready_tx).await;
        });

        *guard = Some(RunHandle {
            cancel,
            cycle_cancel,
            task,
        });
        drop(guard);

        tokio::select! {
            result = ready_rx => {
                result.map_err(|_| StartError::Cancelled)
            }
            () = external_cancel.cancelled() => Err(StartError::Cancelled),
        }
    }

    /// Blocks until background processing exits. Idempotent.
    pub async fn stop(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }

    /// Non-blocking: triggers a full re-snapshot-then-watch cycle at the
    /// next opportunity without losing the sink identity.
    pub async fn restart(&self) {
        if let Some(handle) = self.handle.lock().await.as_ref() {
            handle.cycle_cancel.lock().expect("cycle cancel poisoned").cancel();
        }
    }

    pub async fn get_cached_state(&self, id: &str) -> Option<E> {
        self.inner.cache.read().await.get(id).cloned()
    }

    /// Snapshot of every entity id currently held in the cache, for callers
    /// that need to iterate "all known rooms" (housekeeping sweeps).
    pub async fn cached_ids(&self) -> Vec<String> {
        self.inner.cache.read().await.keys().cloned().collect()
    }

    /// Snapshot of the full cache as `(id, entity)` pairs.
    pub async fn cached_entries(&self) -> Vec<(String, E)> {
        self.inner
            .cache
            .read()
            .await
            .iter()
            .map(|(id, entity)| (id.clone(), entity.clone()))
            .collect()
    }
}

async fn run_outer_loop<E: CompositeEntity>(
    inner: Arc<Inner<E>>,
    cancel: CancellationToken,
    cycle_cancel_slot: Arc<std::sync::Mutex<CancellationToken>>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let cycle_cancel = CancellationToken::new();
        *cycle_cancel_slot.lock().expect("cycle cancel poisoned") = cycle_cancel.clone();

        match run_cycle(&inner, &cancel, &cycle_cancel, &mut ready_tx).await {
            Ok(()) => {}
            Err(err) => {
                warn!(error = %err, prefix = %inner.prefix, "watch cycle aborted, retrying");
                tokio::select! {
                    () = tokio::time::sleep(inner.retry_delay) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
    }
}

async fn run_cycle<E: CompositeEntity>(
    inner: &Arc<Inner<E>>,
    cancel: &CancellationToken,
    cycle_cancel: &CancellationToken,
    ready_tx: &mut Option<oneshot::Sender<()>>,
) -> Result<(), CycleError> {
    let mut retry_counts: HashMap<String, u32> = HashMap::new();
    let mut scheduler: KeyedScheduler<String> = KeyedScheduler::new();

    let snapshot = inner.store.get(&inner.prefix).await?;
    let mut touched = HashSet::new();
    {
        let mut cache = inner.cache.write().await;
        // Rebuilt from scratch every cycle: a sub-key deleted from the store
        // while this watcher was disconnected/retrying must not survive by
        // merging onto the old cache contents.
        let mut fresh: HashMap<String, E> = HashMap::new();
        for kv in snapshot.kvs {
            let Some(parsed) = parse_key(&inner.prefix, &kv.key) else {
                continue;
            };
            if let Some(allowed) = &inner.allowed_sub_keys {
                if !allowed.contains(&parsed.sub_key_type) {
                    continue;
                }
            }
            let raw = if kv.value.is_empty() { None } else { Some(kv.value.as_slice()) };
            apply_subkey(inner, &mut fresh, &parsed.entity_id, &parsed.sub_key_type, raw)?;
            touched.insert(parsed.entity_id);
        }
        touched.extend(cache.keys().filter(|id| !fresh.contains_key(*id)).cloned());
        *cache = fresh;
    }

    run_rebuild_hook(inner).await?;

    if let Some(tx) = ready_tx.take() {
        info!(prefix = %inner.prefix, "initial snapshot ready");
        let _ = tx.send(());
    }

    for id in touched {
        scheduler.enqueue(id, Duration::ZERO);
    }

    let mut watch_stream = inner.store.watch(&inner.prefix, snapshot.revision + 1);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => return Ok(()),
            () = cycle_cancel.cancelled() => return Ok(()),

            batch = watch_stream.next() => {
                let batch = batch.ok_or(CycleError::StreamEnded)??;
                let mut cache = inner.cache.write().await;
                for event in batch.events {
                    let (kv, raw) = match event {
                        WatchEvent::Put(kv) => {
                            let raw = kv.value.clone();
                            (kv, Some(raw))
                        }
                        WatchEvent::Delete(kv) => (kv, None),
                    };
                    let Some(parsed) = parse_key(&inner.prefix, &kv.key) else {
                        continue;
                    };
                    if let Some(allowed) = &inner.allowed_sub_keys {
                        if !allowed.contains(&parsed.sub_key_type) {
                            continue;
                        }
                    }
                    apply_subkey(
                        inner,
                        &mut cache,
                        &parsed.entity_id,
                        &parsed.sub_key_type,
                        raw.as_deref(),
                    )?;
                    retry_counts.remove(&parsed.entity_id);
                    scheduler.enqueue(parsed.entity_id, Duration::ZERO);
                }
            }

            delivered = scheduler.recv() => {
                let Some(id) = delivered else { return Ok(()) };
                let composite = inner.cache.read().await.get(&id).cloned();
                match inner.change_handler.on_change(&id, composite.as_ref()).await {
                    Ok(()) => {
                        retry_counts.remove(&id);
                    }
                    Err(err) => {
                        let count = retry_counts.entry(id.clone()).or_insert(0);
                        warn!(id = %id, error = %err, retry = *count, "change callback failed, retrying");
                        let delay = next_retry_delay(*count);
                        *count += 1;
                        scheduler.enqueue(id, delay);
                    }
                }
            }
        }
    }
}

fn apply_subkey<E: CompositeEntity>(
    inner: &Arc<Inner<E>>,
    cache: &mut HashMap<String, E>,
    id: &str,
    sub_key_type: &str,
    raw: Option<&[u8]>,
) -> Result<(), CycleError> {
    let current = cache.get(id);
    let next = inner.transformer.new_state(id, sub_key_type, raw, current)?;
    match next {
        Some(composite) if !composite.is_empty() => {
            cache.insert(id.to_owned(), composite);
        }
        _ => {
            cache.remove(id);
        }
    }
    Ok(())
}

async fn run_rebuild_hook<E: CompositeEntity>(inner: &Arc<Inner<E>>) -> Result<(), CycleError> {
    inner.transformer.rebuild_start();
    let cache = inner.cache.read().await;
    for (id, composite) in cache.iter() {
        inner.transformer.rebuild_state(id, composite)?;
    }
    drop(cache);
    inner.transformer.rebuild_end();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ChangeError, TransformError};
    use crate::kv_store::MemoryKvStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default, Debug, PartialEq)]
    struct Counter(i64);

    impl CompositeEntity for Counter {
        fn is_empty(&self) -> bool {
            self.0 == 0
        }
    }

    struct CounterTransformer;

    impl Transformer<Counter> for CounterTransformer {
        fn new_state(
            &self,
            _id: &str,
            _sub_key_type: &str,
            raw: Option<&[u8]>,
            _current: Option<&Counter>,
        ) -> Result<Option<Counter>, TransformError> {
            match raw {
                Some(bytes) => {
                    let value: i64 = std::str::from_utf8(bytes)
                        .map_err(|e| TransformError(e.to_string()))?
                        .parse()
                        .map_err(|e: std::num::ParseIntError| TransformError(e.to_string()))?;
                    Ok(Some(Counter(value)))
                }
                None => Ok(None),
            }
        }
    }

    struct RecordingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ChangeHandler<Counter> for RecordingHandler {
        async fn on_change(&self, _id: &str, _composite: Option<&Counter>) -> Result<(), ChangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn loads_initial_snapshot_and_reflects_puts() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("c/room-1/mark", b"5".to_vec());
        let calls = Arc::new(AtomicUsize::new(0));
        let watcher = PrefixedWatcher::new(
            store,
            "c/",
            None,
            Arc::new(CounterTransformer),
            Arc::new(RecordingHandler { calls: Arc::clone(&calls) }),
        );
        watcher.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(watcher.get_cached_state("room-1").await, Some(Counter(5)));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn delete_evicts_entity() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("c/room-1/mark", b"5".to_vec());
        let calls = Arc::new(AtomicUsize::new(0));
        let watcher = PrefixedWatcher::new(
            store.clone(),
            "c/",
            None,
            Arc::new(CounterTransformer),
            Arc::new(RecordingHandler { calls }),
        );
        watcher.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.delete("c/room-1/mark");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(watcher.get_cached_state("room-1").await, None);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let store = Arc::new(MemoryKvStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let watcher = PrefixedWatcher::new(
            store,
            "c/",
            None,
            Arc::new(CounterTransformer),
            Arc::new(RecordingHandler { calls }),
        );
        watcher.start(CancellationToken::new()).await.unwrap();
        watcher.stop().await;
        watcher.stop().await;
    }
}
