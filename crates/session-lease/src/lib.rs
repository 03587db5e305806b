//! Single-active-connection lease (C6.6): a per-user lock key with
//! server-liveness-backed steal-on-death, refreshed by a background ticker.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
const DEFAULT_LIVENESS_TTL: Duration = Duration::from_secs(3);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    Granted,
    /// The peer should be closed; the lock is held by someone else whose
    /// liveness key is still live.
    Rejected,
}

/// The atomic `MustHold`/`Release` scripts plus the raw liveness-key
/// primitives (spec §4.6.6). A real implementation runs `must_hold` as a
/// single server-side script; [`MemoryLeaseStore`] below fakes atomicity
/// with an in-process mutex.
#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync {
    /// `(lock-key, server-liveness-key, "<sid>:<cid>", ttl)`:
    ///   - lock absent → set with TTL → granted
    ///   - lock equals `holder_value` → extend TTL → granted
    ///   - liveness key of the current holder (derived via
    ///     `liveness_key_for`) absent → steal, set with TTL → granted
    ///   - else → rejected
    async fn must_hold(
        &self,
        lock_key: &str,
        holder_value: &str,
        liveness_key_for: fn(&str) -> String,
        ttl: Duration,
    ) -> Result<HoldOutcome, LeaseError>;

    /// Delete `lock_key` only if its current value equals `holder_value`.
    async fn release(&self, lock_key: &str, holder_value: &str) -> Result<(), LeaseError>;

    async fn set_liveness(&self, liveness_key: &str, ttl: Duration) -> Result<(), LeaseError>;

    async fn delete_liveness(&self, liveness_key: &str) -> Result<(), LeaseError>;
}

fn liveness_key_from_holder(holder_value: &str) -> String {
    let server_id = holder_value.split(':').next().unwrap_or("");
    format!("s:{server_id}")
}

struct HeartbeatHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One lease instance per `(server_id, user_id)`; `connection_id` changes
/// across reconnects of the same user to the same server.
pub struct SessionLease {
    store: Arc<dyn LeaseStore>,
    user_id: String,
    server_id: String,
    connection_id: String,
    lock_ttl: Duration,
    liveness_ttl: Duration,
    heartbeat_interval: Duration,
    heartbeat: AsyncMutex<Option<HeartbeatHandle>>,
}

impl SessionLease {
    #[must_use]
    pub fn new(
        store: Arc<dyn LeaseStore>,
        server_id: impl Into<String>,
        user_id: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            user_id: user_id.into(),
            server_id: server_id.into(),
            connection_id: connection_id.into(),
            lock_ttl: DEFAULT_LOCK_TTL,
            liveness_ttl: DEFAULT_LIVENESS_TTL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat: AsyncMutex::new(None),
        }
    }

    fn lock_key(&self) -> String {
        format!("c:{}", self.user_id)
    }

    fn liveness_key(&self) -> String {
        format!("s:{}", self.server_id)
    }

    fn holder_value(&self) -> String {
        format!("{}:{}", self.server_id, self.connection_id)
    }

    /// Attempts to (re-)acquire or extend the per-user lock. Callers should
    /// close the peer connection on [`HoldOutcome::Rejected`].
    pub async fn must_hold(&self) -> Result<HoldOutcome, LeaseError> {
        self.store
            .must_hold(
                &self.lock_key(),
                &self.holder_value(),
                liveness_key_from_holder,
                self.lock_ttl,
            )
            .await
    }

    /// Delete the lock if we still hold it.
    pub async fn release_lock(&self) -> Result<(), LeaseError> {
        self.store.release(&self.lock_key(), &self.holder_value()).await
    }

    /// Writes initial liveness then starts the 1s refresh ticker.
    pub async fn start(&self) -> Result<(), LeaseError> {
        let mut guard = self.heartbeat.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        self.store.set_liveness(&self.liveness_key(), self.liveness_ttl).await?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let store = Arc::clone(&self.store);
        let liveness_key = self.liveness_key();
        let liveness_ttl = self.liveness_ttl;
        let interval = self.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = store.set_liveness(&liveness_key, liveness_ttl).await {
                            warn!(error = %err, "failed to refresh liveness key");
                        }
                    }
                }
            }
        });

        *guard = Some(HeartbeatHandle { cancel, task });
        Ok(())
    }

    /// Deletes liveness and awaits the heartbeat loop. Idempotent.
    pub async fn stop(&self) -> Result<(), LeaseError> {
        let handle = self.heartbeat.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
        self.store.delete_liveness(&self.liveness_key()).await
    }
}

/// In-process [`LeaseStore`] test double: one mutex-guarded map of
/// key → (value, expiry), with `must_hold` implemented as a single critical
/// section so it behaves atomically like the real broker script would.
pub mod memory {
    use super::{HoldOutcome, LeaseError, LeaseStore};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct Entry {
        value: String,
        expires_at: Instant,
    }

    #[derive(Default)]
    pub struct MemoryLeaseStore {
        entries: Mutex<HashMap<String, Entry>>,
    }

    impl MemoryLeaseStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn live_value(entries: &HashMap<String, Entry>, key: &str) -> Option<String> {
            entries.get(key).and_then(|e| {
                if e.expires_at > Instant::now() {
                    Some(e.value.clone())
                } else {
                    None
                }
            })
        }
    }

    #[async_trait::async_trait]
    impl LeaseStore for MemoryLeaseStore {
        async fn must_hold(
            &self,
            lock_key: &str,
            holder_value: &str,
            liveness_key_for: fn(&str) -> String,
            ttl: Duration,
        ) -> Result<HoldOutcome, LeaseError> {
            let mut entries = self.entries.lock().expect("lease store mutex poisoned");
            let now = Instant::now();
            match Self::live_value(&entries, lock_key) {
                None => {
                    entries.insert(
                        lock_key.to_owned(),
                        Entry {
                            value: holder_value.to_owned(),
                            expires_at: now + ttl,
                        },
                    );
                    Ok(HoldOutcome::Granted)
                }
                Some(current) if current == holder_value => {
                    entries.insert(
                        lock_key.to_owned(),
                        Entry {
                            value: holder_value.to_owned(),
                            expires_at: now + ttl,
                        },
                    );
                    Ok(HoldOutcome::Granted)
                }
                Some(current) => {
                    let liveness_key = liveness_key_for(&current);
                    if Self::live_value(&entries, &liveness_key).is_none() {
                        entries.insert(
                            lock_key.to_owned(),
                            Entry {
                                value: holder_value.to_owned(),
                                expires_at: now + ttl,
                            },
                        );
                        Ok(HoldOutcome::Granted)
                    } else {
                        Ok(HoldOutcome::Rejected)
                    }
                }
            }
        }

        async fn release(&self, lock_key: &str, holder_value: &str) -> Result<(), LeaseError> {
            let mut entries = self.entries.lock().expect("lease store mutex poisoned");
            if Self::live_value(&entries, lock_key).as_deref() == Some(holder_value) {
                entries.remove(lock_key);
            }
            Ok(())
        }

        async fn set_liveness(&self, liveness_key: &str, ttl: Duration) -> Result<(), LeaseError> {
            let mut entries = self.entries.lock().expect("lease store mutex poisoned");
            entries.insert(
                liveness_key.to_owned(),
                Entry {
                    value: String::new(),
                    expires_at: Instant::now() + ttl,
                },
            );
            Ok(())
        }

        async fn delete_liveness(&self, liveness_key: &str) -> Result<(), LeaseError> {
            self.entries.lock().expect("lease store mutex poisoned").remove(liveness_key);
            Ok(())
        }
    }
}

pub use memory::MemoryLeaseStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_lock_when_absent() {
        let store = Arc::new(MemoryLeaseStore::new());
        let lease = SessionLease::new(store, "srv-a", "user-1", "cid-1");
        assert_eq!(lease.must_hold().await.unwrap(), HoldOutcome::Granted);
    }

    #[tokio::test]
    async fn extends_own_lock() {
        let store = Arc::new(MemoryLeaseStore::new());
        let lease = SessionLease::new(store, "srv-a", "user-1", "cid-1");
        lease.must_hold().await.unwrap();
        assert_eq!(lease.must_hold().await.unwrap(), HoldOutcome::Granted);
    }

    #[tokio::test]
    async fn rejects_while_other_holder_is_live() {
        let store = Arc::new(MemoryLeaseStore::new());
        let holder_a = SessionLease::new(Arc::clone(&store), "srv-a", "user-1", "cid-1");
        holder_a.start().await.unwrap();
        holder_a.must_hold().await.unwrap();

        let holder_b = SessionLease::new(store, "srv-b", "user-1", "cid-2");
        assert_eq!(holder_b.must_hold().await.unwrap(), HoldOutcome::Rejected);
        holder_a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn steals_once_holder_liveness_expires() {
        let store = Arc::new(MemoryLeaseStore::new());
        // Server A grabs the lock but never starts its liveness heartbeat.
        let holder_a = SessionLease::new(Arc::clone(&store), "srv-a", "user-1", "cid-1");
        holder_a.must_hold().await.unwrap();

        let holder_b = SessionLease::new(store, "srv-b", "user-1", "cid-2");
        // srv-a's liveness key was never set, so it's already "dead".
        assert_eq!(holder_b.must_hold().await.unwrap(), HoldOutcome::Granted);
    }

    #[tokio::test]
    async fn release_only_clears_matching_value() {
        let store = Arc::new(MemoryLeaseStore::new());
        let lease = SessionLease::new(Arc::clone(&store), "srv-a", "user-1", "cid-1");
        lease.must_hold().await.unwrap();
        lease.release_lock().await.unwrap();

        let other = SessionLease::new(store, "srv-b", "user-1", "cid-2");
        assert_eq!(other.must_hold().await.unwrap(), HoldOutcome::Granted);
    }

    #[test]
    fn liveness_key_parses_server_id_prefix() {
        assert_eq!(liveness_key_from_holder("srv-a:cid-1"), "s:srv-a");
    }
}
