//! Keyed scheduler: serializes and debounces per-key callbacks.
//!
//! Consumers call [`KeyedScheduler::enqueue`] to arm a key for delivery after
//! a delay, then drain [`KeyedScheduler::recv`] on a single task. At most one
//! timer is armed per key at a time; re-enqueueing with a shorter delay
//! replaces the armed timer, a longer delay is ignored (the earliest-armed
//! firing always wins, see spec §4.1/§9).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct PendingEntry {
    deadline: Instant,
    generation: u64,
}

struct Shared<K> {
    pending: Mutex<HashMap<K, PendingEntry>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Serializes and debounces per-key delivery onto a single sink channel.
///
/// `K` must be cheap to clone: it is cloned into the pending-entry map and
/// into every spawned timer task.
pub struct KeyedScheduler<K> {
    shared: Arc<Shared<K>>,
    sink_tx: mpsc::UnboundedSender<K>,
    sink_rx: mpsc::UnboundedReceiver<K>,
}

impl<K> KeyedScheduler<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a new scheduler. Nothing runs until [`Self::enqueue`] is called.
    pub fn new() -> Self {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
            sink_tx,
            sink_rx,
        }
    }

    /// Schedule `key` for delivery on the sink no sooner than `delay` from now.
    ///
    /// If a timer for `key` is already armed with an earlier-or-equal
    /// deadline, this call is a no-op: the scheduler never postpones an
    /// already-armed key. Otherwise the existing timer is superseded (its
    /// fire is suppressed) and a fresh, shorter timer is armed.
    pub fn enqueue(&self, key: K, delay: Duration) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        let deadline = Instant::now() + delay;
        let generation = {
            let mut pending = self.shared.pending.lock().expect("pending mutex poisoned");
            if let Some(existing) = pending.get(&key) {
                if existing.deadline <= deadline {
                    return;
                }
            }
            let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
            pending.insert(
                key.clone(),
                PendingEntry {
                    deadline,
                    generation,
                },
            );
            generation
        };

        let shared = Arc::clone(&self.shared);
        let sink_tx = self.sink_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                () = shared.shutdown.cancelled() => return,
            }
            let should_fire = {
                let mut pending = shared.pending.lock().expect("pending mutex poisoned");
                match pending.get(&key) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if should_fire && !shared.shutdown.is_cancelled() {
                let _ = sink_tx.send(key);
            }
        });
    }

    /// Receive the next key ready for delivery. Returns `None` once the
    /// scheduler is shut down and all in-flight timers have drained.
    pub async fn recv(&mut self) -> Option<K> {
        self.sink_rx.recv().await
    }

    /// Idempotent shutdown: cancels all armed timers and closes the sink.
    ///
    /// Already-fired-but-undelivered keys may still appear briefly on
    /// `recv`; once the last timer task observes cancellation, the channel
    /// drains to `None`.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.pending.lock().expect("pending mutex poisoned").clear();
        self.sink_rx.close();
    }
}

impl<K> Default for KeyedScheduler<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// `nextDelay(n) = min(100ms * 2^n, 10s)` — the retry backoff formula shared
/// by every component that re-enqueues a failed per-entity callback (spec
/// §4.2.2).
#[must_use]
pub fn next_retry_delay(retry_count: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(100);
    const CAP: Duration = Duration::from_secs(10);
    match BASE.checked_mul(1u32.checked_shl(retry_count).unwrap_or(u32::MAX)) {
        Some(d) if d < CAP => d,
        _ => CAP,
    }
}
