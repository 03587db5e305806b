//! Canary-room restart monitor (§4.8): polls the media engine on an
//! interval and calls `restart_detected()` the moment a poll succeeds right
//! after a prior poll failed — the signal that the media engine process
//! came back after being unreachable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use media_engine_client::MediaEngineClient;
use media_reconciler::MediaNodeReconciler;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct CanaryMonitor {
    engine: Arc<dyn MediaEngineClient>,
    reconciler: Arc<MediaNodeReconciler>,
    interval: Duration,
    was_down: AtomicBool,
}

impl CanaryMonitor {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngineClient>, reconciler: Arc<MediaNodeReconciler>, interval: Duration) -> Self {
        Self { engine, reconciler, interval, was_down: AtomicBool::new(false) }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => self.poll_once().await,
                }
            }
        })
    }

    async fn poll_once(&self) {
        match self.engine.list_rooms().await {
            Ok(_) => {
                if self.was_down.swap(false, Ordering::SeqCst) {
                    info!("media engine reachable again, triggering reconciler rebuild");
                    self.reconciler.restart_detected().await;
                }
            }
            Err(err) => {
                if !self.was_down.swap(true, Ordering::SeqCst) {
                    warn!(error = %err, "media engine unreachable");
                }
            }
        }
    }
}
