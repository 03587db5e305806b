// media-agent: runs the media-node reconciler co-located with a media
// engine, plus the canary-room monitor that triggers a full rebuild after a
// restart (C8, §4.8).

use std::sync::Arc;
use std::time::Duration;

use media_agent::canary::CanaryMonitor;
use media_agent::config;
use media_engine_client::{FakeMediaEngine, MediaEngineClient};
use kv_watch::{KvStore, MemoryKvStore};
use media_reconciler::MediaNodeReconciler;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "media-agent starting");

    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("FATAL: failed to load config: {err}");
            std::process::exit(1);
        }
    };

    // TODO: wire a real media-engine HTTP client and KV store client once
    // one exists outside tests; these stand-ins keep the binary runnable.
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let engine: Arc<dyn MediaEngineClient> = FakeMediaEngine::new();

    let reconciler = Arc::new(MediaNodeReconciler::new(
        cfg.self_id.clone(),
        cfg.canary_room_id.clone(),
        Arc::clone(&engine),
        Arc::clone(&store),
        cfg.rooms_prefix.clone(),
    ));
    let watch_cancel = CancellationToken::new();
    reconciler.start(watch_cancel.clone()).await.expect("failed to start reconciler watcher");

    let monitor = Arc::new(CanaryMonitor::new(
        Arc::clone(&engine),
        Arc::clone(&reconciler),
        Duration::from_secs(cfg.canary_poll_interval_secs),
    ));
    let monitor_cancel = CancellationToken::new();
    let monitor_task = monitor.spawn(monitor_cancel.clone());

    info!(
        self_id = %cfg.self_id,
        canary_room_id = %cfg.canary_room_id,
        rooms_prefix = %cfg.rooms_prefix,
        "media-agent reconciler and canary monitor running"
    );

    shutdown_signal().await;

    monitor_cancel.cancel();
    let _ = monitor_task.await;
    reconciler.stop().await;
    watch_cancel.cancel();
    info!("media-agent shut down gracefully");
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
