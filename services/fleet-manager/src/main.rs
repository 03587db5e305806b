// fleet-manager: composes the room-stats watcher, the two healthy-module
// watchers (media nodes, mixers) and the housekeeping loop (C7, §4.7). Has
// no HTTP surface of its own; `fleet_resource::pick` is exposed as a library
// call for whichever service needs to bind a room (signaling-gateway, or an
// operator tool), not as a new endpoint here — re-pick of an already-bound
// room stays out of scope per the housekeeping design.

use std::sync::Arc;

use fleet_manager::config;
use fleet_resource::{Housekeeping, RoomStatsWatcher};
use kv_watch::{HealthyModuleWatcher, KvStore, MemoryKvStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "fleet-manager starting");

    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("FATAL: failed to load config: {err}");
            std::process::exit(1);
        }
    };

    // TODO: wire a real KV store client once one exists outside tests;
    // `MemoryKvStore` keeps this binary runnable standalone in the
    // meantime, matching the signaling gateway's own stand-in.
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());

    let room_stats = Arc::new(RoomStatsWatcher::new(Arc::clone(&store), cfg.rooms_prefix.clone()));
    let media_nodes = Arc::new(HealthyModuleWatcher::new(Arc::clone(&store), cfg.media_nodes_prefix.clone()));
    let mixers = Arc::new(HealthyModuleWatcher::new(Arc::clone(&store), cfg.mixers_prefix.clone()));

    let watch_cancel = CancellationToken::new();
    room_stats.start(watch_cancel.clone()).await.expect("failed to start room stats watcher");
    media_nodes.start(watch_cancel.clone()).await.expect("failed to start media node watcher");
    mixers.start(watch_cancel.clone()).await.expect("failed to start mixer watcher");

    let housekeeping = Arc::new(Housekeeping::new(
        Arc::clone(&store),
        cfg.rooms_prefix.clone(),
        Arc::clone(&room_stats),
        Arc::clone(&media_nodes),
        Arc::clone(&mixers),
    ));
    housekeeping.start().await;

    info!(
        rooms_prefix = %cfg.rooms_prefix,
        media_nodes_prefix = %cfg.media_nodes_prefix,
        mixers_prefix = %cfg.mixers_prefix,
        "fleet-manager watchers and housekeeping running"
    );

    shutdown_signal().await;

    housekeeping.stop().await;
    room_stats.stop().await;
    media_nodes.stop().await;
    mixers.stop().await;
    watch_cancel.cancel();
    info!("fleet-manager shut down gracefully");
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
