use std::collections::HashMap;
use std::sync::Arc;

use signaling_gateway::auth::{StaticTokenVerifier, TokenVerifier};
use signaling_gateway::media_registry::{MediaEngineRegistry, StaticMediaEngineRegistry};
use signaling_gateway::rooms::RoomDirectory;
use signaling_gateway::state::AppState;
use signaling_gateway::{build_router, config};

use kv_watch::{KvStore, MemoryKvStore};
use session_lease::MemoryLeaseStore;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(log_level)).init();

    let cfg = config::load_config().unwrap_or_else(|err| {
        eprintln!("FATAL: failed to load config: {err}");
        std::process::exit(1);
    });

    // TODO: wire a real KV store client once one exists outside tests;
    // `MemoryKvStore` keeps this binary runnable standalone in the
    // meantime, matching this room directory's own test double.
    let kv_store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let rooms = Arc::new(RoomDirectory::new(kv_store, cfg.room_prefix.clone()));
    let watch_cancel = CancellationToken::new();
    rooms.start(watch_cancel.clone()).await.expect("failed to start room directory watcher");

    // A real deployment registers one concrete `MediaEngineClient` per
    // configured media-node id here; none is wired by default since §6.3
    // treats the media engine's transport as opaque.
    let media_registry: Arc<dyn MediaEngineRegistry> = Arc::new(StaticMediaEngineRegistry::new(HashMap::new()));

    let token_verifier: Arc<dyn TokenVerifier> = Arc::new(StaticTokenVerifier::new());
    let lease_store = Arc::new(MemoryLeaseStore::new());

    let state = AppState::new(&cfg, rooms, media_registry, token_verifier, lease_store);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind).await.expect("failed to bind");
    info!(addr = %cfg.bind, "signaling gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    watch_cancel.cancel();
    info!("signaling gateway shut down gracefully");
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
