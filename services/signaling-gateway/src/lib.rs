pub mod auth;
pub mod config;
pub mod handlers;
pub mod health;
pub mod media_registry;
pub mod rooms;
pub mod session;
pub mod state;
pub mod ws_adapter;
pub mod ws_handler;

pub use state::AppState;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Builds the HTTP/WS router (§6.4): `/healthz` plus the `/ws` upgrade.
/// Origin restriction comes from `config.allowed_origins`; an empty list
/// permits any origin (suitable for same-origin or non-browser clients).
#[must_use]
pub fn build_router(state: AppState) -> Router {
    let cors = if state.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    Router::new()
        .route("/healthz", get(health::health))
        .route("/ws", get(ws_handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
