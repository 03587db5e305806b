//! The `/ws` upgrade handler (§6.4). Bearer auth mirrors
//! `services/server/src/ws_forwarder.rs`'s accept-then-upgrade shape; once
//! upgraded, a fresh `rpc_engine::Connection<SessionContext>` drives the
//! session until the peer disconnects or `leave` requests a close.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use rpc_engine::{Connection, WebSocketTransport};
use serde::Deserialize;
use session_lease::HoldOutcome;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{extract_bearer, VerifyError};
use crate::session::SessionContext;
use crate::state::AppState;
use crate::ws_adapter::{AxumWsSink, AxumWsStream};

const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub room: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let bearer = query.token.or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer)
            .map(str::to_owned)
    });
    let Some(bearer) = bearer else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    let Some(room_id) = query.room else {
        return (StatusCode::BAD_REQUEST, "missing room query parameter").into_response();
    };

    let user = match state.token_verifier.verify(&bearer).await {
        Ok(user) => user,
        Err(VerifyError::NoToken | VerifyError::InvalidToken) => {
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
        Err(VerifyError::Other(err)) => {
            tracing::warn!(error = %err, "token verifier failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "verifier error").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user.user_id, room_id))
}

async fn handle_socket(socket: axum::extract::ws::WebSocket, state: AppState, user_id: String, room_id: String) {
    let connection_id = Uuid::new_v4().to_string();
    let (sink, stream) = socket.split();
    let transport: Arc<dyn rpc_engine::ObjectStream> =
        Arc::new(WebSocketTransport::new(AxumWsSink::new(sink), AxumWsStream::new(stream)));

    let registry = Arc::clone(&state.registry);

    let lease = state.new_lease(&user_id, &connection_id);
    if let Err(err) = lease.start().await {
        tracing::warn!(error = %err, connection_id = %connection_id, "failed to start session lease");
    }
    match lease.must_hold().await {
        Ok(HoldOutcome::Granted) => {}
        Ok(HoldOutcome::Rejected) => {
            tracing::info!(user_id = %user_id, "rejecting connection, lease already held elsewhere");
            let _ = lease.stop().await;
            return;
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to acquire session lease");
            let _ = lease.stop().await;
            return;
        }
    }

    let ctx = SessionContext::new(
        connection_id.clone(),
        user_id.clone(),
        room_id,
        Arc::clone(&state.rooms),
        Arc::clone(&state.media_registry),
        Arc::clone(&state.token_codec),
        Arc::clone(&state.room_users),
        lease.clone(),
    );

    let connection = Connection::new(transport, registry, ctx.clone());
    let cancel = CancellationToken::new();
    if let Err(err) = connection.open(cancel.clone()).await {
        tracing::warn!(error = %err, "failed to open rpc connection");
        let _ = lease.stop().await;
        return;
    }

    let mut poll = tokio::time::interval(CLOSE_POLL_INTERVAL);
    loop {
        poll.tick().await;
        if connection.is_closed() || ctx.close_requested.load(Ordering::SeqCst) {
            break;
        }
    }
    cancel.cancel();
    let _ = connection.close().await;
    ctx.room_users.remove_user(&ctx.room_id, &ctx.user_id).await;
    let _ = lease.stop().await;
    tracing::info!(connection_id = %connection_id, user_id = %user_id, "session ended");
}
