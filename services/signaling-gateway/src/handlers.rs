//! The five registered methods of the signaling session controller (spec
//! §4.6): `join`, `leave`, `offer`, `icecandidate`, `keepalive`/`status`.
//!
//! Error mapping follows §4.5.3/§7: a handler that constructs an
//! [`RpcErrorObject`] deliberately (the steps below that fail with a named
//! `Internal`/`InvalidRequest`) is forwarded verbatim, custom message
//! included. Anything unexpected — a poisoned lock, an error variant the
//! algorithm doesn't name — is logged via `tracing::warn!` and collapsed to
//! `RpcErrorObject::internal_error()` ("unknown error") so internals never
//! leak to the wire.

use std::time::{SystemTime, UNIX_EPOCH};

use control_proto::jsonrpc::{error_codes, RpcErrorObject};
use control_proto::signaling::{
    IceCandidateParams, JoinParams, JoinResult, KeepaliveParams, LeaveParams, OfferParams, OfferResult,
};
use media_engine_client::MediaEngineError;
use rpc_engine::{HandlerRegistry, RegistryError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use session_lease::HoldOutcome;
use std::sync::atomic::Ordering;

use crate::session::{JoinedState, SessionContext};

const MAX_OFFER_POLLS: u32 = 50;
const OFFER_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// An `Internal` failure per the named steps of §4.6.1/§4.6.3 — message is
/// forwarded to the client as-is, unlike the generic catch-all.
fn internal(message: impl Into<String>) -> RpcErrorObject {
    RpcErrorObject { code: error_codes::INTERNAL_ERROR, message: message.into(), data: None }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcErrorObject> {
    let value = params.unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| RpcErrorObject::invalid_params(e.to_string()))
}

/// Registers all five methods against a fresh registry. `join`/`offer` do
/// media-engine I/O so they're spawned (`def_async`); `leave`/`icecandidate`/
/// `keepalive` are short enough to run inline, but are registered the same
/// way since they all await locks and broker calls regardless.
pub fn register(registry: &HandlerRegistry<SessionContext>) -> Result<(), RegistryError> {
    use control_proto::signaling::method;

    registry.def_async(method::JOIN, |ctx, params| async move { handle_join(ctx, params).await })?;
    registry.def_async(method::LEAVE, |ctx, params| async move { handle_leave(ctx, params).await })?;
    registry.def_async(method::OFFER, |ctx, params| async move { handle_offer(ctx, params).await })?;
    registry.def_async(method::ICE_CANDIDATE, |ctx, params| async move { handle_ice_candidate(ctx, params).await })?;
    registry.def_async(method::KEEPALIVE, |ctx, params| async move { handle_keepalive(ctx, params).await })?;
    registry.def_async(method::STATUS, |ctx, params| async move { handle_keepalive(ctx, params).await })?;
    Ok(())
}

async fn handle_join(ctx: SessionContext, params: Option<Value>) -> Result<Value, RpcErrorObject> {
    let input: JoinParams = parse_params(params)?;

    if ctx.joined.lock().await.is_some() {
        return Err(RpcErrorObject::invalid_request("already joined"));
    }

    // 1. + 2.
    let room = ctx.rooms.get(&ctx.room_id).await.ok_or_else(|| RpcErrorObject::invalid_request("no room found"))?;
    if !room.is_on_air() {
        return Err(RpcErrorObject::invalid_request("room is not on air"));
    }
    let live_meta = room.live_meta.as_ref().expect("is_on_air implies live_meta is present");

    // 3.
    let meta = room.meta.as_ref().ok_or_else(|| RpcErrorObject::invalid_request("no room found"))?;
    if !meta.pin.is_empty() && meta.pin != input.pin {
        return Err(RpcErrorObject::invalid_request("invalid room pin"));
    }

    // 4.
    let media = ctx.media_registry.get(&live_meta.bound_media_node).ok_or_else(|| internal("fail to get janus api"))?;

    // 5.
    let (decoded_session, decoded_handle) = input
        .jtoken
        .as_deref()
        .and_then(|token| ctx.token_codec.decode(&live_meta.nonce, token).ok())
        .unwrap_or((0, 0));

    // 6.
    let anchor = media
        .create_anchor_instance(&ctx.connection_id, decoded_session, decoded_handle)
        .await
        .map_err(|e| map_unexpected_media_error("create_anchor_instance", e))?;

    // 7.
    let (anchor, resumed) = if decoded_session != 0 || decoded_handle != 0 {
        match anchor.check().await {
            Ok(true) => (anchor, true),
            Ok(false) => {
                let fresh = media
                    .create_anchor_instance(&ctx.connection_id, 0, 0)
                    .await
                    .map_err(|e| map_unexpected_media_error("create_anchor_instance", e))?;
                (fresh, false)
            }
            Err(e) => return Err(internal(format!("check failed: {e}"))),
        }
    } else {
        // decoded ids were (0, 0); the adopted anchor always has nonzero
        // ids, so the adopted pair never equals the decoded one.
        (anchor, false)
    };

    // 8.
    let jtoken = ctx
        .token_codec
        .encode(&live_meta.nonce, anchor.session_id(), anchor.handle_id())
        .map_err(|_| internal("fail to create janus token"))?;

    // 9.
    let _ = ctx.room_users.create_user(&ctx.room_id, &ctx.user_id, "participant", 0, now_unix()).await;
    ctx.room_users
        .set_status(&ctx.room_id, &ctx.user_id, "idle", 0, now_unix())
        .await
        .map_err(|e| internal(format!("failed to update user status: {e}")))?;

    *ctx.joined.lock().await = Some(JoinedState { anchor, nonce: live_meta.nonce.clone() });

    Ok(serde_json::to_value(JoinResult { jtoken, resume: resumed }).expect("JoinResult always serializes"))
}

async fn handle_leave(ctx: SessionContext, params: Option<Value>) -> Result<Value, RpcErrorObject> {
    let _: LeaveParams = parse_params(params)?;

    let mut joined = ctx.joined.lock().await;
    if joined.take().is_none() {
        return Err(RpcErrorObject::invalid_request("not joined"));
    }
    drop(joined);

    ctx.room_users
        .set_status(&ctx.room_id, &ctx.user_id, "left", 0, now_unix())
        .await
        .map_err(|e| internal(format!("failed to update user status: {e}")))?;
    ctx.close_requested.store(true, Ordering::SeqCst);

    Ok(Value::Null)
}

async fn handle_offer(ctx: SessionContext, params: Option<Value>) -> Result<Value, RpcErrorObject> {
    let input: OfferParams = parse_params(params)?;

    let joined = ctx.joined.lock().await;
    let Some(joined) = joined.as_ref() else {
        return Err(RpcErrorObject::invalid_request("not joined"));
    };
    let anchor = joined.anchor.clone();
    drop(joined);

    let room = ctx.rooms.get(&ctx.room_id).await.ok_or_else(|| internal("no live room bound"))?;
    if room.meta.is_none() {
        return Err(internal("room meta unavailable"));
    }

    anchor
        .join(&ctx.room_id, input.sdp)
        .await
        .map_err(|e| map_unexpected_media_error("join", e))?;

    for _ in 0..MAX_OFFER_POLLS {
        let events = anchor.get_events().await.map_err(|e| map_unexpected_media_error("get_events", e))?;
        if let Some(event) = events.into_iter().find_map(|e| e.jsep) {
            return Ok(serde_json::to_value(OfferResult { sdp: event }).expect("OfferResult always serializes"));
        }
        tokio::time::sleep(OFFER_POLL_INTERVAL).await;
    }

    Err(internal("timed out waiting for media-engine answer"))
}

async fn handle_ice_candidate(ctx: SessionContext, params: Option<Value>) -> Result<Value, RpcErrorObject> {
    let input: IceCandidateParams = parse_params(params)?;

    let joined = ctx.joined.lock().await;
    let Some(joined) = joined.as_ref() else {
        return Err(RpcErrorObject::invalid_request("not joined"));
    };
    let anchor = joined.anchor.clone();
    drop(joined);

    anchor
        .ice_candidate(input.candidate)
        .await
        .map_err(|e| map_unexpected_media_error("ice_candidate", e))?;
    Ok(Value::Null)
}

async fn handle_keepalive(ctx: SessionContext, params: Option<Value>) -> Result<Value, RpcErrorObject> {
    let input: KeepaliveParams = parse_params(params)?;

    let joined = ctx.joined.lock().await;
    let Some(joined) = joined.as_ref() else {
        return Err(RpcErrorObject::invalid_request("not joined"));
    };
    let anchor = joined.anchor.clone();
    drop(joined);

    anchor.keep_alive().await.map_err(|e| map_unexpected_media_error("keep_alive", e))?;

    match ctx.lease.must_hold().await {
        Ok(HoldOutcome::Granted) => {}
        Ok(HoldOutcome::Rejected) => {
            tracing::info!(connection_id = %ctx.connection_id, "session lease rejected on keepalive, closing peer");
            ctx.close_requested.store(true, Ordering::SeqCst);
        }
        Err(e) => {
            tracing::warn!(error = %e, connection_id = %ctx.connection_id, "failed to re-hold session lease");
        }
    }

    ctx.room_users
        .set_status(&ctx.room_id, &ctx.user_id, input.status_or_default(), 0, now_unix())
        .await
        .map_err(|e| internal(format!("failed to update user status: {e}")))?;

    Ok(Value::Null)
}

/// `AlreadyExisted`/`NotFound` are protocol-idempotent outcomes the media
/// engine trait documents, not failures this handler set expects to see —
/// anything from the media engine that isn't a named `Internal` step above
/// is logged and collapsed rather than forwarded.
fn map_unexpected_media_error(op: &str, err: MediaEngineError) -> RpcErrorObject {
    tracing::warn!(error = %err, operation = op, "media engine call failed");
    RpcErrorObject::internal_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_registry::{MediaEngineRegistry, StaticMediaEngineRegistry};
    use crate::rooms::RoomDirectory;
    use control_proto::{LiveMeta, RoomMeta, RoomStatus};
    use kv_watch::{KvStore, MemoryKvStore};
    use media_engine_client::{FakeMediaEngine, MediaEngineClient};
    use room_state::{MemoryRoomUserBroker, RoomUserStore};
    use serde_json::json;
    use session_lease::{MemoryLeaseStore, SessionLease};
    use std::sync::Arc;
    use token_codec::TokenCodec;
    use tokio_util::sync::CancellationToken;

    async fn make_ctx(room_id: &str, pin: &str) -> (SessionContext, Arc<RoomDirectory>) {
        let store = Arc::new(MemoryKvStore::new());
        store.put(format!("rooms/{room_id}/meta"), serde_json::to_vec(&RoomMeta { pin: pin.into(), max_anchors: 8, created_at: 0 }).unwrap());
        store.put(
            format!("rooms/{room_id}/live_meta"),
            serde_json::to_vec(&LiveMeta { bound_media_node: "node-1".into(), bound_mixer: "mixer-1".into(), status: RoomStatus::OnAir, nonce: "nonce-1".into(), discard_at: None })
                .unwrap(),
        );
        let rooms = Arc::new(RoomDirectory::new(store, "rooms/"));
        rooms.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let engine = FakeMediaEngine::new();
        let registry: Arc<dyn MediaEngineRegistry> =
            Arc::new(StaticMediaEngineRegistry::single("node-1", engine as Arc<dyn MediaEngineClient>));
        let token_codec = Arc::new(TokenCodec::new(&[7u8; 32]).unwrap());
        let room_users = Arc::new(RoomUserStore::new(Arc::new(MemoryRoomUserBroker::new())));
        let lease = Arc::new(SessionLease::new(Arc::new(MemoryLeaseStore::new()), "gw-1".to_owned(), "u1".to_owned(), "conn-1".to_owned()));

        let ctx = SessionContext::new("conn-1".to_owned(), "u1".to_owned(), room_id.to_owned(), Arc::clone(&rooms), registry, token_codec, room_users, lease);
        (ctx, rooms)
    }

    #[tokio::test]
    async fn join_fails_without_room() {
        let (ctx, _rooms) = make_ctx("R-missing", "").await;
        let ctx = SessionContext::new(ctx.connection_id, ctx.user_id, "nope".to_owned(), ctx.rooms, ctx.media_registry, ctx.token_codec, ctx.room_users, ctx.lease);
        let err = handle_join(ctx, Some(json!({"clientId": uuid::Uuid::new_v4(), "pin": ""}))).await.unwrap_err();
        assert_eq!(err.message, "no room found");
    }

    #[tokio::test]
    async fn join_rejects_wrong_pin() {
        let (ctx, _rooms) = make_ctx("R1", "1234").await;
        let err = handle_join(ctx, Some(json!({"clientId": uuid::Uuid::new_v4(), "pin": "0000"}))).await.unwrap_err();
        assert_eq!(err.message, "invalid room pin");
    }

    #[tokio::test]
    async fn join_creates_fresh_session_and_marks_idle() {
        let (ctx, _rooms) = make_ctx("R1", "").await;
        let room_users = Arc::clone(&ctx.room_users);
        let result = handle_join(ctx.clone(), Some(json!({"clientId": uuid::Uuid::new_v4(), "pin": ""}))).await.unwrap();
        let join_result: JoinResult = serde_json::from_value(result).unwrap();
        // No jtoken was supplied, so the decoded ids were (0, 0); the freshly
        // created anchor always has nonzero ids, so this is never a resume.
        assert!(!join_result.resume);
        assert!(ctx.joined.lock().await.is_some());
        assert_eq!(room_users.get_user("R1", "u1").unwrap().status, "idle");
    }

    #[tokio::test]
    async fn join_twice_is_rejected() {
        let (ctx, _rooms) = make_ctx("R1", "").await;
        handle_join(ctx.clone(), Some(json!({"clientId": uuid::Uuid::new_v4(), "pin": ""}))).await.unwrap();
        let err = handle_join(ctx, Some(json!({"clientId": uuid::Uuid::new_v4(), "pin": ""}))).await.unwrap_err();
        assert_eq!(err.message, "already joined");
    }

    #[tokio::test]
    async fn leave_requires_joined() {
        let (ctx, _rooms) = make_ctx("R1", "").await;
        let err = handle_leave(ctx, Some(json!({}))).await.unwrap_err();
        assert_eq!(err.message, "not joined");
    }

    #[tokio::test]
    async fn leave_clears_joined_state_and_requests_close() {
        let (ctx, _rooms) = make_ctx("R1", "").await;
        handle_join(ctx.clone(), Some(json!({"clientId": uuid::Uuid::new_v4(), "pin": ""}))).await.unwrap();
        handle_leave(ctx.clone(), Some(json!({}))).await.unwrap();
        assert!(ctx.joined.lock().await.is_none());
        assert!(ctx.close_requested.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn offer_requires_joined() {
        let (ctx, _rooms) = make_ctx("R1", "").await;
        let sdp = json!({"sdp": {"type": "offer", "sdp": "v=0"}});
        let err = handle_offer(ctx, Some(sdp)).await.unwrap_err();
        assert_eq!(err.message, "not joined");
    }

    #[tokio::test]
    async fn ice_candidate_requires_joined() {
        let (ctx, _rooms) = make_ctx("R1", "").await;
        let err = handle_ice_candidate(ctx, Some(json!({"candidate": {"sdpMid": "0"}}))).await.unwrap_err();
        assert_eq!(err.message, "not joined");
    }

    #[tokio::test]
    async fn keepalive_defaults_status_to_idle() {
        let (ctx, _rooms) = make_ctx("R1", "").await;
        handle_join(ctx.clone(), Some(json!({"clientId": uuid::Uuid::new_v4(), "pin": ""}))).await.unwrap();
        handle_keepalive(ctx.clone(), Some(json!({}))).await.unwrap();
        assert_eq!(ctx.room_users.get_user("R1", "u1").unwrap().status, "idle");
    }
}
