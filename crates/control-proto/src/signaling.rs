//! Method param/result payloads for the signaling session controller (spec
//! §4.6). Method names as registered with the JSON-RPC handler registry.

use serde::{Deserialize, Serialize};

pub mod method {
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const OFFER: &str = "offer";
    pub const ICE_CANDIDATE: &str = "icecandidate";
    pub const KEEPALIVE: &str = "keepalive";
    /// Accepted as an alias for [`KEEPALIVE`] at dispatch time.
    pub const STATUS: &str = "status";
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinParams {
    pub pin: String,
    #[serde(rename = "clientId")]
    pub client_id: uuid::Uuid,
    #[serde(default)]
    pub jtoken: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinResult {
    pub jtoken: String,
    pub resume: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaveParams {}

#[derive(Debug, Clone, Deserialize)]
pub struct OfferParams {
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfferResult {
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IceCandidateParams {
    pub candidate: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeepaliveParams {
    #[serde(default)]
    pub status: Option<String>,
}

impl KeepaliveParams {
    #[must_use]
    pub fn status_or_default(&self) -> &str {
        self.status.as_deref().unwrap_or("idle")
    }
}
