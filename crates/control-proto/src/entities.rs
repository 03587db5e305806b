//! Composite-entity sub-key wire shapes (spec §3.1).
//!
//! These are pure data: merge rules and persistence live in `kv-watch`. A
//! sub-key type is absent from an entity until its key is written; presence
//! and the accessors below are what "is healthy" / "is stable" / "is
//! pickable" and the room lifecycle predicates are built from.

use serde::{Deserialize, Serialize};

/// `{prefix}{id}/heartbeat` — liveness and capacity of a module (media node
/// or mixer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub host: String,
    pub capacity: i64,
    pub started_at: i64,
    pub status: String,
}

impl Heartbeat {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// `{prefix}{id}/mark` — operator-asserted readiness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub label: String,
}

impl Mark {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.label == "ready"
    }
}

/// Composite view of a health/module entity: merge of `heartbeat` + `mark`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleEntity {
    pub heartbeat: Option<Heartbeat>,
    pub mark: Option<Mark>,
}

impl ModuleEntity {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heartbeat.is_none() && self.mark.is_none()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.heartbeat.as_ref().is_some_and(Heartbeat::is_healthy)
    }

    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.is_healthy() && self.mark.as_ref().is_some_and(Mark::is_ready)
    }

    #[must_use]
    pub fn is_pickable(&self) -> bool {
        self.is_stable() && self.heartbeat.as_ref().is_some_and(|h| h.capacity > 0)
    }
}

/// Room status as carried in `live_meta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    OnAir,
    Removing,
}

/// `{prefix}{room_id}/meta` — written at room creation, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMeta {
    pub pin: String,
    pub max_anchors: i64,
    /// Unix seconds the room was created; housekeeping's age checks measure
    /// from here.
    pub created_at: i64,
}

/// `{prefix}{room_id}/live_meta` — appears once the room is bound to nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMeta {
    pub bound_media_node: String,
    pub bound_mixer: String,
    pub status: RoomStatus,
    /// Opaque AAD bound to session tokens minted for this room.
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_at: Option<i64>,
}

/// Forwarding endpoint a mixer exposes for a room.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixerEndpoint {
    pub ip: std::net::IpAddr,
    pub port: u16,
}

/// `{prefix}{room_id}/mixer_binding` — owned by the mixer's reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixerBinding {
    pub mixer: MixerEndpoint,
}

/// Status a media node's reconciler records against its own binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaNodeBindingStatus {
    RoomCreated,
    Forwarding,
    NotForwarding,
}

/// `{prefix}{room_id}/media_node_binding` — owned by the media node's
/// reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaNodeBinding {
    pub status: MediaNodeBindingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<i64>,
}

/// Composite view of a room entity: merge of its four sub-keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomEntity {
    pub meta: Option<RoomMeta>,
    pub live_meta: Option<LiveMeta>,
    pub media_node_binding: Option<MediaNodeBinding>,
    pub mixer_binding: Option<MixerBinding>,
}

impl RoomEntity {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meta.is_none()
            && self.live_meta.is_none()
            && self.media_node_binding.is_none()
            && self.mixer_binding.is_none()
    }

    #[must_use]
    pub fn is_on_air(&self) -> bool {
        self.live_meta
            .as_ref()
            .is_some_and(|lm| lm.status == RoomStatus::OnAir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_heartbeat() -> Heartbeat {
        Heartbeat {
            host: "node-1".into(),
            capacity: 4,
            started_at: 0,
            status: "healthy".into(),
        }
    }

    #[test]
    fn module_empty_when_no_subkeys() {
        assert!(ModuleEntity::default().is_empty());
    }

    #[test]
    fn module_healthy_requires_heartbeat_status() {
        let mut m = ModuleEntity {
            heartbeat: Some(healthy_heartbeat()),
            mark: None,
        };
        assert!(m.is_healthy());
        assert!(!m.is_stable());
        m.mark = Some(Mark { label: "ready".into() });
        assert!(m.is_stable());
        assert!(m.is_pickable());
    }

    #[test]
    fn module_not_pickable_when_capacity_zero() {
        let mut hb = healthy_heartbeat();
        hb.capacity = 0;
        let m = ModuleEntity {
            heartbeat: Some(hb),
            mark: Some(Mark { label: "ready".into() }),
        };
        assert!(m.is_stable());
        assert!(!m.is_pickable());
    }

    #[test]
    fn room_empty_iff_all_subkeys_absent() {
        let mut r = RoomEntity::default();
        assert!(r.is_empty());
        r.meta = Some(RoomMeta {
            pin: String::new(),
            max_anchors: 1,
            created_at: 0,
        });
        assert!(!r.is_empty());
    }
}
