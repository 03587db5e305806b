//! Shared room sub-key merge rule (spec §3.1): both the fleet resource
//! manager's stats-augmented watcher (C7) and the media-node reconciler's
//! watcher (C8) merge the same four sub-keys into a [`RoomEntity`], each
//! layering its own rebuild hooks on top. Factored out here so the merge
//! logic — and any future sub-key addition — is written once.

use control_proto::RoomEntity;

use crate::errors::TransformError;
use crate::healthy::parse_optional;

/// Applies one `{meta, live_meta, media_node_binding, mixer_binding}`
/// sub-key event to `current`, returning the merged entity (or `None` if
/// the merge leaves it empty).
pub fn merge_room_subkey(
    current: Option<&RoomEntity>,
    sub_key_type: &str,
    raw: Option<&[u8]>,
) -> Result<Option<RoomEntity>, TransformError> {
    let mut next = current.cloned().unwrap_or_default();
    match sub_key_type {
        "meta" => next.meta = parse_optional(raw)?,
        "live_meta" => next.live_meta = parse_optional(raw)?,
        "media_node_binding" => next.media_node_binding = parse_optional(raw)?,
        "mixer_binding" => next.mixer_binding = parse_optional(raw)?,
        other => tracing::debug!(sub_key_type = other, "ignoring unexpected room sub-key type"),
    }
    if next.is_empty() {
        Ok(None)
    } else {
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_meta_then_live_meta() {
        let meta_raw = serde_json::to_vec(&json!({"pin": "1234", "max_anchors": 8, "created_at": 0})).unwrap();
        let merged = merge_room_subkey(None, "meta", Some(&meta_raw)).unwrap().unwrap();
        assert!(merged.meta.is_some());
        assert!(merged.live_meta.is_none());

        let live_raw = serde_json::to_vec(&json!({
            "bound_media_node": "node-1",
            "bound_mixer": "mixer-1",
            "status": "on_air",
            "nonce": "n1",
        }))
        .unwrap();
        let merged = merge_room_subkey(Some(&merged), "live_meta", Some(&live_raw)).unwrap().unwrap();
        assert!(merged.live_meta.is_some());
        assert!(merged.is_on_air());
    }

    #[test]
    fn deleting_last_subkey_returns_none() {
        let meta_raw = serde_json::to_vec(&json!({"pin": "", "max_anchors": 1, "created_at": 0})).unwrap();
        let merged = merge_room_subkey(None, "meta", Some(&meta_raw)).unwrap().unwrap();
        let merged = merge_room_subkey(Some(&merged), "meta", None).unwrap();
        assert!(merged.is_none());
    }
}
