//! The reconciler's local view of rooms it has actually materialized in the
//! media engine — the `active-rooms map` the four predicates read.

use control_proto::MixerEndpoint;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveRoom {
    pub media_room_id: i64,
    pub stream_id: Option<i64>,
    pub endpoint: Option<MixerEndpoint>,
}
