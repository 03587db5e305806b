//! Maps a room's bound media-node id to the [`MediaEngineClient`] that
//! speaks for it (spec §4.6.1 step 4: "obtain the media-engine client for
//! the bound media-node"). Concrete media-node discovery is out of scope
//! here — same boundary `media-engine-client` itself draws around the wire
//! transport — so this is a small trait plus a static test/single-node
//! double, analogous to `FakeMediaEngine` one layer up.

use std::collections::HashMap;
use std::sync::Arc;

use media_engine_client::MediaEngineClient;

pub trait MediaEngineRegistry: Send + Sync {
    fn get(&self, media_node_id: &str) -> Option<Arc<dyn MediaEngineClient>>;
}

/// Fixed `media_node_id -> client` map, suitable for a single-node
/// deployment or for tests; a multi-node deployment would back this with a
/// discovery watcher instead.
pub struct StaticMediaEngineRegistry {
    clients: HashMap<String, Arc<dyn MediaEngineClient>>,
}

impl StaticMediaEngineRegistry {
    #[must_use]
    pub fn new(clients: HashMap<String, Arc<dyn MediaEngineClient>>) -> Self {
        Self { clients }
    }

    #[must_use]
    pub fn single(media_node_id: impl Into<String>, client: Arc<dyn MediaEngineClient>) -> Self {
        let mut clients = HashMap::new();
        clients.insert(media_node_id.into(), client);
        Self { clients }
    }
}

impl MediaEngineRegistry for StaticMediaEngineRegistry {
    fn get(&self, media_node_id: &str) -> Option<Arc<dyn MediaEngineClient>> {
        self.clients.get(media_node_id).cloned()
    }
}
