use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{KvStore, NoPeers, OpenedSpace, SyncEngine};
use crate::store::SpaceStore;
use crate::types::{Entry, PeerId, SpaceId};

/// In-process engine with no replication: every write is simply read back
/// by the local poller. Used for host-side development without a relay.
pub struct LoopbackEngine {
    peer_id: PeerId,
    spaces: Mutex<HashMap<SpaceId, SpaceStore>>,
}

impl LoopbackEngine {
    pub fn new(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            spaces: Mutex::new(HashMap::new()),
        }
    }

    fn open(&self, space_id: &str) -> OpenedSpace {
        let store = self
            .spaces
            .lock()
            .expect("loopback spaces poisoned")
            .entry(space_id.to_string())
            .or_insert_with(|| SpaceStore::new(space_id, &self.peer_id))
            .clone();
        OpenedSpace {
            id: space_id.to_string(),
            descriptor: None,
            store: Arc::new(PlainStore { store }),
            peers: Arc::new(NoPeers),
            replicator: None,
        }
    }
}

#[async_trait]
impl SyncEngine for LoopbackEngine {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn create_space(&self) -> Result<OpenedSpace> {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let space_id = format!("loopback-{nanos}");
        info!("Created loopback space {space_id}");
        Ok(self.open(&space_id))
    }

    /// Any id can be joined; unknown ids start empty.
    async fn open_space(&self, space_id: &str) -> Result<OpenedSpace> {
        Ok(self.open(space_id))
    }
}

struct PlainStore {
    store: SpaceStore,
}

impl KvStore for PlainStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.store.write().put(key.to_string(), value)?;
        Ok(())
    }

    fn iterate(
        &self,
        prefix: &str,
        visitor: &mut dyn FnMut(&str, &[Entry]) -> bool,
    ) -> Result<()> {
        self.store.read().iterate_prefix(prefix, visitor);
        Ok(())
    }

    fn decrypt(&self, entry: &Entry) -> Result<Vec<u8>> {
        Ok(entry.value.clone())
    }

    fn value_count(&self) -> usize {
        self.store.read().value_count()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
