use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    KvStore, OpenedSpace, PeerDirectory, PeerSync, SyncEngine, OPERATIONS_PREFIX, SPACE_TYPE,
};
use crate::crypto::{SpaceHeader, SpaceKey};
use crate::descriptor::{SpaceDescriptor, SpaceSettings};
use crate::exchange::{ExchangeInterface, Replicator};
use crate::store::SpaceStore;
use crate::types::{Entry, PeerId, SpaceId};

/// Engine replicating spaces through relay nodes reachable over `Net`.
///
/// With a storage root every space lives in `<root>/<space id>/`
/// (descriptor, WAL, snapshot); without one everything is in memory.
pub struct LocalEngine<Net: ExchangeInterface> {
    peer_id: PeerId,
    root: Option<PathBuf>,
    network: Arc<Net>,
    spaces: StoreCache,
}

/// Open stores by space id. An entry lives until its space is closed, so a
/// rejoin while open reuses the WAL writer.
type StoreCache = Arc<Mutex<HashMap<SpaceId, (SpaceDescriptor, SpaceStore)>>>;

impl<Net: ExchangeInterface> LocalEngine<Net> {
    pub fn new(peer_id: impl Into<PeerId>, network: Arc<Net>) -> Self {
        Self {
            peer_id: peer_id.into(),
            root: None,
            network,
            spaces: StoreCache::default(),
        }
    }

    pub fn with_storage(
        peer_id: impl Into<PeerId>,
        network: Arc<Net>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::new(peer_id, network)
        }
    }

    fn space_dir(&self, space_id: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(space_id))
    }

    fn cached(&self, space_id: &str) -> Option<(SpaceDescriptor, SpaceStore)> {
        self.spaces
            .lock()
            .expect("engine space cache poisoned")
            .get(space_id)
            .cloned()
    }

    /// Open (or reuse) the store for a descriptor we already trust
    fn open_store(&self, descriptor: &SpaceDescriptor) -> Result<SpaceStore> {
        if let Some((_, store)) = self.cached(&descriptor.id) {
            return Ok(store);
        }
        let store = match self.space_dir(&descriptor.id) {
            Some(dir) => {
                descriptor.save_to(&dir)?;
                SpaceStore::open_persistent(&descriptor.id, &self.peer_id, dir)?
            }
            None => SpaceStore::new(&descriptor.id, &self.peer_id),
        };
        self.spaces
            .lock()
            .expect("engine space cache poisoned")
            .insert(descriptor.id.clone(), (descriptor.clone(), store.clone()));
        Ok(store)
    }

    /// Look for a descriptor locally, then ask every reachable peer
    async fn find_descriptor(&self, space_id: &str) -> Result<SpaceDescriptor> {
        if let Some((descriptor, _)) = self.cached(space_id) {
            return Ok(descriptor);
        }
        if let Some(dir) = self.space_dir(space_id) {
            if let Some(descriptor) = SpaceDescriptor::load_from(&dir)? {
                return Ok(descriptor);
            }
        }

        let peers = self.network.peers().await.context("peer discovery failed")?;
        for peer in &peers {
            match self.network.fetch_space(peer, space_id).await {
                Ok(Some(descriptor)) => {
                    descriptor.verify()?;
                    if descriptor.id != space_id {
                        warn!("Peer {peer} answered for {space_id} with {}", descriptor.id);
                        continue;
                    }
                    debug!("Fetched descriptor of {space_id} from {peer}");
                    return Ok(descriptor);
                }
                Ok(None) => debug!("Peer {peer} does not know space {space_id}"),
                Err(err) => warn!("Failed to fetch {space_id} from {peer}: {err:#}"),
            }
        }
        bail!(
            "space {space_id} is unknown locally and to {} reachable peers",
            peers.len()
        )
    }

    /// Spaces whose store is currently held open
    pub fn open_spaces(&self) -> usize {
        self.spaces.lock().expect("engine space cache poisoned").len()
    }

    fn opened(&self, descriptor: &SpaceDescriptor, store: SpaceStore) -> Result<OpenedSpace> {
        let key = descriptor.read_key()?;
        Ok(OpenedSpace {
            id: descriptor.id.clone(),
            descriptor: None,
            store: Arc::new(EncryptedStore {
                store: store.clone(),
                key,
                cache: self.spaces.clone(),
            }),
            peers: Arc::new(NetworkPeers {
                network: self.network.clone(),
            }),
            replicator: Some(Arc::new(Replicator::new(store, self.network.clone()))),
        })
    }
}

#[async_trait]
impl<Net: ExchangeInterface> SyncEngine for LocalEngine<Net> {
    fn name(&self) -> &'static str {
        "local"
    }

    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn create_space(&self) -> Result<OpenedSpace> {
        let key = SpaceKey::generate();
        let header = SpaceHeader::new(SPACE_TYPE, &self.peer_id);
        let settings = SpaceSettings {
            metadata: SPACE_TYPE.to_string(),
            operations_prefix: OPERATIONS_PREFIX.to_string(),
        };
        let descriptor = SpaceDescriptor::new(header, &key, settings)?;
        let store = self.open_store(&descriptor)?;
        info!("Created space {}", descriptor.id);

        let mut opened = self.opened(&descriptor, store)?;
        opened.descriptor = Some(descriptor);
        Ok(opened)
    }

    async fn open_space(&self, space_id: &str) -> Result<OpenedSpace> {
        let descriptor = self.find_descriptor(space_id).await?;
        let store = self.open_store(&descriptor)?;
        let replicator = Replicator::new(store.clone(), self.network.clone());
        // A failed bootstrap is not fatal: the poller keeps pulling
        if let Err(err) = replicator.bootstrap().await {
            warn!("Bootstrap of {space_id} failed: {err:#}");
        }
        info!("Opened space {space_id}");
        self.opened(&descriptor, store)
    }
}

/// Store adapter sealing every value with the space read key
struct EncryptedStore {
    store: SpaceStore,
    key: SpaceKey,
    cache: StoreCache,
}

impl KvStore for EncryptedStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let sealed = self.key.encrypt(value)?;
        self.store.write().put(key.to_string(), sealed)?;
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
        self.key.decrypt(&entry.value)
    }

    fn value_count(&self) -> usize {
        self.store.read().value_count()
    }

    /// Snapshot pending changes and evict the store from the engine cache.
    /// The WAL writer closes once the last handle is dropped.
    fn close(&self) -> Result<()> {
        let space_id = self.store.space_id();
        let persisted = self.store.persist_if_dirty();
        self.cache
            .lock()
            .expect("engine space cache poisoned")
            .remove(&space_id);
        debug!("Released store of {space_id}");
        persisted.map(|_| ())
    }
}

struct NetworkPeers<Net: ExchangeInterface> {
    network: Arc<Net>,
}

#[async_trait]
impl<Net: ExchangeInterface> PeerDirectory for NetworkPeers<Net> {
    async fn peers(&self) -> Result<Vec<PeerId>> {
        self.network.peers().await
    }

    async fn push_descriptor(&self, peer: &PeerId, descriptor: &SpaceDescriptor) -> Result<()> {
        self.network.push_space(peer, descriptor).await
    }
}

#[async_trait]
impl<Net: ExchangeInterface> PeerSync for Replicator<Net> {
    async fn sync_with_peer(&self, peer: &PeerId) -> Result<()> {
        self.sync_with(peer).await
    }
}
