//! A relay node: hosts replicas of any number of spaces and answers log
//! exchanges for them. Clients never talk to each other directly; they
//! converge by exchanging with the same relay.

use crate::descriptor::SpaceDescriptor;
use crate::exchange::{respond_to_sync, SyncMessage, SyncResponse};
use crate::store::{SpaceStore, StoreStatus};
use crate::types::{PeerId, SpaceId};
use anyhow::{bail, Result};
use fs_err as fs;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

struct RelaySpace {
    descriptor: SpaceDescriptor,
    store: SpaceStore,
}

pub struct Relay {
    id: PeerId,
    network_id: String,
    data_dir: Option<PathBuf>,
    spaces: RwLock<HashMap<SpaceId, RelaySpace>>,
}

impl Relay {
    /// Memory-only relay
    pub fn new(id: impl Into<PeerId>, network_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            network_id: network_id.into(),
            data_dir: None,
            spaces: RwLock::new(HashMap::new()),
        }
    }

    /// Relay persisting each space under `data_dir/<space id>/`. Spaces
    /// found there are reopened.
    pub fn open(
        id: impl Into<PeerId>,
        network_id: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let id = id.into();
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let mut spaces = HashMap::new();
        for dir_entry in fs::read_dir(&data_dir)? {
            let path = dir_entry?.path();
            if !path.is_dir() {
                continue;
            }
            match SpaceDescriptor::load_from(&path) {
                Ok(Some(descriptor)) => {
                    let store = SpaceStore::open_persistent(&descriptor.id, &id, &path)?;
                    spaces.insert(descriptor.id.clone(), RelaySpace { descriptor, store });
                }
                Ok(None) => {}
                Err(err) => warn!("Skipping {}: {err:#}", path.display()),
            }
        }
        info!("Relay {id} loaded {} spaces", spaces.len());

        Ok(Self {
            id,
            network_id: network_id.into(),
            data_dir: Some(data_dir),
            spaces: RwLock::new(spaces),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Accept a space descriptor. Pushing a space the relay already hosts
    /// is accepted as long as the descriptor is identical.
    pub fn accept_push(&self, descriptor: SpaceDescriptor) -> Result<()> {
        descriptor.verify()?;

        let mut spaces = self.spaces.write().expect("relay spaces poisoned");
        if let Some(existing) = spaces.get(&descriptor.id) {
            if existing.descriptor != descriptor {
                bail!("space {} already exists with a different descriptor", descriptor.id);
            }
            return Ok(());
        }

        let store = match &self.data_dir {
            Some(root) => {
                let dir = root.join(&descriptor.id);
                descriptor.save_to(&dir)?;
                SpaceStore::open_persistent(&descriptor.id, &self.id, dir)?
            }
            None => SpaceStore::new(&descriptor.id, &self.id),
        };
        info!("Relay {} now hosts space {}", self.id, descriptor.id);
        spaces.insert(descriptor.id.clone(), RelaySpace { descriptor, store });
        Ok(())
    }

    pub fn descriptor(&self, space_id: &str) -> Option<SpaceDescriptor> {
        self.spaces
            .read()
            .expect("relay spaces poisoned")
            .get(space_id)
            .map(|space| space.descriptor.clone())
    }

    pub fn handle_sync(&self, msg: SyncMessage) -> Result<SyncResponse> {
        let store = self.store(&msg.space_id)?;
        respond_to_sync(&store, msg)
    }

    fn store(&self, space_id: &str) -> Result<SpaceStore> {
        match self
            .spaces
            .read()
            .expect("relay spaces poisoned")
            .get(space_id)
        {
            Some(space) => Ok(space.store.clone()),
            None => bail!("space {space_id} is not hosted here"),
        }
    }

    /// Snapshot every dirty store; returns how many were written
    pub fn persist_dirty(&self) -> Result<usize> {
        let stores: Vec<SpaceStore> = self
            .spaces
            .read()
            .expect("relay spaces poisoned")
            .values()
            .map(|space| space.store.clone())
            .collect();
        let mut written = 0;
        for store in stores {
            if store.persist_if_dirty()? {
                written += 1;
            }
        }
        Ok(written)
    }

    pub fn space_statuses(&self) -> Vec<StoreStatus> {
        let mut statuses: Vec<StoreStatus> = self
            .spaces
            .read()
            .expect("relay spaces poisoned")
            .values()
            .map(|space| space.store.read().status())
            .collect();
        statuses.sort_by(|a, b| a.space_id.cmp(&b.space_id));
        statuses
    }
}
