//! The seam between the session core and whatever replicates spaces.
//!
//! The core only ever talks to these traits. [`local::LocalEngine`]
//! replicates through relay nodes; [`loopback::LoopbackEngine`] echoes
//! writes back in-process without any replication.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::descriptor::SpaceDescriptor;
use crate::types::{Entry, PeerId, SpaceId};

pub mod local;
pub mod loopback;

/// Namespace holding host operations inside a space store
pub const OPERATIONS_PREFIX: &str = "ops/";

pub(crate) const SPACE_TYPE: &str = "spacesync.operations";

/// Creates and opens spaces.
#[async_trait]
pub trait SyncEngine: Send + Sync {
    /// Short label used in logs
    fn name(&self) -> &'static str;

    /// This replica's identity inside every space it opens
    fn peer_id(&self) -> &PeerId;

    /// Allocate a new space (identity material included) and open it
    async fn create_space(&self) -> Result<OpenedSpace>;

    /// Open an existing space; fails if it is unknown or unreachable
    async fn open_space(&self, space_id: &str) -> Result<OpenedSpace>;
}

/// Handles for one open space. The session that receives them owns them.
pub struct OpenedSpace {
    pub id: SpaceId,
    /// Public descriptor, present for spaces this replica just created
    pub descriptor: Option<SpaceDescriptor>,
    pub store: Arc<dyn KvStore>,
    pub peers: Arc<dyn PeerDirectory>,
    /// Peer-sync primitive, if this engine replicates at all
    pub replicator: Option<Arc<dyn PeerSync>>,
}

/// Keyed store with opaque (encrypted) values.
pub trait KvStore: Send + Sync {
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Visit each key under `prefix` in key order with the values written
    /// by every contributing peer. The visitor returns `false` to stop.
    fn iterate(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &[Entry]) -> bool)
        -> Result<()>;

    fn decrypt(&self, entry: &Entry) -> Result<Vec<u8>>;

    /// Number of stored values across all keys
    fn value_count(&self) -> usize;

    /// Flush and release. The handle must not be used afterwards.
    fn close(&self) -> Result<()>;
}

/// Who we can currently reach for a space.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn peers(&self) -> Result<Vec<PeerId>>;

    /// `Ok` means the peer accepted the descriptor
    async fn push_descriptor(&self, peer: &PeerId, descriptor: &SpaceDescriptor) -> Result<()>;
}

/// One replication round with one peer.
#[async_trait]
pub trait PeerSync: Send + Sync {
    async fn sync_with_peer(&self, peer: &PeerId) -> Result<()>;
}

/// Directory for engines without peers.
pub struct NoPeers;

#[async_trait]
impl PeerDirectory for NoPeers {
    async fn peers(&self) -> Result<Vec<PeerId>> {
        Ok(Vec::new())
    }

    async fn push_descriptor(&self, peer: &PeerId, _descriptor: &SpaceDescriptor) -> Result<()> {
        anyhow::bail!("no route to peer {peer}")
    }
}
