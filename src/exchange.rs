use crate::descriptor::SpaceDescriptor;
use crate::relay::Relay;
use crate::store::SpaceStore;
use crate::types::{Entry, PeerId, SpaceId};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Bidirectional sync: sender includes their local_ack AND their new entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub space_id: SpaceId,
    pub sender_id: PeerId,
    /// How far the sender has consumed each writer's log (local_ack)
    pub sender_ack: HashMap<PeerId, u64>,
    /// Sender's own log entries the receiver hasn't acknowledged
    pub entries: Vec<Entry>,
}

/// Log exchange response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub peer_id: PeerId,
    pub entries: Vec<Entry>,
    /// Responder's local_ack for each writer
    pub progress: HashMap<PeerId, u64>,
    /// Entries are a full dump of current values rather than log tails
    pub is_snapshot: bool,
}

/// Transport between replicas and relay nodes.
pub trait ExchangeInterface: Send + Sync + 'static {
    /// Peers currently reachable
    fn peers(&self) -> impl Future<Output = Result<Vec<PeerId>>> + Send;

    fn sync_to(
        &self,
        peer: &PeerId,
        msg: SyncMessage,
    ) -> impl Future<Output = Result<SyncResponse>> + Send;

    /// Offer a space descriptor; `Ok` means the peer accepted it
    fn push_space(
        &self,
        peer: &PeerId,
        descriptor: &SpaceDescriptor,
    ) -> impl Future<Output = Result<()>> + Send;

    /// `Ok(None)` when the peer does not know the space
    fn fetch_space(
        &self,
        peer: &PeerId,
        space_id: &str,
    ) -> impl Future<Output = Result<Option<SpaceDescriptor>>> + Send;
}

/// Answer an incoming log exchange.
///
/// Protocol:
/// - Request contains only the sender's own log entries
/// - sender_ack is both a progress report and the "since" parameter
/// - Response contains entries from ALL writers the sender is missing
#[tracing::instrument(skip(store, msg), fields(from = %msg.sender_id))]
pub fn respond_to_sync(store: &SpaceStore, msg: SyncMessage) -> Result<SyncResponse> {
    let peer_progress = msg.sender_ack.clone();
    let peer_id = msg.sender_id.clone();

    store.write().apply_pushed_entries(msg)?;

    let state = store.read();
    let (entries, is_snapshot) = match state.get_peer_missing_logs(&peer_progress) {
        Some(entries) => {
            debug!(
                "Returning {} incremental log entries to {peer_id}",
                entries.len()
            );
            (entries, false)
        }
        None => {
            let entries = state.kv_to_log_entries();
            info!("Returning snapshot ({} entries) to {peer_id}", entries.len());
            (entries, true)
        }
    };
    let progress = state.get_local_ack();
    let my_id = state.peer_id.clone();
    drop(state);

    // Assume the sender will accept what we return
    let peer_ack = progress.get(&my_id).copied().unwrap_or(0);
    if let Err(err) = store.write().update_peer_ack(&peer_id, peer_ack) {
        warn!("Failed to record ack for {peer_id}: {err:#}");
    }

    Ok(SyncResponse {
        peer_id: my_id,
        entries,
        progress,
        is_snapshot,
    })
}

/// Perform one log exchange with a peer.
///
/// Sends only our own entries the peer hasn't acknowledged plus our
/// local_ack; applies whatever the peer returns.
#[tracing::instrument(skip(store, network), fields(space = %store.space_id()))]
pub async fn sync_to<Net: ExchangeInterface>(
    store: &SpaceStore,
    network: &Net,
    peer: &PeerId,
) -> Result<()> {
    let msg = {
        let state = store.read();
        let peer_ack_for_us = state.get_peer_state(peer).map_or(0, |p| p.peer_ack);
        SyncMessage {
            space_id: state.space_id.clone(),
            sender_id: state.peer_id.clone(),
            sender_ack: state.get_local_ack(),
            entries: state
                .get_peer_logs_since(&state.peer_id, peer_ack_for_us)
                .unwrap_or_default(),
        }
    };

    debug!("Sending {} log entries to peer {peer}", msg.entries.len());
    match network.sync_to(peer, msg).await {
        Ok(response) => store.write().apply_pulled_entries(response),
        Err(e) => {
            warn!("Log exchange with peer {peer} failed: {e:#}");
            Err(e)
        }
    }
}

/// Drives log exchange for one local space replica.
pub struct Replicator<Net: ExchangeInterface> {
    store: SpaceStore,
    network: Arc<Net>,
}

impl<Net: ExchangeInterface> Replicator<Net> {
    pub fn new(store: SpaceStore, network: Arc<Net>) -> Self {
        Self { store, network }
    }

    pub async fn sync_with(&self, peer: &PeerId) -> Result<()> {
        sync_to(&self.store, self.network.as_ref(), peer).await
    }

    /// Pull from every reachable peer, then recover next_seq so a writer
    /// whose local state was lost never reuses a sequence number.
    /// Returns how many peers answered.
    pub async fn bootstrap(&self) -> Result<usize> {
        let peers = self.network.peers().await?;
        if peers.is_empty() {
            info!("No peers to bootstrap from, starting fresh");
            return Ok(0);
        }

        info!("Bootstrapping from {} peers...", peers.len());
        let mut success_count = 0;
        for peer in &peers {
            match self.sync_with(peer).await {
                Ok(()) => {
                    success_count += 1;
                    debug!("Bootstrapped from peer {peer}");
                }
                Err(e) => warn!("Failed to bootstrap from peer {peer}: {e:#}"),
            }
        }

        let max_seq_found = self.store.read().max_own_seq();
        if max_seq_found > 0 {
            self.store.write().ensure_next_seq(max_seq_found + 1)?;
        }

        if success_count == 0 {
            warn!("Bootstrap: failed to sync from any peer, proceeding anyway");
        } else {
            info!(
                "Bootstrap: synced from {}/{} peers",
                success_count,
                peers.len()
            );
        }
        Ok(success_count)
    }
}

/// In-process transport: relays addressed by their peer id, with a switch to
/// take any of them offline.
#[derive(Default)]
pub struct MemoryExchange {
    relays: RwLock<BTreeMap<PeerId, Arc<Relay>>>,
    offline: RwLock<HashSet<PeerId>>,
}

impl MemoryExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, relay: Arc<Relay>) {
        self.relays
            .write()
            .expect("relay table poisoned")
            .insert(relay.id().clone(), relay);
    }

    pub fn set_offline(&self, peer: &str, offline: bool) {
        let mut set = self.offline.write().expect("offline set poisoned");
        if offline {
            set.insert(peer.to_string());
        } else {
            set.remove(peer);
        }
    }

    fn relay(&self, peer: &str) -> Result<Arc<Relay>> {
        if self.offline.read().expect("offline set poisoned").contains(peer) {
            return Err(anyhow!("peer {peer} is unreachable"));
        }
        self.relays
            .read()
            .expect("relay table poisoned")
            .get(peer)
            .cloned()
            .ok_or_else(|| anyhow!("unknown peer {peer}"))
    }
}

impl ExchangeInterface for MemoryExchange {
    async fn peers(&self) -> Result<Vec<PeerId>> {
        let offline = self.offline.read().expect("offline set poisoned");
        Ok(self
            .relays
            .read()
            .expect("relay table poisoned")
            .keys()
            .filter(|id| !offline.contains(*id))
            .cloned()
            .collect())
    }

    async fn sync_to(&self, peer: &PeerId, msg: SyncMessage) -> Result<SyncResponse> {
        self.relay(peer)?.handle_sync(msg)
    }

    async fn push_space(&self, peer: &PeerId, descriptor: &SpaceDescriptor) -> Result<()> {
        self.relay(peer)?.accept_push(descriptor.clone())
    }

    async fn fetch_space(&self, peer: &PeerId, space_id: &str) -> Result<Option<SpaceDescriptor>> {
        Ok(self.relay(peer)?.descriptor(space_id))
    }
}
