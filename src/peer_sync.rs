use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::descriptor::SpaceDescriptor;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::PeerDirectory;
use crate::space::Space;
use crate::types::PeerId;

/// Decides whether a peer is worth a sync attempt this cycle.
pub trait SyncPolicy: Send + Sync {
    fn should_attempt(&self, space_id: &str, peer: &PeerId) -> bool;

    /// Called after every attempt
    fn record_outcome(&self, space_id: &str, peer: &PeerId, succeeded: bool);
}

/// Try every reachable peer on every cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedInterval;

impl SyncPolicy for FixedInterval {
    fn should_attempt(&self, _space_id: &str, _peer: &PeerId) -> bool {
        true
    }

    fn record_outcome(&self, _space_id: &str, _peer: &PeerId, _succeeded: bool) {}
}

/// Offer a new space's descriptor to reachable peers until one accepts it.
/// Returns the accepting peer.
pub async fn initial_push(peers: &dyn PeerDirectory, descriptor: &SpaceDescriptor) -> Result<PeerId> {
    let candidates = peers.peers().await?;
    if candidates.is_empty() {
        bail!("no peers to push space {} to", descriptor.id);
    }
    for peer in &candidates {
        match peers.push_descriptor(peer, descriptor).await {
            Ok(()) => {
                info!("Space {} accepted by {peer}", descriptor.id);
                return Ok(peer.clone());
            }
            Err(err) => debug!("Peer {peer} refused space {}: {err:#}", descriptor.id),
        }
    }
    bail!(
        "none of {} peers accepted space {}",
        candidates.len(),
        descriptor.id
    )
}

/// Refresh the peer count and try one sync round with each reachable peer.
/// Failures are reported and left for the next cycle.
pub(crate) async fn opportunistic_sync(
    space: &Space,
    policy: &dyn SyncPolicy,
    diagnostics: &dyn Diagnostics,
) {
    let peers = match space.peers.peers().await {
        Ok(peers) => peers,
        Err(err) => {
            space.record_peer_count(0);
            diagnostics.report(Diagnostic::PeerDiscoveryFailed {
                space_id: space.id.clone(),
                error: format!("{err:#}"),
            });
            return;
        }
    };
    space.record_peer_count(peers.len());

    let Some(replicator) = &space.replicator else {
        return;
    };
    let mut synced = false;
    for peer in &peers {
        if !policy.should_attempt(&space.id, peer) {
            continue;
        }
        match replicator.sync_with_peer(peer).await {
            Ok(()) => {
                policy.record_outcome(&space.id, peer, true);
                synced = true;
            }
            Err(err) => {
                policy.record_outcome(&space.id, peer, false);
                diagnostics.report(Diagnostic::PeerSyncFailed {
                    space_id: space.id.clone(),
                    peer: peer.clone(),
                    error: format!("{err:#}"),
                });
            }
        }
    }
    if synced {
        space.record_sync(Utc::now().timestamp_millis());
    }
}
