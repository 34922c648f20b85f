//! Observation channel for failures the host never sees.

use tracing::{debug, info, warn};

use crate::types::{Fingerprint, PeerId, SpaceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    ScanFailed {
        space_id: SpaceId,
        error: String,
    },
    DecryptFailed {
        space_id: SpaceId,
        fingerprint: Fingerprint,
        error: String,
    },
    PeerDiscoveryFailed {
        space_id: SpaceId,
        error: String,
    },
    PeerSyncFailed {
        space_id: SpaceId,
        peer: PeerId,
        error: String,
    },
    InitialPushFailed {
        space_id: SpaceId,
        error: String,
    },
    QueueOverflow {
        space_id: SpaceId,
        dropped_total: u64,
    },
    LedgerReset {
        space_id: SpaceId,
        resets: u64,
    },
    CallbackPanicked {
        space_id: SpaceId,
    },
}

/// Sink for poller-internal failures.
pub trait Diagnostics: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Default sink: one `tracing` event per diagnostic.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::ScanFailed { space_id, error } => {
                warn!(space = %space_id, "Store scan failed: {error}")
            }
            Diagnostic::DecryptFailed {
                space_id,
                fingerprint,
                error,
            } => warn!(space = %space_id, %fingerprint, "Dropping undecryptable entry: {error}"),
            Diagnostic::PeerDiscoveryFailed { space_id, error } => {
                debug!(space = %space_id, "Peer discovery failed: {error}")
            }
            Diagnostic::PeerSyncFailed {
                space_id,
                peer,
                error,
            } => debug!(space = %space_id, %peer, "Peer sync failed: {error}"),
            Diagnostic::InitialPushFailed { space_id, error } => {
                warn!(space = %space_id, "Initial push failed: {error}")
            }
            Diagnostic::QueueOverflow {
                space_id,
                dropped_total,
            } => warn!(space = %space_id, dropped_total, "Event queue full, dropped oldest"),
            Diagnostic::LedgerReset { space_id, resets } => {
                info!(space = %space_id, resets, "Dedup ledger reset")
            }
            Diagnostic::CallbackPanicked { space_id } => {
                warn!(space = %space_id, "Operation callback panicked")
            }
        }
    }
}
