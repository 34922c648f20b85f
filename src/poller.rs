use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::OPERATIONS_PREFIX;
use crate::peer_sync::{opportunistic_sync, SyncPolicy};
use crate::space::Space;
use crate::types::Entry;

/// What every poller of a manager shares.
#[derive(Clone)]
pub(crate) struct PollerSettings {
    pub interval: Duration,
    pub diagnostics: Arc<dyn Diagnostics>,
    pub policy: Arc<dyn SyncPolicy>,
}

pub(crate) struct PollerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the task to stop. An in-flight cycle runs to completion.
    pub fn stop(self) {
        let _ = self.stop.send(true);
        drop(self.task);
    }
}

/// Spawn the change poller for one space. Must run inside a Tokio runtime.
pub(crate) fn spawn(space: Arc<Space>, settings: PollerSettings) -> PollerHandle {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Poller for {} started", space.id);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped.changed() => break,
            }
            if *stopped.borrow() || space.is_closed() {
                break;
            }
            run_cycle(&space, &settings).await;
        }
        debug!("Poller for {} stopped", space.id);
    });
    PollerHandle { stop, task }
}

pub(crate) async fn run_cycle(space: &Space, settings: &PollerSettings) {
    let delivered = scan(space, settings.diagnostics.as_ref());
    if delivered > 0 {
        trace!("Delivered {delivered} operations in {}", space.id);
    }
    opportunistic_sync(space, settings.policy.as_ref(), settings.diagnostics.as_ref()).await;
}

/// One pass over the operations namespace. Fingerprints are recorded before
/// decryption, so an entry that fails to decrypt is never retried.
/// Returns how many payloads were delivered.
pub(crate) fn scan(space: &Space, diagnostics: &dyn Diagnostics) -> usize {
    let mut fresh: Vec<Entry> = Vec::new();
    {
        let mut ledger = space.ledger.lock().expect("dedup ledger poisoned");
        let scanned = space.store.iterate(OPERATIONS_PREFIX, &mut |_key, values| {
            for entry in values {
                if ledger.record(entry.fingerprint()) {
                    fresh.push(entry.clone());
                }
            }
            true
        });
        if let Err(err) = scanned {
            diagnostics.report(Diagnostic::ScanFailed {
                space_id: space.id.clone(),
                error: format!("{err:#}"),
            });
        }
        if ledger.enforce_ceiling() {
            diagnostics.report(Diagnostic::LedgerReset {
                space_id: space.id.clone(),
                resets: ledger.resets(),
            });
        }
    }

    // Deliver outside the store iteration so callbacks may submit
    let mut delivered = 0;
    for entry in fresh {
        match space.store.decrypt(&entry) {
            Ok(payload) => {
                space.deliver(payload, diagnostics);
                delivered += 1;
            }
            Err(err) => diagnostics.report(Diagnostic::DecryptFailed {
                space_id: space.id.clone(),
                fingerprint: entry.fingerprint(),
                error: format!("{err:#}"),
            }),
        }
    }
    delivered
}
