use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::delivery::{CallbackSlot, EventQueue, OperationCallback};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::{KvStore, OpenedSpace, PeerDirectory, PeerSync, OPERATIONS_PREFIX};
use crate::error::{SpaceError, SpaceResult};
use crate::ledger::DedupLedger;
use crate::poller::PollerHandle;
use crate::types::SpaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OpenedBy {
    Creating,
    Joining,
}

/// `Open -> Running -> Closed`; nothing leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Lifecycle {
    Open(OpenedBy),
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
struct SyncStatus {
    peer_count: usize,
    last_sync_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceStatus {
    pub space_id: SpaceId,
    pub state: Lifecycle,
    pub peer_count: usize,
    /// Zero until the first successful peer sync
    pub last_sync_millis: i64,
    pub queue_depth: usize,
    pub dropped_events: u64,
}

/// One open space and everything delivery needs for it. Each piece of
/// mutable state sits behind its own lock.
pub(crate) struct Space {
    pub(crate) id: SpaceId,
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) peers: Arc<dyn PeerDirectory>,
    pub(crate) replicator: Option<Arc<dyn PeerSync>>,
    lifecycle: Mutex<Lifecycle>,
    pub(crate) ledger: Mutex<DedupLedger>,
    queue: Mutex<EventQueue>,
    callback: CallbackSlot,
    sync_status: Mutex<SyncStatus>,
    poller: Mutex<Option<PollerHandle>>,
}

impl Space {
    pub(crate) fn new(opened: OpenedSpace, opened_by: OpenedBy, config: &Config) -> Self {
        Self {
            id: opened.id,
            store: opened.store,
            peers: opened.peers,
            replicator: opened.replicator,
            lifecycle: Mutex::new(Lifecycle::Open(opened_by)),
            ledger: Mutex::new(DedupLedger::new(config.ledger_ceiling)),
            queue: Mutex::new(EventQueue::new(config.queue_capacity)),
            callback: CallbackSlot::default(),
            sync_status: Mutex::new(SyncStatus::default()),
            poller: Mutex::new(None),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().expect("space lifecycle poisoned")
    }

    fn queue(&self) -> MutexGuard<'_, EventQueue> {
        self.queue.lock().expect("event queue poisoned")
    }

    fn sync_status(&self) -> MutexGuard<'_, SyncStatus> {
        self.sync_status.lock().expect("sync status poisoned")
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.lifecycle() == Lifecycle::Closed
    }

    fn ensure_open(&self) -> SpaceResult<()> {
        if self.is_closed() {
            return Err(SpaceError::Closed(self.id.clone()));
        }
        Ok(())
    }

    /// Store a host operation under a fresh key. Nothing is written unless
    /// the payload parses as JSON.
    pub(crate) fn submit(&self, payload: &[u8]) -> SpaceResult<()> {
        self.ensure_open()?;
        serde_json::from_slice::<serde::de::IgnoredAny>(payload)?;
        let key = format!("{OPERATIONS_PREFIX}{}", Uuid::now_v7());
        self.store.set(&key, payload)?;
        Ok(())
    }

    /// Start the poller unless one is already running.
    pub(crate) fn start_listening(
        self: &Arc<Self>,
        spawn: impl FnOnce(Arc<Self>) -> PollerHandle,
    ) -> SpaceResult<()> {
        let mut lifecycle = self.lifecycle();
        if *lifecycle == Lifecycle::Closed {
            return Err(SpaceError::Closed(self.id.clone()));
        }
        let mut poller = self.poller.lock().expect("poller slot poisoned");
        if poller.is_none() {
            *poller = Some(spawn(self.clone()));
            *lifecycle = Lifecycle::Running;
        }
        Ok(())
    }

    /// Stop polling and release the store. Pending events are discarded.
    pub(crate) fn close(&self) -> SpaceResult<()> {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
            if let Some(poller) = self.poller.lock().expect("poller slot poisoned").take() {
                poller.stop();
            }
        }
        self.callback.replace(None);
        self.queue().clear();
        self.store.close()?;
        Ok(())
    }

    pub(crate) fn retrieve_next(&self) -> SpaceResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.queue().pop())
    }

    pub(crate) fn set_callback(&self, target: Option<OperationCallback>) -> SpaceResult<()> {
        self.ensure_open()?;
        self.callback.replace(target);
        Ok(())
    }

    pub(crate) fn backlog(&self) -> SpaceResult<usize> {
        self.ensure_open()?;
        Ok(self.queue().len())
    }

    /// Offer a decrypted payload to the queue and, if one is registered,
    /// the callback. A panicking callback is reported and swallowed.
    pub(crate) fn deliver(&self, payload: Vec<u8>, diagnostics: &dyn Diagnostics) {
        if self.is_closed() {
            return;
        }
        let callback = self.callback.current();
        let overflow = {
            let mut queue = self.queue();
            queue.push(payload.clone()).map(|_| queue.dropped())
        };
        if let Some(dropped_total) = overflow {
            diagnostics.report(Diagnostic::QueueOverflow {
                space_id: self.id.clone(),
                dropped_total,
            });
        }

        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(&payload))).is_err() {
                diagnostics.report(Diagnostic::CallbackPanicked {
                    space_id: self.id.clone(),
                });
            }
        }
    }

    pub(crate) fn record_peer_count(&self, peer_count: usize) {
        self.sync_status().peer_count = peer_count;
    }

    pub(crate) fn record_sync(&self, at_millis: i64) {
        self.sync_status().last_sync_millis = at_millis;
    }

    pub(crate) fn status(&self) -> SpaceStatus {
        let sync = *self.sync_status();
        let (queue_depth, dropped_events) = {
            let queue = self.queue();
            (queue.len(), queue.dropped())
        };
        SpaceStatus {
            space_id: self.id.clone(),
            state: *self.lifecycle(),
            peer_count: sync.peer_count,
            last_sync_millis: sync.last_sync_millis,
            queue_depth,
            dropped_events,
        }
    }
}
