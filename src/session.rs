//! Space session manager: the host-facing entry point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::delivery::OperationCallback;
use crate::diagnostics::{Diagnostic, Diagnostics, TracingDiagnostics};
use crate::engine::SyncEngine;
use crate::error::{SpaceError, SpaceResult};
use crate::peer_sync::{initial_push, FixedInterval, SyncPolicy};
use crate::poller::{self, PollerSettings};
use crate::space::{OpenedBy, Space, SpaceStatus};
use crate::types::{PeerId, SpaceId};

/// Owns every open space of one replica.
///
/// All methods may be called from any thread. `start_listening` spawns a
/// task and therefore needs a Tokio runtime context.
pub struct SpaceSessionManager {
    engine: Arc<dyn SyncEngine>,
    config: Config,
    diagnostics: Arc<dyn Diagnostics>,
    policy: Arc<dyn SyncPolicy>,
    spaces: Mutex<HashMap<SpaceId, Arc<Space>>>,
    /// Most recently opened space, reported by `status`
    current: Mutex<Option<SpaceId>>,
}

impl SpaceSessionManager {
    pub fn new(engine: Arc<dyn SyncEngine>, config: Config) -> Self {
        Self {
            engine,
            config,
            diagnostics: Arc::new(TracingDiagnostics),
            policy: Arc::new(FixedInterval),
            spaces: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn SyncPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        self.engine.peer_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn spaces(&self) -> MutexGuard<'_, HashMap<SpaceId, Arc<Space>>> {
        self.spaces.lock().expect("space map poisoned")
    }

    fn space(&self, space_id: &str) -> SpaceResult<Arc<Space>> {
        self.spaces()
            .get(space_id)
            .cloned()
            .ok_or_else(|| SpaceError::UnknownSpace(space_id.to_string()))
    }

    fn register(&self, space: Arc<Space>) {
        let id = space.id.clone();
        self.spaces().insert(id.clone(), space);
        *self.current.lock().expect("current space poisoned") = Some(id);
    }

    /// Allocate a new space and open it. The descriptor is pushed to the
    /// first peer that accepts it; a failed push only produces a diagnostic.
    pub async fn create_space(&self) -> SpaceResult<SpaceId> {
        let mut opened = self.engine.create_space().await?;
        let descriptor = opened.descriptor.take();
        let space = Arc::new(Space::new(opened, OpenedBy::Creating, &self.config));

        if let Some(descriptor) = descriptor {
            if let Err(err) = initial_push(space.peers.as_ref(), &descriptor).await {
                self.diagnostics.report(Diagnostic::InitialPushFailed {
                    space_id: space.id.clone(),
                    error: format!("{err:#}"),
                });
            }
        }

        let id = space.id.clone();
        self.register(space);
        info!("Space {id} created via {} engine", self.engine.name());
        Ok(id)
    }

    /// Open an existing space. Joining a space that is already open is a
    /// no-op.
    pub async fn join_space(&self, space_id: &str) -> SpaceResult<()> {
        if self.spaces().contains_key(space_id) {
            debug!("Space {space_id} already open");
            return Ok(());
        }

        let opened = self.engine.open_space(space_id).await?;
        let space = Arc::new(Space::new(opened, OpenedBy::Joining, &self.config));
        {
            let mut spaces = self.spaces();
            // Lost a race with a concurrent join of the same id
            if spaces.contains_key(space_id) {
                return Ok(());
            }
            spaces.insert(space_id.to_string(), space);
        }
        *self.current.lock().expect("current space poisoned") = Some(space_id.to_string());
        info!("Joined space {space_id}");
        Ok(())
    }

    /// Stop polling, release the store and drop undelivered events.
    pub fn close_space(&self, space_id: &str) -> SpaceResult<()> {
        let space = self
            .spaces()
            .remove(space_id)
            .ok_or_else(|| SpaceError::UnknownSpace(space_id.to_string()))?;
        {
            let mut current = self.current.lock().expect("current space poisoned");
            if current.as_deref() == Some(space_id) {
                *current = None;
            }
        }
        space.close()?;
        info!("Closed space {space_id}");
        Ok(())
    }

    pub fn shutdown(&self) {
        let spaces: Vec<Arc<Space>> = self.spaces().drain().map(|(_, space)| space).collect();
        *self.current.lock().expect("current space poisoned") = None;
        for space in spaces {
            if let Err(err) = space.close() {
                warn!("Failed to close space {}: {err}", space.id);
            }
        }
    }

    /// Append an operation. Rejected without touching the store unless the
    /// payload is well-formed JSON.
    pub fn submit_operation(&self, space_id: &str, payload: impl AsRef<[u8]>) -> SpaceResult<()> {
        self.space(space_id)?.submit(payload.as_ref())
    }

    pub fn start_listening(&self, space_id: &str) -> SpaceResult<()> {
        let space = self.space(space_id)?;
        let settings = self.poller_settings();
        space.start_listening(|space| poller::spawn(space, settings))
    }

    /// Oldest undelivered operation, without blocking
    pub fn retrieve_next(&self, space_id: &str) -> SpaceResult<Option<Vec<u8>>> {
        self.space(space_id)?.retrieve_next()
    }

    /// Replace the space's callback. The queue keeps filling regardless.
    pub fn register_callback(&self, space_id: &str, target: OperationCallback) -> SpaceResult<()> {
        self.space(space_id)?.set_callback(Some(target))
    }

    pub fn clear_callback(&self, space_id: &str) -> SpaceResult<()> {
        self.space(space_id)?.set_callback(None)
    }

    pub fn backlog(&self, space_id: &str) -> SpaceResult<usize> {
        self.space(space_id)?.backlog()
    }

    pub fn space_status(&self, space_id: &str) -> SpaceResult<SpaceStatus> {
        Ok(self.space(space_id)?.status())
    }

    /// Status of the most recently opened space
    pub fn status(&self) -> Option<SpaceStatus> {
        let current = self.current.lock().expect("current space poisoned").clone()?;
        self.space_status(&current).ok()
    }

    pub fn space_ids(&self) -> Vec<SpaceId> {
        let mut ids: Vec<SpaceId> = self.spaces().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub(crate) fn handle(&self, space_id: &str) -> SpaceResult<Arc<Space>> {
        self.space(space_id)
    }

    pub(crate) fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            interval: self.config.poll_interval(),
            diagnostics: self.diagnostics.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl Drop for SpaceSessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
