use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::{sleep, Instant};

use crate::config::Config;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::{KvStore, NoPeers, OpenedSpace};
use crate::store::SpaceStore;
use crate::types::Entry;

mod end_to_end;
mod session;

/// Diagnostics sink that keeps everything it is told
#[derive(Default)]
pub(crate) struct RecordingDiagnostics {
    events: Mutex<Vec<Diagnostic>>,
}

impl Diagnostics for RecordingDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        self.events.lock().unwrap().push(diagnostic);
    }
}

impl RecordingDiagnostics {
    pub(crate) fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, matches: impl Fn(&Diagnostic) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|d| matches(d)).count()
    }
}

pub(crate) fn fast_config() -> Config {
    Config {
        poll_interval_ms: 10,
        ..Config::default()
    }
}

/// Poll `probe` every few milliseconds until it yields a value or 5s pass
pub(crate) async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Unencrypted store whose values starting with 0xFF refuse to decrypt
pub(crate) struct GarbledStore {
    pub(crate) store: SpaceStore,
}

pub(crate) const GARBLED: u8 = 0xff;

impl KvStore for GarbledStore {
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
        if entry.value.first() == Some(&GARBLED) {
            bail!("authentication tag mismatch");
        }
        Ok(entry.value.clone())
    }

    fn value_count(&self) -> usize {
        self.store.read().value_count()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn garbled_space(space_id: &str, store: SpaceStore) -> OpenedSpace {
    OpenedSpace {
        id: space_id.to_string(),
        descriptor: None,
        store: Arc::new(GarbledStore { store }),
        peers: Arc::new(NoPeers),
        replicator: None,
    }
}
