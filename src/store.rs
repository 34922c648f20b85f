use crate::exchange::{SyncMessage, SyncResponse};
use crate::ops::{CoreState, StateOp};
use crate::types::{Entry, Metadata, PeerId, PeerState, SpaceId};
use crate::wal::WriteAheadLog;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use fs_err::{self as fs, File, OpenOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, trace, warn};

const DEFAULT_MAX_LOG_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub space_id: SpaceId,
    pub peer_id: PeerId,
    pub n_keys: usize,
    pub n_values: usize,
    pub next_seq: u64,
    pub dirty: bool,
    pub wal: bool,
    pub peers: Vec<PeerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: PeerId,
    pub ack: u64,
    pub pack: u64,
    pub logs: usize,
}

/// Mutable state of one space replica, protected by a single RwLock
pub struct StoreState {
    pub space_id: SpaceId,
    pub peer_id: PeerId,

    core: CoreState,

    // Inside the lock so a logged op and its application are atomic
    wal: Option<WriteAheadLog>,

    max_log_entries: usize,

    snapshot_path: Option<PathBuf>,

    /// Unpersisted changes since the last snapshot
    dirty: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    magic: [u8; 4],
    version: u32,
    space_id: SpaceId,
    peer_id: PeerId,
    core: CoreState,
}

impl SnapshotFile {
    const VERSION: u32 = 1;
    const MAGIC: [u8; 4] = *b"SSSN";

    fn from_state(state: &StoreState) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            space_id: state.space_id.clone(),
            peer_id: state.peer_id.clone(),
            core: state.core.clone(),
        }
    }

    fn validate(&self, space_id: &str, peer_id: &str) -> Result<()> {
        if self.magic != Self::MAGIC {
            bail!("Invalid snapshot magic header");
        }
        if self.version != Self::VERSION {
            bail!(
                "Unsupported snapshot version: expected {}, found {}",
                Self::VERSION,
                self.version
            );
        }
        if self.space_id != space_id {
            bail!(
                "Snapshot space mismatch: expected {space_id}, found {}",
                self.space_id
            );
        }
        if self.peer_id != peer_id {
            bail!(
                "Snapshot writer mismatch: expected {peer_id}, found {}",
                self.peer_id
            );
        }
        Ok(())
    }
}

/// Replicated store of one space:
/// - in-memory `key -> writer -> value`, last write wins per (key, writer)
/// - per-writer bucketed logs driving the exchange protocol
/// - optional WAL + snapshot persistence
#[derive(Clone)]
pub struct SpaceStore {
    state: Arc<RwLock<StoreState>>,
}

impl StoreState {
    fn snapshot_path(&self) -> Result<&Path> {
        self.snapshot_path
            .as_deref()
            .ok_or_else(|| anyhow!("Snapshot path not configured"))
    }

    fn load_snapshot_if_exists(&mut self) -> Result<bool> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }

        let mut reader = BufReader::new(File::open(&path)?);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        let (snapshot, _): (SnapshotFile, _) =
            bincode::serde::decode_from_slice(&buf, bincode::config::standard())
                .context("Failed to deserialize snapshot")?;
        snapshot.validate(&self.space_id, &self.peer_id)?;

        self.core = snapshot.core;
        self.dirty = false;
        Ok(true)
    }

    pub fn persist_to_disk(&mut self) -> Result<()> {
        let snapshot_path = self.snapshot_path()?.to_path_buf();
        if let Some(parent) = snapshot_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = snapshot_path.with_extension("snapshot.tmp");
        let encoded = bincode::serde::encode_to_vec(
            SnapshotFile::from_state(self),
            bincode::config::standard(),
        )?;

        {
            let mut writer = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            writer.write_all(&encoded)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &snapshot_path)?;

        if let Some(parent) = snapshot_path.parent() {
            if let Ok(dir_file) = File::open(parent) {
                let _ = dir_file.sync_all();
            }
        }

        if let Some(wal) = self.wal.as_mut() {
            wal.reset()?;
        }

        info!("Persisted snapshot to {:?}", snapshot_path);
        self.dirty = false;
        Ok(())
    }

    /// The only mutation path: WAL first, then apply
    fn execute_ops(&mut self, ops: Vec<StateOp>) -> Result<()> {
        self.execute_ops_impl(ops, true)
    }

    fn execute_ops_impl(&mut self, ops: Vec<StateOp>, write_to_wal: bool) -> Result<()> {
        let ops: Vec<StateOp> = ops
            .into_iter()
            .filter(|op| {
                let noop = self.core.is_noop(op);
                if noop {
                    trace!("Skipping noop op: {op:?}");
                }
                !noop
            })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        if write_to_wal {
            if let Some(wal) = self.wal.as_mut() {
                wal.write_ops(&ops)?;
            }
        }
        for op in ops {
            self.core.execute(op);
        }
        self.dirty = true;
        Ok(())
    }

    fn replay_ops(&mut self, ops: Vec<StateOp>) -> Result<()> {
        self.execute_ops_impl(ops, false)
    }

    /// Apply a write made by another replica. Returns whether it changed the
    /// visible value for its (key, writer) slot.
    pub fn sync(&mut self, entry: Entry) -> Result<bool> {
        debug!(entry.key, "Syncing entry, meta: {:?}", entry.meta);

        let should_update = !self.core.is_noop(&StateOp::Set(entry.clone()));
        let ops = vec![
            StateOp::PushPeerLog {
                peer_id: entry.meta.peer.clone(),
                entry: entry.clone(),
                max_entries: self.max_log_entries,
            },
            StateOp::Set(entry),
        ];
        self.execute_ops(ops)
            .context("Failed to execute ops in sync")?;
        Ok(should_update)
    }

    pub fn update_peer_ack(&mut self, peer_id: &str, ack_seq: u64) -> Result<()> {
        self.execute_ops(vec![StateOp::UpdatePeerAck {
            peer_id: peer_id.to_string(),
            ack_seq,
            monotonic: false,
        }])
    }

    /// Adopt the responder's progress after a snapshot response
    fn update_local_ack(&mut self, progress: &HashMap<PeerId, u64>) -> Result<()> {
        let ops = progress
            .iter()
            .map(|(peer_id, &ack_seq)| StateOp::UpdateLocalAck {
                peer_id: peer_id.clone(),
                ack_seq,
                monotonic: true,
            })
            .collect();
        self.execute_ops(ops)
    }

    pub fn apply_pulled_entries(&mut self, response: SyncResponse) -> Result<()> {
        // Entries first: a snapshot's acks must not get ahead of its data,
        // or PushPeerLog would treat the snapshot entries as already seen.
        let is_snapshot = response.is_snapshot;
        for entry in response.entries {
            self.sync(entry).context("Failed to sync entry")?;
        }
        if is_snapshot {
            debug!("Applied pulled snapshot");
            self.update_local_ack(&response.progress)?;
        }
        let peer_ack = response.progress.get(&self.peer_id).copied().unwrap_or(0);
        self.update_peer_ack(&response.peer_id, peer_ack)?;
        Ok(())
    }

    pub fn apply_pushed_entries(&mut self, message: SyncMessage) -> Result<()> {
        let Some(first) = message.entries.first() else {
            return Ok(());
        };

        let local_ack = self
            .core
            .peers()
            .get(&message.sender_id)
            .map_or(0, |p| p.local_ack);
        let expected_since = local_ack + 1;
        let actual_since = first.meta.seq;
        if actual_since > expected_since {
            warn!(
                sender_id = %message.sender_id,
                expected_since, actual_since, "Received entries with gap"
            );
            return Ok(());
        }

        for entry in message.entries {
            self.sync(entry).context("Failed to sync entry")?;
        }
        Ok(())
    }

    /// Next (seq, timestamp) for a local write. Timestamps never repeat or go
    /// backwards for one writer, even if the wall clock does.
    fn alloc_entry_meta(&self) -> Metadata {
        let last = self
            .core
            .peers()
            .get(&self.peer_id)
            .and_then(PeerState::last_timestamp)
            .unwrap_or(i64::MIN);
        let timestamp = Utc::now().timestamp_millis().max(last.saturating_add(1));
        Metadata::new(self.peer_id.clone(), self.core.next_seq(), timestamp)
    }

    pub fn put(&mut self, key: String, value: impl Into<Vec<u8>>) -> Result<Entry> {
        let meta = self.alloc_entry_meta();
        let entry = Entry::new(key, value.into(), meta);

        let ops = vec![
            StateOp::IncrementSeq,
            StateOp::PushPeerLog {
                peer_id: self.peer_id.clone(),
                entry: entry.clone(),
                max_entries: self.max_log_entries,
            },
            StateOp::Set(entry.clone()),
        ];
        self.execute_ops(ops)?;
        Ok(entry)
    }

    /// Every writer's value for one key, oldest write first
    pub fn get(&self, key: &str) -> Vec<Entry> {
        let mut values: Vec<Entry> = self
            .core
            .data()
            .get(key)
            .map(|values| values.values().cloned().collect())
            .unwrap_or_default();
        values.sort_by(|a, b| a.meta.cmp(&b.meta));
        values
    }

    /// Visit keys under `prefix` in key order with their per-writer values.
    /// The visitor returns `false` to stop early.
    pub fn iterate_prefix<F>(&self, prefix: &str, mut visitor: F)
    where
        F: FnMut(&str, &[Entry]) -> bool,
    {
        for (key, values) in self.core.data().range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            let mut values: Vec<Entry> = values.values().cloned().collect();
            values.sort_by(|a, b| a.meta.cmp(&b.meta));
            if !visitor(key, &values) {
                break;
            }
        }
    }

    /// Number of values stored across all keys
    pub fn value_count(&self) -> usize {
        self.core.data().values().map(|values| values.len()).sum()
    }

    /// Missing log entries for a peer given its progress map.
    /// `None` means the peer needs a full dump.
    pub fn get_peer_missing_logs(&self, peer_progress: &HashMap<PeerId, u64>) -> Option<Vec<Entry>> {
        if peer_progress.is_empty() {
            debug!("Peer has no progress, returning full dump");
            return None;
        }

        let mut missing_entries = Vec::new();

        for (writer, peer_state) in self.core.peers() {
            let peer_ack = peer_progress.get(writer).copied().unwrap_or(0);

            if let Some(oldest_entry) = peer_state.log.front() {
                if peer_ack + 1 < oldest_entry.meta.seq {
                    if writer == &self.peer_id {
                        debug!(
                            %writer,
                            peer_ack,
                            oldest_log = oldest_entry.meta.seq,
                            "Requested own seq has been truncated, need full dump"
                        );
                        return None;
                    }
                    // Truncated bucket of another writer: fall back to that
                    // writer's current values.
                    debug!(
                        %writer,
                        peer_ack,
                        oldest_log = oldest_entry.meta.seq,
                        "Requested writer seq has been truncated, sending current values"
                    );
                    missing_entries.extend(self.values_by_writer_since(writer, peer_ack));
                    continue;
                }
            }

            missing_entries.extend(
                peer_state
                    .log
                    .iter()
                    .filter(|entry| entry.meta.seq > peer_ack)
                    .cloned(),
            );
        }

        Some(missing_entries)
    }

    fn values_by_writer_since(&self, writer: &str, since: u64) -> Vec<Entry> {
        let mut values: Vec<Entry> = self
            .core
            .data()
            .values()
            .filter_map(|values| values.get(writer))
            .filter(|entry| entry.meta.seq > since)
            .cloned()
            .collect();
        values.sort_by_key(|entry| entry.meta.seq);
        values
    }

    /// Current values as log entries (full dump)
    pub fn kv_to_log_entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .core
            .data()
            .values()
            .flat_map(|values| values.values().cloned())
            .collect();
        entries.sort_by(|a, b| (&a.meta.peer, a.meta.seq).cmp(&(&b.meta.peer, b.meta.seq)));
        entries
    }

    /// How far we've consumed each writer's log
    pub fn get_local_ack(&self) -> HashMap<PeerId, u64> {
        self.core
            .peers()
            .iter()
            .map(|(id, peer_state)| (id.clone(), peer_state.local_ack))
            .collect()
    }

    pub fn get_peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.core.peers().get(peer_id).cloned()
    }

    pub fn get_peer_logs_since(&self, peer_id: &str, since: u64) -> Option<Vec<Entry>> {
        let log = &self.core.peers().get(peer_id)?.log;
        let since_index = log.iter().position(|entry| entry.meta.seq > since)?;
        Some(log.iter().skip(since_index).cloned().collect())
    }

    /// Highest sequence number this writer has in the store, in logs or data
    pub fn max_own_seq(&self) -> u64 {
        let in_logs = self
            .core
            .peers()
            .values()
            .flat_map(|peer_state| peer_state.log.iter())
            .filter(|entry| entry.meta.peer == self.peer_id)
            .map(|entry| entry.meta.seq);
        let in_data = self
            .core
            .data()
            .values()
            .filter_map(|values| values.get(&self.peer_id))
            .map(|entry| entry.meta.seq);
        in_logs.chain(in_data).max().unwrap_or(0)
    }

    /// Raise next_seq so a recovered writer never reuses a sequence number
    pub fn ensure_next_seq(&mut self, min_next_seq: u64) -> Result<()> {
        self.execute_ops(vec![StateOp::SetNextSeq(min_next_seq)])
    }

    pub fn get_next_seq(&self) -> u64 {
        self.core.next_seq()
    }

    fn persist_if_dirty(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.persist_to_disk()?;
        Ok(true)
    }

    pub fn status(&self) -> StoreStatus {
        let peers = self
            .core
            .peers()
            .iter()
            .map(|(peer_id, peer_state)| PeerStatus {
                id: peer_id.clone(),
                ack: peer_state.local_ack,
                pack: peer_state.peer_ack,
                logs: peer_state.log.len(),
            })
            .collect();

        StoreStatus {
            space_id: self.space_id.clone(),
            peer_id: self.peer_id.clone(),
            n_keys: self.core.data().len(),
            n_values: self.value_count(),
            next_seq: self.core.next_seq(),
            dirty: self.dirty,
            wal: self.wal.is_some(),
            peers,
        }
    }
}

impl SpaceStore {
    pub fn new(space_id: impl Into<SpaceId>, peer_id: impl Into<PeerId>) -> Self {
        let peer_id = peer_id.into();
        let state = StoreState {
            space_id: space_id.into(),
            core: CoreState::new(peer_id.clone()),
            peer_id,
            wal: None,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            snapshot_path: None,
            dirty: false,
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Open a store persisted under `dir` (`store.wal` + `store.snapshot`),
    /// recovering whatever a previous run left there.
    pub fn open_persistent<P: Into<PathBuf>>(
        space_id: impl Into<SpaceId>,
        peer_id: impl Into<PeerId>,
        dir: P,
    ) -> Result<Self> {
        let space_id = space_id.into();
        let peer_id = peer_id.into();
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let wal_path = dir.join("store.wal");
        let snapshot_path = dir.join("store.snapshot");

        let wal = WriteAheadLog::new(&wal_path, &space_id, &peer_id)?;
        let existing_ops = wal.read_all_ops()?;

        let mut state = StoreState {
            space_id,
            core: CoreState::new(peer_id.clone()),
            peer_id,
            wal: Some(wal),
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            snapshot_path: Some(snapshot_path.clone()),
            dirty: false,
        };

        if state.load_snapshot_if_exists()? {
            info!("Loaded snapshot from {}", snapshot_path.display());
        }

        if !existing_ops.is_empty() {
            info!(
                "Recovering {} state operations from WAL",
                existing_ops.len()
            );
            state.replay_ops(existing_ops)?;
            debug!("Store status after recovery: {:?}", state.status());
        }

        info!(
            "Persistence enabled: WAL={:?}, snapshot={:?}",
            wal_path, snapshot_path
        );
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
        })
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().expect("Failed to lock store state")
    }

    pub fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().expect("Failed to lock store state")
    }

    pub fn space_id(&self) -> SpaceId {
        self.read().space_id.clone()
    }

    pub fn peer_id(&self) -> PeerId {
        self.read().peer_id.clone()
    }

    /// Persist current state to a snapshot (resets the WAL)
    pub fn persist(&self) -> Result<()> {
        self.write().persist_to_disk()
    }

    pub fn persist_if_dirty(&self) -> Result<bool> {
        let mut state = self.write();
        if state.snapshot_path.is_none() {
            return Ok(false);
        }
        state.persist_if_dirty()
    }
}
