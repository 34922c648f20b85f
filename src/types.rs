use std::{cmp::Ordering, collections::VecDeque, fmt};

use serde::{Deserialize, Serialize};

/// Identity of a replica writing into a space.
pub type PeerId = String;

/// Identity of a replicated space.
pub type SpaceId = String;

/// Peer state tracking - per-writer log bucket plus exchange progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PeerState {
    /// Local acknowledgment: we've consumed this peer's log up to this sequence
    pub local_ack: u64,

    /// Peer acknowledgment: this peer has consumed our log up to this sequence
    pub peer_ack: u64,

    /// Log entries written by this peer
    pub log: VecDeque<Entry>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: Entry, max_entries: usize) {
        self.log.push_back(entry);
        while self.log.len() > max_entries {
            self.log.pop_front();
        }
    }

    /// Timestamp of the newest entry still held in this peer's log
    pub fn last_timestamp(&self) -> Option<i64> {
        self.log.back().map(|entry| entry.meta.timestamp)
    }
}

/// One value written under a key by one peer. Values are opaque (encrypted
/// by the engine before they reach the store).
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub meta: Metadata,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("value_len", &self.value.len())
            .field("meta", &self.meta)
            .finish()
    }
}

impl Entry {
    pub fn new(key: String, value: Vec<u8>, meta: Metadata) -> Self {
        Self { key, value, meta }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.meta.peer.clone(), self.meta.timestamp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Metadata {
    pub peer: PeerId,
    pub seq: u64,
    /// Logical timestamp in milliseconds, strictly increasing per writer
    pub timestamp: i64,
}

impl Metadata {
    pub fn new(peer: impl Into<PeerId>, seq: u64, timestamp: i64) -> Self {
        Self {
            peer: peer.into(),
            seq,
            timestamp,
        }
    }
}

impl PartialOrd for Metadata {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Metadata {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.peer.cmp(&other.peer))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Compare two writes by the same peer to the same key (last write wins)
pub fn compare_entries(entry1: &Entry, entry2: &Entry) -> Ordering {
    entry1.meta.cmp(&entry2.meta)
}

/// Identifies one durable write for delivery dedup: who wrote it and when.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub peer: PeerId,
    pub timestamp: i64,
}

impl Fingerprint {
    pub fn new(peer: impl Into<PeerId>, timestamp: i64) -> Self {
        Self {
            peer: peer.into(),
            timestamp,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer, self.timestamp)
    }
}
