use crate::types::{Entry, PeerId, PeerState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Atomic state operations - lowest level instructions that mutate CoreState
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateOp {
    /// Record a peer's value for a key (local writes and synced writes alike)
    Set(Entry),

    /// Update peer_ack: peer tells us how far they've consumed our log
    UpdatePeerAck {
        peer_id: PeerId,
        ack_seq: u64,
        monotonic: bool,
    },

    /// Update local_ack: we've consumed this peer's log up to this sequence
    UpdateLocalAck {
        peer_id: PeerId,
        ack_seq: u64,
        monotonic: bool,
    },

    /// Append an entry to the writer's log bucket
    PushPeerLog {
        peer_id: PeerId,
        entry: Entry,
        max_entries: usize,
    },

    /// Increment next_seq
    IncrementSeq,

    /// Raise next_seq to at least this value (sequence recovery)
    SetNextSeq(u64),
}

/// Core state of one space replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreState {
    /// key -> writer -> that writer's latest value for the key
    data: BTreeMap<String, BTreeMap<PeerId, Entry>>,

    /// Every writer we know about, self included
    peers: HashMap<PeerId, PeerState>,

    /// Sequence generator for this replica's own log
    next_seq: u64,
}

impl CoreState {
    pub fn new(peer_id: PeerId) -> Self {
        let mut peers = HashMap::new();
        peers.insert(peer_id, PeerState::new());
        Self {
            data: BTreeMap::new(),
            peers,
            next_seq: 1,
        }
    }

    fn peer_mut(&mut self, peer_id: PeerId) -> &mut PeerState {
        self.peers.entry(peer_id).or_default()
    }

    pub fn is_noop(&self, op: &StateOp) -> bool {
        match op {
            StateOp::Set(entry) => self
                .data
                .get(&entry.key)
                .and_then(|values| values.get(&entry.meta.peer))
                .is_some_and(|existing| existing.meta >= entry.meta),
            StateOp::UpdatePeerAck {
                peer_id,
                ack_seq,
                monotonic,
            } => {
                let Some(peer_state) = self.peers.get(peer_id) else {
                    return false;
                };
                let final_ack_seq = if *monotonic {
                    peer_state.peer_ack.max(*ack_seq)
                } else {
                    *ack_seq
                };
                peer_state.peer_ack == final_ack_seq
            }
            StateOp::UpdateLocalAck {
                peer_id,
                ack_seq,
                monotonic,
            } => {
                let Some(peer_state) = self.peers.get(peer_id) else {
                    return false;
                };
                let final_ack_seq = if *monotonic {
                    peer_state.local_ack.max(*ack_seq)
                } else {
                    *ack_seq
                };
                peer_state.local_ack == final_ack_seq
            }
            StateOp::PushPeerLog { peer_id, entry, .. } => {
                let Some(peer_state) = self.peers.get(peer_id) else {
                    return false;
                };
                entry.meta.seq <= peer_state.local_ack
            }
            StateOp::IncrementSeq => false,
            StateOp::SetNextSeq(seq) => self.next_seq >= *seq,
        }
    }

    /// Execute a state operation - the only way to mutate CoreState
    pub fn execute(&mut self, op: StateOp) {
        match op {
            StateOp::Set(entry) => {
                let values = self.data.entry(entry.key.clone()).or_default();
                match values.get(&entry.meta.peer) {
                    Some(existing) if existing.meta >= entry.meta => {}
                    _ => {
                        values.insert(entry.meta.peer.clone(), entry);
                    }
                }
            }
            StateOp::UpdatePeerAck {
                peer_id,
                ack_seq,
                monotonic,
            } => {
                let peer_state = self.peer_mut(peer_id);
                if monotonic {
                    peer_state.peer_ack = peer_state.peer_ack.max(ack_seq);
                } else {
                    peer_state.peer_ack = ack_seq;
                }
            }
            StateOp::UpdateLocalAck {
                peer_id,
                ack_seq,
                monotonic,
            } => {
                let peer_state = self.peer_mut(peer_id);
                if monotonic {
                    peer_state.local_ack = peer_state.local_ack.max(ack_seq);
                } else {
                    peer_state.local_ack = ack_seq;
                }
            }
            StateOp::PushPeerLog {
                peer_id,
                entry,
                max_entries,
            } => {
                let peer_state = self.peer_mut(peer_id);
                if entry.meta.seq <= peer_state.local_ack {
                    return;
                }
                let seq = entry.meta.seq;
                peer_state.push(entry, max_entries);
                peer_state.local_ack = peer_state.local_ack.max(seq);
            }
            StateOp::IncrementSeq => {
                self.next_seq += 1;
            }
            StateOp::SetNextSeq(seq) => {
                self.next_seq = self.next_seq.max(seq);
            }
        }
    }

    pub fn peers(&self) -> &HashMap<PeerId, PeerState> {
        &self.peers
    }

    pub fn data(&self) -> &BTreeMap<String, BTreeMap<PeerId, Entry>> {
        &self.data
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}
