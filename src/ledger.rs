use std::collections::{HashMap, HashSet};

use crate::types::{Fingerprint, PeerId};

pub const DEFAULT_LEDGER_CEILING: usize = 10_000;

/// Fingerprints already delivered for one space.
///
/// When more than `ceiling` fingerprints are held the set is cleared in one
/// step. The largest timestamp seen per peer survives the reset as a
/// high-water mark; anything at or below it still counts as delivered.
#[derive(Debug)]
pub struct DedupLedger {
    seen: HashSet<Fingerprint>,
    high_water: HashMap<PeerId, i64>,
    ceiling: usize,
    resets: u64,
}

impl Default for DedupLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CEILING)
    }
}

impl DedupLedger {
    pub fn new(ceiling: usize) -> Self {
        Self {
            seen: HashSet::new(),
            high_water: HashMap::new(),
            ceiling: ceiling.max(1),
            resets: 0,
        }
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        if self.seen.contains(fingerprint) {
            return true;
        }
        self.high_water
            .get(&fingerprint.peer)
            .is_some_and(|mark| fingerprint.timestamp <= *mark)
    }

    /// Record a fingerprint. Returns `false` if it was already delivered.
    pub fn record(&mut self, fingerprint: Fingerprint) -> bool {
        if self.contains(&fingerprint) {
            return false;
        }
        self.seen.insert(fingerprint);
        true
    }

    /// Clear the set if it grew past the ceiling. Returns whether it did.
    pub fn enforce_ceiling(&mut self) -> bool {
        if self.seen.len() <= self.ceiling {
            return false;
        }
        for fingerprint in self.seen.drain() {
            let mark = self
                .high_water
                .entry(fingerprint.peer)
                .or_insert(fingerprint.timestamp);
            *mark = (*mark).max(fingerprint.timestamp);
        }
        self.resets += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(peer: &str, ts: i64) -> Fingerprint {
        Fingerprint::new(peer, ts)
    }

    #[test]
    fn recorded_fingerprint_is_not_recorded_twice() {
        let mut ledger = DedupLedger::new(10);
        assert!(ledger.record(fp("a", 1)));
        assert!(!ledger.record(fp("a", 1)));
        assert!(ledger.record(fp("b", 1)));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn reset_clears_set_but_keeps_high_water() {
        let mut ledger = DedupLedger::new(2);
        ledger.record(fp("a", 5));
        ledger.record(fp("a", 7));
        assert!(!ledger.enforce_ceiling());
        ledger.record(fp("b", 3));
        assert!(ledger.enforce_ceiling());
        assert!(ledger.is_empty());
        assert_eq!(ledger.resets(), 1);

        assert!(ledger.contains(&fp("a", 6)));
        assert!(ledger.contains(&fp("b", 3)));
        assert!(!ledger.contains(&fp("a", 8)));
        assert!(!ledger.contains(&fp("c", 1)));
    }

    #[test]
    fn older_fingerprint_counts_as_delivered_after_reset() {
        let mut ledger = DedupLedger::new(1);
        ledger.record(fp("a", 10));
        ledger.record(fp("a", 20));
        ledger.enforce_ceiling();
        // A writer's log replicates in order, so anything older was scanned
        assert!(!ledger.record(fp("a", 15)));
        assert!(ledger.record(fp("a", 21)));
    }
}
