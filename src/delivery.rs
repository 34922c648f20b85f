use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Push target for delivered operations. Invoked from the poller task.
pub type OperationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// FIFO of delivered payloads waiting for the host.
///
/// With a capacity set, a push onto a full queue evicts the oldest pending
/// payload and counts it as dropped.
#[derive(Debug)]
pub struct EventQueue {
    items: VecDeque<Vec<u8>>,
    capacity: Option<usize>,
    dropped: u64,
}

impl EventQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.map(|c| c.max(1)),
            dropped: 0,
        }
    }

    /// Returns the evicted payload, if the push overflowed
    pub fn push(&mut self, payload: Vec<u8>) -> Option<Vec<u8>> {
        let evicted = match self.capacity {
            Some(capacity) if self.items.len() >= capacity => {
                self.dropped += 1;
                self.items.pop_front()
            }
            _ => None,
        };
        self.items.push_back(payload);
        evicted
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// At most one callback per space.
#[derive(Default)]
pub struct CallbackSlot {
    target: Mutex<Option<OperationCallback>>,
}

impl CallbackSlot {
    /// Install (or with `None`, remove) the target; returns the previous one
    pub fn replace(&self, target: Option<OperationCallback>) -> Option<OperationCallback> {
        std::mem::replace(&mut *self.target.lock().expect("callback slot poisoned"), target)
    }

    /// Current target. Cloned out so the lock is not held during the call.
    pub fn current(&self) -> Option<OperationCallback> {
        self.target.lock().expect("callback slot poisoned").clone()
    }
}
