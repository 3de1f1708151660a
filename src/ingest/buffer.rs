//! Coalescing heartbeat buffer
//!
//! Holds at most one heartbeat per (app name, instance id) between flush
//! cycles. A newer heartbeat for the same pair replaces the older one.
//! [`HeartbeatBuffer::drain_all`] swaps the whole map out under the lock, so
//! a record is delivered to exactly one drain and nothing put before the
//! drain started can be missed by it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{HeartbeatRecord, InstanceKey};

struct Slot {
    seq: u64,
    record: HeartbeatRecord,
}

#[derive(Default)]
struct BufferState {
    entries: HashMap<InstanceKey, Slot>,
    next_seq: u64,
}

/// Thread-safe map of instance identity to latest heartbeat
#[derive(Default)]
pub struct HeartbeatBuffer {
    state: Mutex<BufferState>,
}

impl HeartbeatBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section leaves the map consistent, so a poisoned lock
    // still guards valid data.
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or overwrite the heartbeat for the record's instance
    ///
    /// Returns true if an older heartbeat for the same instance was replaced.
    pub fn put(&self, record: HeartbeatRecord) -> bool {
        let key = record.key();
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(key, Slot { seq, record }).is_some()
    }

    /// Take every buffered heartbeat, leaving the buffer empty
    ///
    /// Records come back in the order of their most recent `put`.
    pub fn drain_all(&self) -> Vec<HeartbeatRecord> {
        let drained = std::mem::take(&mut self.lock().entries);

        let mut slots: Vec<Slot> = drained.into_values().collect();
        slots.sort_unstable_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.record).collect()
    }

    /// Number of distinct instances currently buffered
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
