//! Per-shard mutation journal: an ordered log with a fan-out notifier.
//!
//! Appends assign a strictly monotonic LSN, retain the record in a bounded
//! ring buffer for ad-hoc lookups, and synchronously invoke every registered
//! change callback. Callbacks receive `allow_await = true` when the producing
//! fiber may block for back-pressure.

pub mod dump;
pub mod restore;
pub mod serializer;
pub mod streamer;
pub mod types;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use types::{Entry, JournalItem, Lsn};

/// Ring-buffer capacity, in records.
const RING_CAPACITY: usize = 1024;

/// Fan-out subscriber. The boolean is `allow_await`.
pub type ChangeCallback = std::sync::Arc<dyn Fn(&JournalItem, bool) + Send + Sync>;

pub struct JournalSlice {
    /// LSN of the next record.
    lsn: AtomicU64,
    ring: Mutex<VecDeque<JournalItem>>,
    callbacks: RwLock<Vec<(u32, ChangeCallback)>>,
    next_cb_id: AtomicU32,
    slice_index: u32,
}

impl JournalSlice {
    pub fn new(slice_index: u32) -> Self {
        Self {
            lsn: AtomicU64::new(1),
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            callbacks: RwLock::new(Vec::new()),
            next_cb_id: AtomicU32::new(1),
            slice_index,
        }
    }

    pub fn slice_index(&self) -> u32 {
        self.slice_index
    }

    /// LSN the next appended record will receive.
    pub fn cur_lsn(&self) -> Lsn {
        self.lsn.load(Ordering::Acquire)
    }

    /// Append a record: assign its LSN, retain it in the ring buffer, then
    /// notify every subscriber in registration order.
    pub fn add_log_record(&self, entry: &Entry, allow_await: bool) {
        let lsn = self.lsn.fetch_add(1, Ordering::AcqRel);
        let item = JournalItem {
            lsn,
            opcode: entry.opcode,
            dbid: entry.dbid,
            slot: entry.slot,
            cmd: entry.cmd.clone(),
            data: serializer::serialize_entry(entry),
        };

        {
            let mut ring = self.ring.lock().expect("journal ring lock");
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(item.clone());
        }

        let callbacks = self.callbacks.read().expect("journal callback lock");
        for (_, cb) in callbacks.iter() {
            cb(&item, allow_await);
        }
    }

    pub fn register_on_change(&self, cb: ChangeCallback) -> u32 {
        let id = self.next_cb_id.fetch_add(1, Ordering::AcqRel);
        self.callbacks
            .write()
            .expect("journal callback lock")
            .push((id, cb));
        id
    }

    pub fn unregister_on_change(&self, id: u32) {
        self.callbacks
            .write()
            .expect("journal callback lock")
            .retain(|(cb_id, _)| *cb_id != id);
    }

    pub fn has_registered_callbacks(&self) -> bool {
        !self
            .callbacks
            .read()
            .expect("journal callback lock")
            .is_empty()
    }

    /// Whether the record with `lsn` is still held by the ring buffer.
    pub fn is_lsn_in_buffer(&self, lsn: Lsn) -> bool {
        let ring = self.ring.lock().expect("journal ring lock");
        match (ring.front(), ring.back()) {
            (Some(front), Some(back)) => front.lsn <= lsn && lsn <= back.lsn,
            _ => false,
        }
    }

    /// Serialized record bytes for `lsn`, if buffered.
    pub fn get_entry(&self, lsn: Lsn) -> Option<bytes::Bytes> {
        let ring = self.ring.lock().expect("journal ring lock");
        let front = ring.front()?.lsn;
        if lsn < front {
            return None;
        }
        ring.get((lsn - front) as usize).map(|item| item.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::types::Op;
    use super::*;

    #[test]
    fn lsn_is_strictly_monotonic() {
        let journal = JournalSlice::new(0);
        assert_eq!(journal.cur_lsn(), 1);
        for _ in 0..5 {
            journal.add_log_record(&Entry::select(0), false);
        }
        assert_eq!(journal.cur_lsn(), 6, "next lsn equals appends plus initial");
    }

    #[test]
    fn callbacks_observe_every_record_in_order() {
        let journal = JournalSlice::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let id = journal.register_on_change(Arc::new(move |item, allow_await| {
            assert!(!allow_await);
            seen_cb.lock().unwrap().push(item.lsn);
        }));

        for _ in 0..4 {
            journal.add_log_record(&Entry::noop(), false);
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);

        journal.unregister_on_change(id);
        journal.add_log_record(&Entry::noop(), false);
        assert_eq!(seen.lock().unwrap().len(), 4);
        assert!(!journal.has_registered_callbacks());
    }

    #[test]
    fn ring_buffer_serves_lookups_and_evicts() {
        let journal = JournalSlice::new(0);
        for i in 0..(RING_CAPACITY + 10) {
            journal.add_log_record(
                &Entry::command(i as u64, 0, 1, None, "SET", vec![]),
                false,
            );
        }
        assert!(!journal.is_lsn_in_buffer(5), "old records are evicted");
        let newest = journal.cur_lsn() - 1;
        assert!(journal.is_lsn_in_buffer(newest));

        let data = journal.get_entry(newest).unwrap();
        let parsed = serializer::read_entry(&mut data.as_ref()).unwrap();
        assert_eq!(parsed.opcode, Op::Command);
        assert_eq!(parsed.txid, (RING_CAPACITY + 9) as u64);
    }

    #[test]
    fn multiple_subscribers_all_fire() {
        let journal = JournalSlice::new(0);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            journal.register_on_change(Arc::new(move |_, _| {
                count.fetch_add(1, Ordering::Relaxed);
            }));
        }
        journal.add_log_record(&Entry::noop(), true);
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }
}
