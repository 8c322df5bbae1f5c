//! Coalescing of in-flight tiered disk operations.
//!
//! Every operation is keyed by an `EntryId`. Concurrent reads of the same
//! segment attach continuations to one record so a single disk read fires;
//! stash records pin their bytes until the write completes; deletes observed
//! while a read is in flight are postponed to its completion.

use std::collections::HashMap;

use bytes::Bytes;

use crate::table::DbIndex;
use crate::tiered::disk::{DiskSegment, IoCompletion, PageStore};
use crate::tiered::small_bins::{BinId, FRAGMENTED_BIN};

/// Identifier of a pending operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntryId {
    Key(DbIndex, Bytes),
    Bin(BinId),
}

impl EntryId {
    pub fn is_fragmented_bin(&self) -> bool {
        matches!(self, EntryId::Bin(FRAGMENTED_BIN))
    }
}

/// Value handed to read continuations.
pub enum ReadOutcome<'a> {
    /// `is_raw` is false once an earlier continuation modified the bytes.
    Ok { is_raw: bool, value: &'a mut Vec<u8> },
    Err(&'a std::io::Error),
}

/// A read continuation; returns true when it modified the value.
pub type ReadCallback = Box<dyn FnOnce(ReadOutcome<'_>) -> bool + Send>;

/// Decision returned by the delete listener.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOutcome {
    /// Release the containing page run.
    pub release: bool,
    /// Issue a defragmentation read of this page.
    pub defrag: Option<DiskSegment>,
}

/// Shard-side handler of operation completions.
pub trait OpListener {
    fn on_stashed(&mut self, id: &EntryId, result: std::io::Result<DiskSegment>);

    /// Returns true when the entry's disk segment should be reclaimed
    /// because the value moved back to memory.
    fn on_fetched(
        &mut self,
        id: &EntryId,
        value: &mut Vec<u8>,
        segment: DiskSegment,
        modified: bool,
    ) -> bool;

    fn on_deleted(&mut self, segment: DiskSegment) -> DeleteOutcome;
}

struct StashOp {
    id: EntryId,
    segment: DiskSegment,
    /// Pinned until completion.
    #[allow(dead_code)]
    bytes: Bytes,
    cancelled: bool,
}

struct PendingEntry {
    id: EntryId,
    segment: DiskSegment,
    callbacks: Vec<ReadCallback>,
    delete_requested: bool,
}

struct ReadOp {
    page: DiskSegment,
    entries: Vec<PendingEntry>,
    /// Free the page run once the read completes.
    deferred_free: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OpStats {
    pub pending_read_cnt: usize,
    pub pending_stash_cnt: usize,
}

#[derive(Default)]
pub struct OpManager {
    next_token: u64,
    stashes: HashMap<u64, StashOp>,
    stash_tokens: HashMap<EntryId, u64>,
    reads: HashMap<u64 /* page offset */, ReadOp>,
    read_tokens: HashMap<u64, u64 /* page offset */>,
}

impl OpManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> OpStats {
        OpStats {
            pending_read_cnt: self.reads.len(),
            pending_stash_cnt: self.stashes.len(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.stashes.is_empty() || !self.reads.is_empty()
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Allocate a segment and issue the write. The bytes are pinned until the
    /// completion is processed.
    pub fn stash(
        &mut self,
        id: EntryId,
        bytes: Bytes,
        store: &mut PageStore,
    ) -> anyhow::Result<DiskSegment> {
        debug_assert!(!self.stash_tokens.contains_key(&id), "stash already pending");
        let segment = store
            .allocate(bytes.len())
            .ok_or_else(|| anyhow::anyhow!("tiered file overflow"))?;
        let token = self.token();
        store.submit_write(token, segment.offset, bytes.clone());
        self.stash_tokens.insert(id.clone(), token);
        self.stashes.insert(
            token,
            StashOp {
                id,
                segment,
                bytes,
                cancelled: false,
            },
        );
        Ok(segment)
    }

    /// Cancel a stash that has not been reported yet. The disk write may
    /// still land; its pages are reclaimed silently on completion.
    pub fn cancel_stash(&mut self, id: &EntryId) {
        if let Some(token) = self.stash_tokens.remove(id) {
            if let Some(stash) = self.stashes.get_mut(&token) {
                stash.cancelled = true;
            }
        }
    }

    /// Attach a continuation to the (possibly already pending) read covering
    /// `segment`. A single page-run read is issued per containing page run.
    pub fn enqueue_read(
        &mut self,
        id: EntryId,
        segment: DiskSegment,
        cb: ReadCallback,
        store: &PageStore,
    ) {
        let page = segment.containing_pages();
        if let Some(op) = self.reads.get_mut(&page.offset) {
            if let Some(entry) = op.entries.iter_mut().find(|e| e.segment == segment) {
                entry.callbacks.push(cb);
            } else {
                op.entries.push(PendingEntry {
                    id,
                    segment,
                    callbacks: vec![cb],
                    delete_requested: false,
                });
            }
            return;
        }

        let token = self.token();
        store.submit_read(token, page);
        self.read_tokens.insert(token, page.offset);
        self.reads.insert(
            page.offset,
            ReadOp {
                page,
                entries: vec![PendingEntry {
                    id,
                    segment,
                    callbacks: vec![cb],
                    delete_requested: false,
                }],
                deferred_free: false,
            },
        );
    }

    /// Handle a segment-level delete. If a read of the segment is in flight
    /// the delete is postponed to its completion; otherwise `on_deleted`
    /// decides whether the page run is released, and may request a defrag
    /// read (returned for the caller to enqueue).
    pub fn delete_offloaded(
        &mut self,
        segment: DiskSegment,
        store: &mut PageStore,
        on_deleted: &mut dyn FnMut(DiskSegment) -> DeleteOutcome,
    ) -> Option<DiskSegment> {
        let page = segment.containing_pages();
        if let Some(op) = self.reads.get_mut(&page.offset) {
            if let Some(entry) = op.entries.iter_mut().find(|e| e.segment == segment) {
                entry.delete_requested = true;
                return None;
            }
        }

        let outcome = on_deleted(segment);
        if outcome.release {
            if let Some(op) = self.reads.get_mut(&page.offset) {
                op.deferred_free = true;
            } else {
                store.mark_free(page);
            }
        }
        outcome.defrag
    }

    /// Apply one I/O completion. Returns defragmentation reads that became
    /// due; the caller enqueues them under the fragmented-bin sentinel.
    pub fn process_completion(
        &mut self,
        completion: IoCompletion,
        store: &mut PageStore,
        listener: &mut dyn OpListener,
    ) -> Vec<DiskSegment> {
        match completion {
            IoCompletion::WriteDone { token, result } => {
                self.finish_stash(token, result, store, listener);
                Vec::new()
            }
            IoCompletion::ReadDone { token, result } => {
                self.finish_read(token, result, store, listener)
            }
        }
    }

    fn finish_stash(
        &mut self,
        token: u64,
        result: std::io::Result<()>,
        store: &mut PageStore,
        listener: &mut dyn OpListener,
    ) {
        let Some(stash) = self.stashes.remove(&token) else {
            tracing::error!(token, "stash completion without a pending record");
            return;
        };
        self.stash_tokens.remove(&stash.id);

        if stash.cancelled {
            store.mark_free(stash.segment);
            return;
        }
        match result {
            Ok(()) => listener.on_stashed(&stash.id, Ok(stash.segment)),
            Err(err) => {
                listener.on_stashed(&stash.id, Err(err));
                store.mark_free(stash.segment);
            }
        }
    }

    fn finish_read(
        &mut self,
        token: u64,
        result: std::io::Result<Vec<u8>>,
        store: &mut PageStore,
        listener: &mut dyn OpListener,
    ) -> Vec<DiskSegment> {
        let Some(page_offset) = self.read_tokens.remove(&token) else {
            tracing::error!(token, "read completion without a pending record");
            return Vec::new();
        };
        let Some(op) = self.reads.remove(&page_offset) else {
            return Vec::new();
        };

        let mut defrags = Vec::new();
        match result {
            Ok(page_bytes) => {
                for entry in op.entries {
                    let rel = (entry.segment.offset - op.page.offset) as usize;
                    let mut value = page_bytes[rel..rel + entry.segment.len as usize].to_vec();

                    let mut modified = false;
                    for cb in entry.callbacks {
                        modified |= cb(ReadOutcome::Ok {
                            is_raw: !modified,
                            value: &mut value,
                        });
                    }
                    let reclaim =
                        listener.on_fetched(&entry.id, &mut value, entry.segment, modified);

                    if entry.id.is_fragmented_bin() {
                        if reclaim {
                            store.mark_free(entry.segment);
                        }
                    } else if reclaim || entry.delete_requested {
                        let outcome = listener.on_deleted(entry.segment);
                        if outcome.release {
                            store.mark_free(entry.segment.containing_pages());
                        }
                        if let Some(page) = outcome.defrag {
                            defrags.push(page);
                        }
                    }
                }
            }
            Err(err) => {
                for entry in op.entries {
                    for cb in entry.callbacks {
                        cb(ReadOutcome::Err(&err));
                    }
                    // A postponed delete still proceeds; the value is gone
                    // regardless of the failed fetch.
                    if entry.delete_requested {
                        let outcome = listener.on_deleted(entry.segment);
                        if outcome.release {
                            store.mark_free(entry.segment.containing_pages());
                        }
                        if let Some(page) = outcome.defrag {
                            defrags.push(page);
                        }
                    }
                }
            }
        }

        if op.deferred_free {
            store.mark_free(op.page);
        }
        defrags
    }
}
