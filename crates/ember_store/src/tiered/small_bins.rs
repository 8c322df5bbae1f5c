//! Bin packer for sub-page values.
//!
//! Values too small for their own pages accumulate in a filling bin. Once the
//! next entry would overflow the page the bin is flushed as one 4 KiB write.
//! Page layout: `u16 entry_count`, then per entry
//! `u16 dbid, u16 key_len, u32 value_len, key, value`; recorded sub-segments
//! address the value bytes directly.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::table::{hash_key, DbIndex};
use crate::tiered::disk::{DiskSegment, PAGE_SIZE};

pub type BinId = u16;

pub const INVALID_BIN: BinId = BinId::MAX;
/// Sentinel id for whole-bin reads issued for defragmentation. Stashed bins
/// no longer carry bin ids, so this differentiates defrag from regular reads.
pub const FRAGMENTED_BIN: BinId = INVALID_BIN - 1;

const HEADER_BYTES: usize = 2;
const ENTRY_FRAME_BYTES: usize = 2 + 2 + 4;
/// A stashed bin is considered fragmented once live bytes drop below this.
const FRAGMENT_THRESHOLD: usize = PAGE_SIZE / 2;

#[derive(Clone, Copy, Debug, Default)]
pub struct BinStats {
    pub stashed_bins_cnt: usize,
    pub stashed_entries_cnt: usize,
    pub current_bin_bytes: usize,
}

/// Outcome of deleting a stashed entry.
#[derive(Clone, Copy, Debug)]
pub struct DeletedBin {
    /// Whole-page segment of the bin.
    pub segment: DiskSegment,
    /// No live entries remain; the page can be released.
    pub empty: bool,
    /// Occupancy dropped below the threshold; a defrag read should be issued.
    pub fragmented: bool,
}

struct FillingEntry {
    dbid: DbIndex,
    key: Bytes,
    value: Bytes,
}

struct PendingBin {
    entries: Vec<(DbIndex, Bytes, u32 /* value offset in page */, u32)>,
}

struct StashedEntry {
    dbid: DbIndex,
    key_hash: u64,
    len: u32,
}

struct StashedBin {
    /// Keyed by the value's offset within the page.
    entries: HashMap<u32, StashedEntry>,
    live_bytes: usize,
    defrag_pending: bool,
}

#[derive(Default)]
pub struct SmallBins {
    current: Vec<FillingEntry>,
    current_bytes: usize,
    next_bin_id: BinId,
    pending: HashMap<BinId, PendingBin>,
    stashed: HashMap<u64 /* page offset */, StashedBin>,
    stashed_entries_cnt: usize,
}

impl SmallBins {
    pub fn new() -> Self {
        Self {
            current_bytes: HEADER_BYTES,
            ..Default::default()
        }
    }

    pub fn stats(&self) -> BinStats {
        BinStats {
            stashed_bins_cnt: self.stashed.len(),
            stashed_entries_cnt: self.stashed_entries_cnt,
            current_bin_bytes: self.current_bytes,
        }
    }

    /// Whether a stash for `(dbid, key)` is queued in the filling bin or an
    /// in-flight pending bin.
    pub fn is_pending(&self, dbid: DbIndex, key: &[u8]) -> bool {
        self.current
            .iter()
            .any(|e| e.dbid == dbid && e.key.as_ref() == key)
            || self
                .pending
                .values()
                .any(|bin| bin.entries.iter().any(|(d, k, _, _)| *d == dbid && k.as_ref() == key))
    }

    fn frame_bytes(key: &[u8], value: &[u8]) -> usize {
        ENTRY_FRAME_BYTES + key.len() + value.len()
    }

    /// Queue a small value. If accepting it would overflow the filling bin,
    /// the bin is sealed and returned as `(bin id, page bytes)` for stashing;
    /// the new value starts the next bin either way.
    pub fn stash(
        &mut self,
        dbid: DbIndex,
        key: &[u8],
        value: Bytes,
    ) -> Option<(BinId, Bytes)> {
        debug_assert!(value.len() < PAGE_SIZE);
        let frame = Self::frame_bytes(key, &value);

        let mut sealed = None;
        if self.current_bytes + frame > PAGE_SIZE && !self.current.is_empty() {
            sealed = Some(self.seal_current());
        }

        self.current.push(FillingEntry {
            dbid,
            key: Bytes::copy_from_slice(key),
            value,
        });
        self.current_bytes += frame;
        sealed
    }

    fn seal_current(&mut self) -> (BinId, Bytes) {
        let id = self.next_bin_id;
        self.next_bin_id = self.next_bin_id.wrapping_add(1);
        if self.next_bin_id >= FRAGMENTED_BIN {
            self.next_bin_id = 0;
        }

        let entries = std::mem::take(&mut self.current);
        self.current_bytes = HEADER_BYTES;

        let mut page = BytesMut::with_capacity(PAGE_SIZE);
        page.put_u16(entries.len() as u16);
        let mut recorded = Vec::with_capacity(entries.len());
        for entry in entries {
            page.put_u16(entry.dbid);
            page.put_u16(entry.key.len() as u16);
            page.put_u32(entry.value.len() as u32);
            page.put_slice(&entry.key);
            let value_offset = page.len() as u32;
            page.put_slice(&entry.value);
            recorded.push((entry.dbid, entry.key, value_offset, entry.value.len() as u32));
        }
        page.resize(PAGE_SIZE, 0);

        self.pending.insert(id, PendingBin { entries: recorded });
        (id, page.freeze())
    }

    /// Record a completed bin stash at `segment` and report the per-entry
    /// sub-segments for externalization.
    pub fn report_stashed(
        &mut self,
        id: BinId,
        segment: DiskSegment,
    ) -> Vec<(DbIndex, Bytes, DiskSegment)> {
        let Some(bin) = self.pending.remove(&id) else {
            return Vec::new();
        };

        let mut stashed = StashedBin {
            entries: HashMap::with_capacity(bin.entries.len()),
            live_bytes: 0,
            defrag_pending: false,
        };
        let mut out = Vec::with_capacity(bin.entries.len());
        for (dbid, key, rel_offset, len) in bin.entries {
            stashed.entries.insert(
                rel_offset,
                StashedEntry {
                    dbid,
                    key_hash: hash_key(&key),
                    len,
                },
            );
            stashed.live_bytes += len as usize;
            out.push((
                dbid,
                key,
                DiskSegment::new(segment.offset + rel_offset as u64, len),
            ));
        }
        self.stashed_entries_cnt += out.len();
        self.stashed.insert(segment.offset, stashed);
        out
    }

    /// Drop a pending bin whose stash failed; returns the keys whose pending
    /// flags must be cleared.
    pub fn report_stash_aborted(&mut self, id: BinId) -> Vec<(DbIndex, Bytes)> {
        self.pending
            .remove(&id)
            .map(|bin| {
                bin.entries
                    .into_iter()
                    .map(|(dbid, key, _, _)| (dbid, key))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove a queued (not yet stashed) entry. Returns the bin id whose
    /// in-flight stash should be cancelled when the bin became empty.
    pub fn delete_pending(&mut self, dbid: DbIndex, key: &[u8]) -> Option<BinId> {
        if let Some(pos) = self
            .current
            .iter()
            .position(|e| e.dbid == dbid && e.key.as_ref() == key)
        {
            let entry = self.current.remove(pos);
            self.current_bytes -= Self::frame_bytes(&entry.key, &entry.value);
            return None;
        }

        let mut emptied = None;
        for (id, bin) in self.pending.iter_mut() {
            if let Some(pos) = bin
                .entries
                .iter()
                .position(|(d, k, _, _)| *d == dbid && k.as_ref() == key)
            {
                bin.entries.remove(pos);
                if bin.entries.is_empty() {
                    emptied = Some(*id);
                }
                break;
            }
        }
        if let Some(id) = emptied {
            self.pending.remove(&id);
        }
        emptied
    }

    /// Delete one stashed entry by its sub-segment.
    pub fn delete_stashed(&mut self, segment: DiskSegment) -> Option<DeletedBin> {
        let page = segment.containing_pages();
        let bin = self.stashed.get_mut(&page.offset)?;
        let rel = (segment.offset - page.offset) as u32;
        if bin.entries.remove(&rel).is_some() {
            self.stashed_entries_cnt -= 1;
            bin.live_bytes = bin.live_bytes.saturating_sub(segment.len as usize);
        }

        if bin.entries.is_empty() {
            self.stashed.remove(&page.offset);
            return Some(DeletedBin {
                segment: page,
                empty: true,
                fragmented: false,
            });
        }

        let fragmented = bin.live_bytes < FRAGMENT_THRESHOLD && !bin.defrag_pending;
        if fragmented {
            bin.defrag_pending = true;
        }
        Some(DeletedBin {
            segment: page,
            empty: false,
            fragmented,
        })
    }

    /// Dissolve a stashed bin for defragmentation: remove its bookkeeping and
    /// return the surviving entries as `(dbid, key hash, sub-segment)`.
    /// Returns an empty list when the bin was already deleted.
    pub fn delete_bin(&mut self, page: DiskSegment) -> Vec<(DbIndex, u64, DiskSegment)> {
        let Some(bin) = self.stashed.remove(&page.offset) else {
            return Vec::new();
        };
        self.stashed_entries_cnt -= bin.entries.len();
        bin.entries
            .into_iter()
            .map(|(rel, entry)| {
                (
                    entry.dbid,
                    entry.key_hash,
                    DiskSegment::new(page.offset + rel as u64, entry.len),
                )
            })
            .collect()
    }
}
