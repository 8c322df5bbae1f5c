//! Tiered storage: transparent offloading of large string values to a
//! per-shard disk page store.
//!
//! Values above `MIN_VALUE_SIZE` are stashed in the background. Whole-page
//! values pass through a cooling layer that retains the hot copy in an LRU
//! until memory pressure externalizes it; sub-page values are packed into
//! 4 KiB bins. All disk operations are coalesced through the op manager and
//! their completions are applied at the shard's suspension points via
//! [`TieredStorage::drain_completions`].

pub mod cool;
pub mod disk;
pub mod op_manager;
pub mod small_bins;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::config::TieredConfig;
use crate::table::{hash_key, DbIndex, DbTable};
use crate::value::{ObjType, PrimeValue};

use cool::CoolQueue;
use disk::{occupies_whole_pages, DiskSegment, PageStore, PAGE_SIZE};
use op_manager::{DeleteOutcome, EntryId, OpListener, OpManager, ReadCallback, ReadOutcome};
use small_bins::{SmallBins, FRAGMENTED_BIN};

/// Smallest value worth offloading.
pub const MIN_VALUE_SIZE: usize = 64;

const MAX_OFFLOAD_ITERATIONS: usize = 500;
/// Cap on cool-queue evictions per stash completion.
const COLD_EVICTIONS_PER_TRIGGER: usize = 32;

/// One-shot value resolved when the corresponding disk operation completes.
pub struct FutureValue<T> {
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for FutureValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for FutureValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FutureValue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn resolve(&self, value: T) {
        *self.inner.lock().expect("future lock") = Some(value);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().expect("future lock").is_some()
    }

    pub fn take(&self) -> Option<T> {
        self.inner.lock().expect("future lock").take()
    }
}

/// Per-database tiering counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct DbTableStats {
    pub tiered_entries: u64,
    pub tiered_used_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct ShardStats {
    total_stashes: u64,
    total_cancels: u64,
    total_fetches: u64,
    total_defrags: u64,
    total_uploads: u64,
    total_deletes: u64,
    stash_overflow_cnt: u64,
}

/// Aggregated tiering statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct TieredStats {
    pub total_stashes: u64,
    pub total_cancels: u64,
    pub total_fetches: u64,
    pub total_defrags: u64,
    pub total_uploads: u64,
    pub total_deletes: u64,
    pub total_stash_overflows: u64,
    pub pending_read_cnt: usize,
    pub pending_stash_cnt: usize,
    pub allocated_bytes: u64,
    pub capacity_bytes: u64,
    pub small_bins_cnt: usize,
    pub small_bins_entries_cnt: usize,
    pub small_bins_filling_bytes: usize,
    pub cold_storage_bytes: usize,
}

pub struct TieredStorage {
    config: TieredConfig,
    store: PageStore,
    ops: OpManager,
    bins: SmallBins,
    cool: CoolQueue,
    db_stats: Vec<DbTableStats>,
    stats: ShardStats,
    offloading_cursor: crate::table::Cursor,
    write_depth_limit: usize,
    memory_low_limit: usize,
}

impl TieredStorage {
    /// Open the shard's backing store at `<prefix><shard id>`.
    pub fn open(shard_id: usize, config: TieredConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.prefix.is_empty(), "tiered prefix not configured");
        let path = format!("{}{}", config.prefix, shard_id);
        let store = PageStore::open(path, config.max_file_size)?;
        let write_depth_limit = config.write_depth;
        let memory_low_limit = config.memory_low_limit();
        Ok(Self {
            config,
            store,
            ops: OpManager::new(),
            bins: SmallBins::new(),
            cool: CoolQueue::new(),
            db_stats: Vec::new(),
            stats: ShardStats::default(),
            offloading_cursor: crate::table::Cursor::default(),
            write_depth_limit,
            memory_low_limit,
        })
    }

    pub fn close(&mut self) {
        self.store.close();
    }

    pub fn db_stats(&self, dbid: DbIndex) -> DbTableStats {
        self.db_stats
            .get(dbid as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> TieredStats {
        let op_stats = self.ops.stats();
        let disk = self.store.stats();
        let bins = self.bins.stats();
        TieredStats {
            total_stashes: self.stats.total_stashes,
            total_cancels: self.stats.total_cancels,
            total_fetches: self.stats.total_fetches,
            total_defrags: self.stats.total_defrags,
            total_uploads: self.stats.total_uploads,
            total_deletes: self.stats.total_deletes,
            total_stash_overflows: self.stats.stash_overflow_cnt,
            pending_read_cnt: op_stats.pending_read_cnt,
            pending_stash_cnt: op_stats.pending_stash_cnt,
            allocated_bytes: disk.allocated_bytes,
            capacity_bytes: disk.capacity_bytes,
            small_bins_cnt: bins.stashed_bins_cnt,
            small_bins_entries_cnt: bins.stashed_entries_cnt,
            small_bins_filling_bytes: bins.current_bin_bytes,
            cold_storage_bytes: self.cool.used_memory(),
        }
    }

    pub fn write_depth_usage(&self) -> f32 {
        self.ops.stats().pending_stash_cnt as f32 / self.write_depth_limit as f32
    }

    pub fn has_pending(&self) -> bool {
        self.ops.has_pending()
    }

    /// Whether this value is eligible for stashing right now.
    pub fn should_stash(&self, pv: &PrimeValue) -> bool {
        let disk = self.store.stats();
        pv.is_inline_string()
            && !pv.has_stash_pending()
            && pv.size() >= MIN_VALUE_SIZE
            && disk.allocated_bytes + PAGE_SIZE as u64 + pv.size() as u64 <= disk.max_file_size
    }

    /// Try to offload `key`'s value. Marks the value stash-pending and
    /// enqueues a write; false (no side effects) when preconditions fail, the
    /// write depth is saturated, or the disk would overflow.
    pub fn try_stash(&mut self, dbid: DbIndex, key: &[u8], tables: &mut [DbTable]) -> bool {
        let Some(pv) = tables[dbid as usize].prime.get_mut(key) else {
            return false;
        };
        if !self.should_stash(pv) {
            return false;
        }
        debug_assert!(!self.bins.is_pending(dbid, key));

        if self.ops.stats().pending_stash_cnt >= self.write_depth_limit {
            self.stats.stash_overflow_cnt += 1;
            return false;
        }

        let raw = pv.get_string().expect("inline string checked above");
        pv.set_stash_pending(true);

        if occupies_whole_pages(raw.len()) {
            let id = EntryId::Key(dbid, Bytes::copy_from_slice(key));
            if let Err(err) = self.ops.stash(id, raw, &mut self.store) {
                tracing::error!(error = %err, "stash failed immediately");
                if let Some(pv) = tables[dbid as usize].prime.get_mut(key) {
                    pv.set_stash_pending(false);
                }
                self.stats.total_cancels += 1;
                return false;
            }
        } else if let Some((bin_id, page)) = self.bins.stash(dbid, key, raw) {
            if let Err(err) = self.ops.stash(EntryId::Bin(bin_id), page, &mut self.store) {
                tracing::error!(error = %err, "bin stash failed immediately");
                for (sub_dbid, sub_key) in self.bins.report_stash_aborted(bin_id) {
                    if let Some(pv) = tables[sub_dbid as usize].prime.get_mut(&sub_key) {
                        pv.set_stash_pending(false);
                    }
                    self.stats.total_cancels += 1;
                }
                // The new entry went into the fresh filling bin and stays
                // queued; only the sealed bin was aborted.
                return true;
            }
        }
        true
    }

    /// Read an offloaded value. Cool values resolve synchronously and are
    /// promoted back to resident (warmup); external values enqueue a fetch,
    /// coalescing with any outstanding read of the same segment.
    pub fn read(
        &mut self,
        dbid: DbIndex,
        key: &[u8],
        value: &mut PrimeValue,
    ) -> FutureValue<std::io::Result<Bytes>> {
        debug_assert!(value.is_external());
        let future = FutureValue::new();

        if let Some(info) = value.cool_info() {
            let hot = self.warmup(dbid, info);
            future.resolve(Ok(hot.get_string().expect("cool records hold strings")));
            *value = hot;
            return future;
        }

        let segment = value.external_slice().expect("external value");
        let decoder = value.import_external();
        let resolve = future.clone();
        let cb: ReadCallback = Box::new(move |outcome| match outcome {
            ReadOutcome::Ok { is_raw, value } => {
                let repr = decoder.decode(value, is_raw);
                resolve.resolve(Ok(repr.raw_bytes()));
                false
            }
            ReadOutcome::Err(err) => {
                resolve.resolve(Err(std::io::Error::new(err.kind(), err.to_string())));
                false
            }
        });
        self.ops.enqueue_read(
            EntryId::Key(dbid, Bytes::copy_from_slice(key)),
            segment,
            cb,
            &self.store,
        );
        future
    }

    /// Fetch, apply `f` to a mutable decoded copy, upload the result back to
    /// memory and drop the disk segment. Cool values are warmed first and
    /// modified in place.
    pub fn modify<T: Send + 'static>(
        &mut self,
        dbid: DbIndex,
        key: &[u8],
        value: &mut PrimeValue,
        f: impl FnOnce(&mut Vec<u8>) -> T + Send + 'static,
    ) -> FutureValue<std::io::Result<T>> {
        debug_assert!(value.is_external());
        let future = FutureValue::new();

        if let Some(info) = value.cool_info() {
            let mut hot = self.warmup(dbid, info);
            let mut buf = hot
                .get_string()
                .expect("cool records hold strings")
                .to_vec();
            let out = f(&mut buf);
            hot.materialize(&buf, false);
            *value = hot;
            future.resolve(Ok(out));
            return future;
        }

        let segment = value.external_slice().expect("external value");
        let decoder = value.import_external();
        let resolve = future.clone();
        let cb: ReadCallback = Box::new(move |outcome| match outcome {
            ReadOutcome::Ok { is_raw, value } => {
                if is_raw {
                    let raw = decoder.decode(value, true).raw_bytes();
                    value.clear();
                    value.extend_from_slice(&raw);
                }
                resolve.resolve(Ok(f(value)));
                true
            }
            ReadOutcome::Err(err) => {
                resolve.resolve(Err(std::io::Error::new(err.kind(), err.to_string())));
                false
            }
        });
        self.ops.enqueue_read(
            EntryId::Key(dbid, Bytes::copy_from_slice(key)),
            segment,
            cb,
            &self.store,
        );
        future
    }

    /// Drop the disk segment backing an offloaded value and reset it.
    pub fn delete(&mut self, dbid: DbIndex, value: &mut PrimeValue) {
        debug_assert!(value.is_external());
        let segment = if let Some(info) = value.cool_info() {
            let record = self.cool.erase(info.handle);
            debug_assert_eq!(record.value.obj_type(), ObjType::String);
            DiskSegment::new(
                record.page_index as u64 * PAGE_SIZE as u64 + info.page_offset as u64,
                info.len,
            )
        } else {
            value.external_slice().expect("external value")
        };
        value.reset();
        self.stats.total_deletes += 1;
        self.delete_offloaded(dbid, segment);
    }

    /// Cancel a stash that has not externalized yet.
    pub fn cancel_stash(&mut self, dbid: DbIndex, key: &[u8], value: &mut PrimeValue) {
        debug_assert!(value.has_stash_pending());
        if occupies_whole_pages(value.size()) {
            self.ops
                .cancel_stash(&EntryId::Key(dbid, Bytes::copy_from_slice(key)));
        } else if let Some(bin) = self.bins.delete_pending(dbid, key) {
            self.ops.cancel_stash(&EntryId::Bin(bin));
        }
        value.set_stash_pending(false);
    }

    /// Periodic background offloading: walk the table in segment order from
    /// the saved cursor and opportunistically stash eligible values, skipping
    /// (and clearing) touched ones.
    pub fn run_offloading(&mut self, dbid: DbIndex, tables: &mut [DbTable]) {
        let disk = self.store.stats();
        if disk.allocated_bytes + (MAX_OFFLOAD_ITERATIONS / 2 * PAGE_SIZE) as u64
            > disk.max_file_size
        {
            return;
        }

        let mut iterations = 0usize;
        loop {
            if self.ops.stats().pending_stash_cnt >= self.write_depth_limit {
                break;
            }

            let mut keys = Vec::new();
            {
                let prime = &tables[dbid as usize].prime;
                self.offloading_cursor = prime.traverse(self.offloading_cursor, |bucket| {
                    for (key, _) in prime.bucket_entries(bucket) {
                        keys.push(key.clone());
                    }
                });
            }

            for key in keys {
                let Some(pv) = tables[dbid as usize].prime.get(&key) else {
                    continue;
                };
                if !self.should_stash(pv) {
                    continue;
                }
                if pv.was_touched() {
                    if let Some(pv) = tables[dbid as usize].prime.get_mut(&key) {
                        pv.set_touched(false);
                    }
                } else {
                    self.try_stash(dbid, &key, tables);
                }
            }

            iterations += 1;
            if self.offloading_cursor.is_done() || iterations >= MAX_OFFLOAD_ITERATIONS {
                break;
            }
        }
    }

    /// Borrow the resident copy of a cool record.
    pub fn cool_value(&self, handle: cool::CoolHandle) -> &PrimeValue {
        &self.cool.peek(handle).value
    }

    /// Synchronous segment read for contexts that cannot suspend per entry.
    pub fn read_segment_sync(&self, segment: DiskSegment) -> anyhow::Result<Bytes> {
        self.store.read_sync(segment)
    }

    /// Apply all queued I/O completions.
    pub fn drain_completions(&mut self, tables: &mut [DbTable]) -> usize {
        let mut processed = 0;
        while let Some(completion) = self.store.try_recv_completion() {
            self.apply_completion(completion, tables);
            processed += 1;
        }
        processed
    }

    /// Block up to `timeout` for one completion and apply it.
    pub fn wait_completion(&mut self, tables: &mut [DbTable], timeout: Duration) -> bool {
        match self.store.recv_completion_timeout(timeout) {
            Some(completion) => {
                self.apply_completion(completion, tables);
                true
            }
            None => false,
        }
    }

    fn apply_completion(&mut self, completion: disk::IoCompletion, tables: &mut [DbTable]) {
        if self.db_stats.len() < tables.len() {
            self.db_stats.resize(tables.len(), DbTableStats::default());
        }
        let Self {
            config,
            store,
            ops,
            bins,
            cool,
            db_stats,
            stats,
            memory_low_limit,
            ..
        } = self;
        let mut listener = ShardListener {
            tables,
            bins,
            cool,
            db_stats,
            stats,
            cooling_enabled: config.experimental_cooling,
            memory_margin: config.memory_margin,
            memory_limit: config.memory_limit,
            memory_low_limit: *memory_low_limit,
        };
        let defrags = ops.process_completion(completion, store, &mut listener);
        for page in defrags {
            enqueue_defrag(ops, store, page);
        }
    }

    fn warmup(&mut self, dbid: DbIndex, info: crate::value::CoolInfo) -> PrimeValue {
        let record = self.cool.erase(info.handle);
        let segment = DiskSegment::new(
            record.page_index as u64 * PAGE_SIZE as u64 + info.page_offset as u64,
            info.len,
        );
        self.delete_offloaded(dbid, segment);

        debug_assert_eq!(record.value.obj_type(), ObjType::String);
        let mut hot = record.value;
        hot.set_touched(true);
        hot
    }

    fn delete_offloaded(&mut self, dbid: DbIndex, segment: DiskSegment) {
        if self.db_stats.len() <= dbid as usize {
            self.db_stats
                .resize(dbid as usize + 1, DbTableStats::default());
        }
        let db = &mut self.db_stats[dbid as usize];
        db.tiered_entries = db.tiered_entries.saturating_sub(1);
        db.tiered_used_bytes = db.tiered_used_bytes.saturating_sub(segment.len as u64);

        let Self {
            ops, store, bins, ..
        } = self;
        let defrag =
            ops.delete_offloaded(segment, store, &mut |seg| bin_delete_outcome(bins, seg));
        if let Some(page) = defrag {
            enqueue_defrag(ops, store, page);
        }
    }
}

fn enqueue_defrag(ops: &mut OpManager, store: &PageStore, page: DiskSegment) {
    tracing::debug!(offset = page.offset, "enqueueing bin defragmentation");
    let cb: ReadCallback = Box::new(|_| false);
    ops.enqueue_read(EntryId::Bin(FRAGMENTED_BIN), page, cb, store);
}

fn bin_delete_outcome(bins: &mut SmallBins, segment: DiskSegment) -> DeleteOutcome {
    if occupies_whole_pages(segment.len as usize) {
        return DeleteOutcome {
            release: true,
            defrag: None,
        };
    }
    match bins.delete_stashed(segment) {
        // Bin already dissolved (e.g. by defrag); its page was reclaimed then.
        None => DeleteOutcome::default(),
        Some(info) => DeleteOutcome {
            release: info.empty,
            defrag: info.fragmented.then_some(info.segment),
        },
    }
}

/// Completion handler bridging op-manager events to the shard's tables.
struct ShardListener<'a> {
    tables: &'a mut [DbTable],
    bins: &'a mut SmallBins,
    cool: &'a mut CoolQueue,
    db_stats: &'a mut Vec<DbTableStats>,
    stats: &'a mut ShardStats,
    cooling_enabled: bool,
    memory_margin: usize,
    memory_limit: usize,
    memory_low_limit: usize,
}

impl ShardListener<'_> {
    fn db_stats_mut(&mut self, dbid: DbIndex) -> &mut DbTableStats {
        if self.db_stats.len() <= dbid as usize {
            self.db_stats
                .resize(dbid as usize + 1, DbTableStats::default());
        }
        &mut self.db_stats[dbid as usize]
    }

    fn clear_io_pending(&mut self, dbid: DbIndex, key: &[u8]) {
        if let Some(pv) = self.tables[dbid as usize].prime.get_mut(key) {
            pv.set_stash_pending(false);
        }
        self.stats.total_cancels += 1;
    }

    fn has_memory_margin(&self, additional: usize) -> bool {
        self.cool.used_memory() + additional + self.memory_margin < self.memory_limit
    }

    /// Evict the coldest queue entries under memory pressure, flipping their
    /// table values to fully external.
    fn externalize_cold_entries(&mut self) {
        let mut evicted = 0;
        while evicted < COLD_EVICTIONS_PER_TRIGGER
            && self.cool.used_memory() > self.memory_low_limit
        {
            let Some((handle, record)) = self.cool.pop_back() else {
                break;
            };
            evicted += 1;
            let table = &mut self.tables[record.dbid as usize];
            let found = table.prime.find_by_hash(record.key_hash, |_, v| {
                v.cool_info().is_some_and(|i| i.handle == handle)
            });
            match found {
                Some((_, pv)) => {
                    let info = pv.cool_info().expect("matched cool value");
                    pv.set_external(DiskSegment::new(
                        record.page_index as u64 * PAGE_SIZE as u64 + info.page_offset as u64,
                        info.len,
                    ));
                }
                None => {
                    tracing::error!(
                        key_hash = record.key_hash,
                        "cool record without a matching table entry"
                    );
                }
            }
        }
    }

    fn set_external(&mut self, dbid: DbIndex, key: &[u8], segment: DiskSegment) {
        let cooling = self.cooling_enabled && occupies_whole_pages(segment.len as usize);
        let key_hash = hash_key(key);

        let Some(pv) = self.tables[dbid as usize].prime.get_mut(key) else {
            tracing::error!("stash completed for a missing key");
            return;
        };
        pv.set_stash_pending(false);
        self.stats.total_stashes += 1;

        if cooling {
            let hot = pv.clone();
            debug_assert_eq!(hot.size(), segment.len as usize);
            let handle = self.cool.push_front(
                dbid,
                key_hash,
                (segment.offset / PAGE_SIZE as u64) as u32,
                hot,
            );
            // Reborrow: pushing the record does not move the table entry.
            if let Some(pv) = self.tables[dbid as usize].prime.get_mut(key) {
                pv.set_cool(segment.offset, segment.len, handle);
            }
        } else {
            pv.set_external(segment);
        }

        let db = self.db_stats_mut(dbid);
        db.tiered_entries += 1;
        db.tiered_used_bytes += segment.len as u64;
    }

    /// Re-upload surviving entries of a dissolved bin.
    fn defragment(&mut self, page: DiskSegment, page_bytes: &[u8]) {
        for (dbid, key_hash, item_segment) in self.bins.delete_bin(page) {
            let table = &mut self.tables[dbid as usize];
            let found = table.prime.find_by_hash(key_hash, |_, v| {
                !v.is_cool() && v.external_slice() == Some(item_segment)
            });
            let Some((_, pv)) = found else {
                continue;
            };

            self.stats.total_defrags += 1;
            let rel = (item_segment.offset - page.offset) as usize;
            let value = &page_bytes[rel..rel + item_segment.len as usize];
            pv.materialize(value, true);

            let db = self.db_stats_mut(dbid);
            db.tiered_entries = db.tiered_entries.saturating_sub(1);
            db.tiered_used_bytes = db.tiered_used_bytes.saturating_sub(item_segment.len as u64);
        }
    }
}

impl OpListener for ShardListener<'_> {
    fn on_stashed(&mut self, id: &EntryId, result: std::io::Result<DiskSegment>) {
        match result {
            Err(err) => {
                tracing::warn!(error = %err, "stash failed");
                match id {
                    EntryId::Key(dbid, key) => {
                        let key = key.clone();
                        self.clear_io_pending(*dbid, &key);
                    }
                    EntryId::Bin(bin) => {
                        for (dbid, key) in self.bins.report_stash_aborted(*bin) {
                            self.clear_io_pending(dbid, &key);
                        }
                    }
                }
            }
            Ok(segment) => {
                self.externalize_cold_entries();
                match id {
                    EntryId::Key(dbid, key) => {
                        let key = key.clone();
                        self.set_external(*dbid, &key, segment);
                    }
                    EntryId::Bin(bin) => {
                        for (dbid, key, sub) in self.bins.report_stashed(*bin, segment) {
                            self.set_external(dbid, &key, sub);
                        }
                    }
                }
            }
        }
    }

    fn on_fetched(
        &mut self,
        id: &EntryId,
        value: &mut Vec<u8>,
        segment: DiskSegment,
        modified: bool,
    ) -> bool {
        self.stats.total_fetches += 1;

        if id.is_fragmented_bin() {
            self.defragment(segment, value);
            return true;
        }

        // A modified value must be uploaded; a plain read is uploaded only
        // when memory allows and the value proved itself warm (second chance
        // via the touched bit).
        let should_upload = modified || self.has_memory_margin(value.len());
        if !should_upload {
            return false;
        }

        let EntryId::Key(dbid, key) = id else {
            tracing::error!("fetch completion with a bin id");
            return false;
        };
        let dbid = *dbid;
        let Some(pv) = self.tables[dbid as usize].prime.get_mut(key) else {
            tracing::error!("fetch completed for a missing key");
            return false;
        };

        if !pv.is_cool() && pv.external_slice() == Some(segment) {
            if modified || pv.was_touched() {
                let is_raw = !modified;
                pv.materialize(value, is_raw);
                self.stats.total_uploads += 1;
                let db = self.db_stats_mut(dbid);
                db.tiered_entries = db.tiered_entries.saturating_sub(1);
                db.tiered_used_bytes = db.tiered_used_bytes.saturating_sub(segment.len as u64);
                return true;
            }
            pv.set_touched(true);
            return false;
        }

        tracing::error!("fetch completion does not match the table entry");
        false
    }

    fn on_deleted(&mut self, segment: DiskSegment) -> DeleteOutcome {
        bin_delete_outcome(self.bins, segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> TieredConfig {
        TieredConfig {
            prefix: dir.join("tiered").display().to_string(),
            max_file_size: 1 << 22,
            experimental_cooling: false,
            ..TieredConfig::default()
        }
    }

    fn settle(ts: &mut TieredStorage, tables: &mut [DbTable]) {
        while ts.has_pending() {
            assert!(
                ts.wait_completion(tables, Duration::from_secs(5)),
                "io did not complete in time"
            );
        }
    }

    fn set(tables: &mut [DbTable], key: &[u8], len: usize, fill: u8) {
        tables[0]
            .prime
            .insert(Bytes::copy_from_slice(key), PrimeValue::new_string(&vec![fill; len]));
    }

    #[test]
    fn stash_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut ts = TieredStorage::open(0, test_config(dir.path())).unwrap();
        let mut tables = vec![DbTable::new()];

        set(&mut tables, b"big", 5000, b'A');
        assert!(ts.try_stash(0, b"big", &mut tables));
        assert!(tables[0].prime.get(b"big").unwrap().has_stash_pending());
        settle(&mut ts, &mut tables);

        let pv = tables[0].prime.get(b"big").unwrap();
        assert!(pv.is_external() && !pv.is_cool());
        assert_eq!(ts.stats().total_stashes, 1);
        assert_eq!(ts.db_stats(0).tiered_entries, 1);

        let future = ts.read(0, b"big", tables[0].prime.get_mut(b"big").unwrap());
        settle(&mut ts, &mut tables);
        let bytes = future.take().unwrap().unwrap();
        assert_eq!(bytes, Bytes::from(vec![b'A'; 5000]));
    }

    #[test]
    fn cooling_keeps_value_resident_until_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.experimental_cooling = true;
        // A generous low limit keeps the record queued.
        config.memory_limit = 64 * 1024 * 1024;
        let mut ts = TieredStorage::open(0, config).unwrap();
        let mut tables = vec![DbTable::new()];

        set(&mut tables, b"warm", 5000, b'B');
        assert!(ts.try_stash(0, b"warm", &mut tables));
        settle(&mut ts, &mut tables);

        let pv = tables[0].prime.get(b"warm").unwrap();
        assert!(pv.is_cool());
        assert_eq!(ts.stats().cold_storage_bytes, 5000);

        // Warmup on read: resolves synchronously and restores residency.
        let future = ts.read(0, b"warm", tables[0].prime.get_mut(b"warm").unwrap());
        assert!(future.is_ready());
        assert_eq!(future.take().unwrap().unwrap(), Bytes::from(vec![b'B'; 5000]));
        let pv = tables[0].prime.get(b"warm").unwrap();
        assert!(!pv.is_external());
        assert!(pv.was_touched());
        assert_eq!(ts.stats().cold_storage_bytes, 0);
        assert_eq!(ts.db_stats(0).tiered_entries, 0);
    }

    #[test]
    fn modify_uploads_and_reclaims_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut ts = TieredStorage::open(0, test_config(dir.path())).unwrap();
        let mut tables = vec![DbTable::new()];

        set(&mut tables, b"doc", 4100, b'C');
        assert!(ts.try_stash(0, b"doc", &mut tables));
        settle(&mut ts, &mut tables);

        let future = ts.modify(0, b"doc", tables[0].prime.get_mut(b"doc").unwrap(), |buf| {
            buf.push(b'!');
            buf.len()
        });
        settle(&mut ts, &mut tables);

        assert_eq!(future.take().unwrap().unwrap(), 4101);
        let pv = tables[0].prime.get(b"doc").unwrap();
        assert!(!pv.is_external(), "modified value is uploaded back");
        let got = pv.get_string().unwrap();
        assert_eq!(got.len(), 4101);
        assert_eq!(got.last(), Some(&b'!'));
        assert_eq!(ts.stats().allocated_bytes, 0, "segment reclaimed");
        assert_eq!(ts.stats().total_uploads, 1);
    }

    #[test]
    fn small_values_pack_into_bins() {
        let dir = tempfile::tempdir().unwrap();
        let mut ts = TieredStorage::open(0, test_config(dir.path())).unwrap();
        let mut tables = vec![DbTable::new()];

        // ~1 KiB values: four fill a bin, the fifth seals it.
        for i in 0..5 {
            set(&mut tables, format!("s{i}").as_bytes(), 1000, b'0' + i as u8);
            assert!(ts.try_stash(0, format!("s{i}").as_bytes(), &mut tables));
        }
        settle(&mut ts, &mut tables);

        let stats = ts.stats();
        assert_eq!(stats.small_bins_cnt, 1);
        assert_eq!(stats.small_bins_entries_cnt, 4);
        for i in 0..4 {
            let pv = tables[0].prime.get(format!("s{i}").as_bytes()).unwrap();
            assert!(pv.is_external(), "s{i} should be external");
        }
        // The fifth is still queued in the filling bin.
        let pv = tables[0].prime.get(b"s4").unwrap();
        assert!(pv.has_stash_pending() && !pv.is_external());
    }

    #[test]
    fn delete_of_pending_stash_leaves_no_residue() {
        let dir = tempfile::tempdir().unwrap();
        let mut ts = TieredStorage::open(0, test_config(dir.path())).unwrap();
        let mut tables = vec![DbTable::new()];

        set(&mut tables, b"gone", 5000, b'D');
        assert!(ts.try_stash(0, b"gone", &mut tables));

        // DEL while the write is in flight.
        let mut pv = tables[0].prime.remove(b"gone").unwrap();
        ts.cancel_stash(0, b"gone", &mut pv);
        settle(&mut ts, &mut tables);

        let stats = ts.stats();
        assert_eq!(stats.pending_stash_cnt, 0);
        assert_eq!(stats.allocated_bytes, 0, "no residual disk allocation");
        assert_eq!(stats.total_stashes, 0);
    }

    #[test]
    fn read_coalesces_concurrent_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let mut ts = TieredStorage::open(0, test_config(dir.path())).unwrap();
        let mut tables = vec![DbTable::new()];

        set(&mut tables, b"shared", 4200, b'E');
        assert!(ts.try_stash(0, b"shared", &mut tables));
        settle(&mut ts, &mut tables);

        let first = ts.read(0, b"shared", tables[0].prime.get_mut(b"shared").unwrap());
        let second = ts.read(0, b"shared", tables[0].prime.get_mut(b"shared").unwrap());
        assert_eq!(ts.stats().pending_read_cnt, 1, "one disk read for both");
        settle(&mut ts, &mut tables);

        assert_eq!(first.take().unwrap().unwrap().len(), 4200);
        assert_eq!(second.take().unwrap().unwrap().len(), 4200);
    }
}
