//! Shard: the single-threaded owner of a slice of the key space, and the
//! process-wide shard set running one worker thread per shard.
//!
//! Every mutation follows the same discipline: notify registered snapshots
//! about the bucket it is going to touch, unwind any tiering state of the
//! previous value, apply the change, then append a journal record. I/O
//! completions are applied only at explicit suspension points.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use ember_search::{QueryParams, Schema, SearchResult, SortOption};

use crate::config::{ReplicationConfig, TieredConfig};
use crate::context::ExecutionContext;
use crate::doc_index::ShardDocIndex;
use crate::journal::restore::RestoreStreamer;
use crate::journal::streamer::StreamSink;
use crate::journal::types::Entry;
use crate::journal::JournalSlice;
use crate::slots::{key_slot, SlotSet};
use crate::table::{hash_key, DbIndex, DbTable};
use crate::tiered::{TieredStats, TieredStorage};
use crate::value::{ObjType, PrimeValue, ValueKind};

const TIERED_SETTLE_STEP: Duration = Duration::from_millis(100);

pub struct Shard {
    shard_id: usize,
    shard_cnt: u32,
    pub tables: Vec<DbTable>,
    pub journal: Arc<JournalSlice>,
    pub tiered: Option<TieredStorage>,
    restore: Option<RestoreStreamer>,
    doc_index: Option<ShardDocIndex>,
    next_txid: u64,
}

impl Shard {
    pub fn new(
        shard_id: usize,
        shard_cnt: u32,
        tiered_config: Option<TieredConfig>,
    ) -> anyhow::Result<Self> {
        let tiered = match tiered_config {
            Some(config) => Some(TieredStorage::open(shard_id, config)?),
            None => None,
        };
        Ok(Self {
            shard_id,
            shard_cnt,
            tables: vec![DbTable::new()],
            journal: Arc::new(JournalSlice::new(shard_id as u32)),
            tiered,
            restore: None,
            doc_index: None,
            next_txid: 1,
        })
    }

    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    pub fn close(&mut self) {
        if let Some(mut rs) = self.restore.take() {
            rs.cancel(&mut self.tables[0]);
        }
        if let Some(tiered) = self.tiered.as_mut() {
            tiered.close();
        }
    }

    fn ensure_db(&mut self, dbid: DbIndex) {
        while self.tables.len() <= dbid as usize {
            self.tables.push(DbTable::new());
        }
    }

    /// Route the pending change to the registered snapshot, if its bucket
    /// has not been captured yet. Must run before the mutation.
    fn dispatch_change(&mut self, dbid: DbIndex, key: &[u8]) {
        let Some(req) = self.tables[dbid as usize].prepare_change(key) else {
            return;
        };
        if let Some(rs) = &self.restore {
            rs.on_db_change(&mut self.tables[dbid as usize], self.tiered.as_ref(), &req);
        }
    }

    fn log_command(&mut self, dbid: DbIndex, slot: Option<u16>, cmd: &str, args: Vec<Bytes>) {
        let txid = self.next_txid;
        self.next_txid += 1;
        let entry = Entry::command(txid, dbid, self.shard_cnt, slot, cmd, args);
        self.journal.add_log_record(&entry, true);
    }

    /// Drop the tiering state of the value at `key`, if any.
    fn unwind_tiering(&mut self, dbid: DbIndex, key: &[u8]) {
        let Some(tiered) = self.tiered.as_mut() else {
            return;
        };
        if let Some(pv) = self.tables[dbid as usize].prime.get_mut(key) {
            if pv.is_external() {
                tiered.delete(dbid, pv);
            } else if pv.has_stash_pending() {
                tiered.cancel_stash(dbid, key, pv);
            }
        }
    }

    pub fn set(&mut self, dbid: DbIndex, key: &[u8], value: &[u8]) {
        self.ensure_db(dbid);
        self.dispatch_change(dbid, key);
        self.unwind_tiering(dbid, key);

        let key_bytes = Bytes::copy_from_slice(key);
        self.tables[dbid as usize]
            .prime
            .insert(key_bytes.clone(), PrimeValue::new_string(value));
        self.log_command(
            dbid,
            Some(key_slot(key)),
            "SET",
            vec![key_bytes, Bytes::copy_from_slice(value)],
        );

        if let Some(tiered) = self.tiered.as_mut() {
            tiered.try_stash(dbid, key, &mut self.tables);
        }
    }

    /// Store a non-string value (containers, json). Journaled under the
    /// write command matching its type.
    pub fn set_value(&mut self, dbid: DbIndex, key: &[u8], value: PrimeValue) {
        self.ensure_db(dbid);
        self.dispatch_change(dbid, key);
        self.unwind_tiering(dbid, key);

        let key_bytes = Bytes::copy_from_slice(key);
        if matches!(value.kind(), ValueKind::Hash(_)) {
            if let Some(index) = self.doc_index.as_mut() {
                index.add_document(&key_bytes, &value);
            }
        }
        let cmd = match value.obj_type() {
            ObjType::Set => "SADD",
            ObjType::ZSet => "ZADD",
            ObjType::Hash => "HSET",
            ObjType::List => "RPUSH",
            ObjType::Stream => "XADD",
            ObjType::Json => "JSON.SET",
            ObjType::String => "SET",
        };
        self.tables[dbid as usize].prime.insert(key_bytes.clone(), value);
        self.log_command(dbid, Some(key_slot(key)), cmd, vec![key_bytes]);
    }

    pub fn get(&mut self, dbid: DbIndex, key: &[u8]) -> Option<Bytes> {
        self.ensure_db(dbid);
        let external = {
            let pv = self.tables[dbid as usize].prime.get(key)?;
            pv.is_external()
        };

        if !external {
            let pv = self.tables[dbid as usize].prime.get_mut(key)?;
            pv.set_touched(true);
            return pv.get_string();
        }

        let tiered = self.tiered.as_mut()?;
        let future = tiered.read(dbid, key, self.tables[dbid as usize].prime.get_mut(key)?);
        while !future.is_ready() {
            if !tiered.wait_completion(&mut self.tables, TIERED_SETTLE_STEP) {
                break;
            }
        }
        match future.take()? {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(error = %err, "offloaded read failed");
                None
            }
        }
    }

    pub fn mget(&mut self, dbid: DbIndex, keys: &[&[u8]]) -> Vec<Option<Bytes>> {
        keys.iter().map(|key| self.get(dbid, key)).collect()
    }

    /// Append to a string value, transparently modifying offloaded values on
    /// disk. Returns the new length.
    pub fn append(&mut self, dbid: DbIndex, key: &[u8], suffix: &[u8]) -> anyhow::Result<usize> {
        self.ensure_db(dbid);
        self.dispatch_change(dbid, key);

        if !self.tables[dbid as usize].prime.contains(key) {
            self.set(dbid, key, suffix);
            return Ok(suffix.len());
        }

        let new_len;
        let pending = self.tables[dbid as usize]
            .prime
            .get(key)
            .is_some_and(PrimeValue::has_stash_pending);
        if pending {
            let tiered = self.tiered.as_mut().expect("pending implies tiering");
            let pv = self.tables[dbid as usize]
                .prime
                .get_mut(key)
                .expect("checked above");
            tiered.cancel_stash(dbid, key, pv);
        }

        let external = self.tables[dbid as usize]
            .prime
            .get(key)
            .is_some_and(PrimeValue::is_external);
        if external {
            let tiered = self
                .tiered
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("offloaded value without tiered storage"))?;
            let suffix_owned = suffix.to_vec();
            let future = tiered.modify(
                dbid,
                key,
                self.tables[dbid as usize].prime.get_mut(key).expect("checked"),
                move |buf| {
                    buf.extend_from_slice(&suffix_owned);
                    buf.len()
                },
            );
            while !future.is_ready() {
                anyhow::ensure!(
                    tiered.wait_completion(&mut self.tables, Duration::from_secs(5)),
                    "append modify timed out"
                );
            }
            new_len = future.take().expect("ready")?;
        } else {
            let pv = self.tables[dbid as usize]
                .prime
                .get_mut(key)
                .expect("checked above");
            let mut raw = pv.get_string().map(|b| b.to_vec()).unwrap_or_default();
            raw.extend_from_slice(suffix);
            new_len = raw.len();
            pv.materialize(&raw, false);
        }

        self.log_command(
            dbid,
            Some(key_slot(key)),
            "APPEND",
            vec![Bytes::copy_from_slice(key), Bytes::copy_from_slice(suffix)],
        );
        Ok(new_len)
    }

    pub fn del(&mut self, dbid: DbIndex, key: &[u8]) -> bool {
        self.ensure_db(dbid);
        self.dispatch_change(dbid, key);
        self.unwind_tiering(dbid, key);

        let key_bytes = Bytes::copy_from_slice(key);
        if let Some(index) = self.doc_index.as_mut() {
            index.remove_document(&key_bytes);
        }
        let removed = self.tables[dbid as usize].prime.remove(key).is_some();
        self.tables[dbid as usize].expire.remove(key);
        if removed {
            self.log_command(dbid, Some(key_slot(key)), "DEL", vec![key_bytes]);
        }
        removed
    }

    /// Set an absolute expiry in unix milliseconds.
    pub fn expire_at(&mut self, dbid: DbIndex, key: &[u8], at_ms: u64) -> bool {
        self.ensure_db(dbid);
        if !self.tables[dbid as usize].prime.contains(key) {
            return false;
        }
        self.dispatch_change(dbid, key);
        self.tables[dbid as usize]
            .expire
            .insert(Bytes::copy_from_slice(key), at_ms);
        self.log_command(
            dbid,
            Some(key_slot(key)),
            "PEXPIREAT",
            vec![
                Bytes::copy_from_slice(key),
                Bytes::from(at_ms.to_string().into_bytes()),
            ],
        );
        true
    }

    /// Mark a key as surviving eviction.
    pub fn stick(&mut self, dbid: DbIndex, key: &[u8]) -> bool {
        self.ensure_db(dbid);
        self.dispatch_change(dbid, key);
        let Some(pv) = self.tables[dbid as usize].prime.get_mut(key) else {
            return false;
        };
        pv.set_sticky(true);
        self.log_command(
            dbid,
            Some(key_slot(key)),
            "STICK",
            vec![Bytes::copy_from_slice(key)],
        );
        true
    }

    /// Drop a whole database. A registered migration observes the flush via
    /// the journal and aborts.
    pub fn flush_db(&mut self, dbid: DbIndex) {
        self.ensure_db(dbid);
        self.log_command(dbid, None, "FLUSHALL", Vec::new());

        let mut table = std::mem::take(&mut self.tables[dbid as usize]);
        if let Some(tiered) = self.tiered.as_mut() {
            for (key, pv) in table.prime.iter_mut() {
                if pv.is_external() {
                    tiered.delete(dbid, pv);
                } else if pv.has_stash_pending() {
                    let key = key.clone();
                    tiered.cancel_stash(dbid, &key, pv);
                }
            }
        }
    }

    // Tiered plumbing.

    pub fn run_offloading(&mut self, dbid: DbIndex) {
        self.ensure_db(dbid);
        if let Some(tiered) = self.tiered.as_mut() {
            tiered.run_offloading(dbid, &mut self.tables);
        }
    }

    /// Apply queued tiered completions without blocking.
    pub fn drain_tiered(&mut self) -> usize {
        match self.tiered.as_mut() {
            Some(tiered) => tiered.drain_completions(&mut self.tables),
            None => 0,
        }
    }

    /// Block until all in-flight tiered operations completed or `timeout`
    /// elapsed. Returns true when the engine is idle.
    pub fn settle_tiered(&mut self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let Some(tiered) = self.tiered.as_mut() else {
                return true;
            };
            if !tiered.has_pending() {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            tiered.wait_completion(&mut self.tables, TIERED_SETTLE_STEP);
        }
    }

    pub fn tiered_stats(&self) -> TieredStats {
        self.tiered
            .as_ref()
            .map(TieredStorage::stats)
            .unwrap_or_default()
    }

    // Slot migration.

    /// Begin streaming the given slots to `sink`: registers the snapshot
    /// subscriber and the journal tail.
    pub fn start_slot_migration(
        &mut self,
        slots: SlotSet,
        sink: Box<dyn StreamSink>,
        config: &ReplicationConfig,
    ) -> anyhow::Result<ExecutionContext> {
        anyhow::ensure!(self.restore.is_none(), "slot migration already running");
        let cntx = ExecutionContext::new();
        let mut streamer =
            RestoreStreamer::new(self.journal.clone(), slots, cntx.clone(), config, sink)?;
        streamer.start(&mut self.tables[0], true);
        self.restore = Some(streamer);
        Ok(cntx)
    }

    /// Run the snapshot scan to completion.
    pub fn run_migration_scan(&mut self) {
        let Some(mut streamer) = self.restore.take() else {
            return;
        };
        streamer.run(&mut self.tables[0], self.tiered.as_ref());
        self.restore = Some(streamer);
    }

    pub fn finalize_migration(&mut self, attempt: u64) {
        if let Some(streamer) = &self.restore {
            streamer.send_finalize(attempt);
        }
    }

    pub fn cancel_migration(&mut self) {
        if let Some(mut streamer) = self.restore.take() {
            streamer.cancel(&mut self.tables[0]);
        }
    }

    // Search.

    pub fn enable_search(&mut self, schema: Schema) {
        self.doc_index = Some(ShardDocIndex::new(schema));
    }

    pub fn doc_index(&self) -> Option<&ShardDocIndex> {
        self.doc_index.as_ref()
    }

    pub fn search(
        &self,
        query: &str,
        params: &QueryParams,
        sort: Option<SortOption>,
        limit: usize,
    ) -> Option<SearchResult> {
        self.doc_index
            .as_ref()
            .map(|index| index.search(query, params, sort, limit))
    }
}

type ShardTask = Box<dyn FnOnce(&mut Shard) + Send>;

struct ShardHandle {
    tx: Option<mpsc::Sender<ShardTask>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Process-wide registry of shard workers. Initialize after the process'
/// thread pools exist; shut down before they die.
pub struct ShardSet {
    handles: Vec<ShardHandle>,
}

impl ShardSet {
    pub fn init(shard_cnt: usize, tiered: Option<TieredConfig>) -> anyhow::Result<Self> {
        anyhow::ensure!(shard_cnt > 0, "shard set requires at least one shard");
        let mut handles = Vec::with_capacity(shard_cnt);
        for shard_id in 0..shard_cnt {
            let (tx, rx) = mpsc::channel::<ShardTask>();
            let tiered = tiered.clone();
            let thread = thread::Builder::new()
                .name(format!("ember-shard-{shard_id}"))
                .spawn(move || {
                    let mut shard = match Shard::new(shard_id, shard_cnt as u32, tiered) {
                        Ok(shard) => shard,
                        Err(err) => {
                            tracing::error!(error = %err, shard_id, "shard init failed");
                            return;
                        }
                    };
                    while let Ok(task) = rx.recv() {
                        task(&mut shard);
                    }
                    shard.close();
                })
                .map_err(|err| anyhow::anyhow!("spawn shard worker: {err}"))?;
            handles.push(ShardHandle {
                tx: Some(tx),
                thread: Some(thread),
            });
        }
        Ok(Self { handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Shard owning `key` under hash partitioning.
    pub fn shard_for_key(&self, key: &[u8]) -> usize {
        (hash_key(key) as usize) % self.handles.len()
    }

    /// Run `f` on the shard's worker thread and wait for its result.
    pub fn on_shard<R, F>(&self, shard_id: usize, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut Shard) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let task: ShardTask = Box::new(move |shard| {
            let _ = tx.send(f(shard));
        });
        self.handles[shard_id]
            .tx
            .as_ref()
            .expect("shard set is shut down")
            .send(task)
            .expect("shard worker alive");
        rx.recv().expect("shard worker response")
    }

    /// Ordered teardown: stop accepting work, then join every worker.
    pub fn shutdown(mut self) {
        for handle in &mut self.handles {
            handle.tx.take();
        }
        for handle in &mut self.handles {
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_set_routes_and_shuts_down() {
        let set = ShardSet::init(2, None).unwrap();
        assert_eq!(set.size(), 2);

        let shard_id = set.shard_for_key(b"hello");
        set.on_shard(shard_id, |shard| shard.set(0, b"hello", b"world"));
        let value = set.on_shard(shard_id, |shard| shard.get(0, b"hello"));
        assert_eq!(value, Some(Bytes::from_static(b"world")));

        let other = (shard_id + 1) % 2;
        let missing = set.on_shard(other, |shard| shard.get(0, b"hello"));
        assert_eq!(missing, None, "shards own disjoint key spaces");

        set.shutdown();
    }

    #[test]
    fn journal_records_mutations_in_order() {
        let mut shard = Shard::new(0, 1, None).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        shard.journal.register_on_change(Arc::new(move |item, _| {
            seen_cb.lock().unwrap().push((item.lsn, item.cmd.clone()));
        }));

        shard.set(0, b"a", b"1");
        shard.append(0, b"a", b"2").unwrap();
        shard.del(0, b"a");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (1, "SET".to_string()));
        assert_eq!(seen[1], (2, "APPEND".to_string()));
        assert_eq!(seen[2], (3, "DEL".to_string()));
    }

    #[test]
    fn get_returns_last_write_across_plain_updates() {
        let mut shard = Shard::new(0, 1, None).unwrap();
        shard.set(0, b"k", b"v1");
        shard.set(0, b"k", b"v2");
        assert_eq!(shard.get(0, b"k"), Some(Bytes::from_static(b"v2")));
        assert!(shard.del(0, b"k"));
        assert_eq!(shard.get(0, b"k"), None);
    }
}
