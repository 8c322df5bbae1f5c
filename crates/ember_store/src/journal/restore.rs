//! Restore streamer: live migration of a slot range.
//!
//! Emits a consistent snapshot of every key in the configured slots by
//! walking the prime table, then tails the journal for mutations touching
//! those slots. Concurrent mutations race the scan through the table's
//! bucket versions: a mutation landing in a not-yet-captured bucket first
//! serializes that bucket, so every key live during the snapshot window is
//! written exactly once.

use std::sync::Arc;

use bytes::Bytes;

use crate::config::ReplicationConfig;
use crate::context::ExecutionContext;
use crate::journal::dump::dump_value;
use crate::journal::serializer::serialize_entry;
use crate::journal::streamer::{ItemFilter, JournalStreamer, StreamSink};
use crate::journal::types::Entry;
use crate::journal::JournalSlice;
use crate::slots::{key_slot, SlotSet};
use crate::table::{ChangeReq, Cursor, DbTable};
use crate::tiered::TieredStorage;
use crate::value::{ObjType, PrimeValue, ValueKind};

/// Scan yields to other shard work after this many buckets.
const YIELD_EVERY_BUCKETS: u64 = 100;

pub struct RestoreStreamer {
    streamer: JournalStreamer,
    my_slots: SlotSet,
    chunk_size: usize,
    snapshot_version: u64,
    cancelled: bool,
}

impl RestoreStreamer {
    pub fn new(
        journal: Arc<JournalSlice>,
        my_slots: SlotSet,
        cntx: ExecutionContext,
        config: &ReplicationConfig,
        sink: Box<dyn StreamSink>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            streamer: JournalStreamer::new(journal, cntx, config, sink)?,
            my_slots,
            chunk_size: config.serialization_max_chunk_size,
            snapshot_version: 0,
            cancelled: false,
        })
    }

    pub fn context(&self) -> &ExecutionContext {
        self.streamer.core().context()
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    /// Register the table-change subscriber and the journal tail. Must be
    /// called before the scan starts.
    pub fn start(&mut self, db: &mut DbTable, send_lsn: bool) {
        if self.cancelled {
            return;
        }
        tracing::debug!("restore streamer start");
        self.snapshot_version = db.register_on_change();

        let cntx = self.context().clone();
        let core = self.streamer.core().clone();
        let slots = self.my_slots.clone();
        let filter: ItemFilter = Arc::new(move |item| {
            // A flush during migration invalidates the snapshot; abort.
            if item.cmd == "FLUSHALL" || item.cmd == "FLUSHDB" {
                cntx.report_error("FLUSH command during migration");
                core.shutdown_sink();
                return false;
            }
            match item.slot {
                None => false,
                Some(slot) => slots.contains(slot),
            }
        });
        self.streamer.start_filtered(send_lsn, Some(filter));
    }

    /// Snapshot scan over the whole table.
    pub fn run(&mut self, db: &mut DbTable, tiered: Option<&TieredStorage>) {
        tracing::debug!("restore streamer scan");
        let mut cursor = Cursor::default();
        let mut since_yield = 0u64;
        loop {
            if self.cancelled || self.context().is_stopped() {
                return;
            }

            let mut bucket = None;
            cursor = db.prime.traverse(cursor, |id| bucket = Some(id));
            if let Some(id) = bucket {
                self.write_bucket(db, tiered, id);
            }

            since_yield += 1;
            if since_yield >= YIELD_EVERY_BUCKETS {
                std::thread::yield_now();
                since_yield = 0;
            }
            if cursor.is_done() {
                return;
            }
        }
    }

    /// Handle a mutation racing the scan: if its bucket has not been captured
    /// yet, serialize the bucket now, before the mutation is applied.
    pub fn on_db_change(&self, db: &mut DbTable, tiered: Option<&TieredStorage>, req: &ChangeReq) {
        match req {
            ChangeReq::Update { bucket_id } => self.write_bucket(db, tiered, *bucket_id),
            ChangeReq::Insert { key } => {
                let bucket_id = db.prime.bucket_id(key);
                if db.prime.bucket_version(bucket_id) < self.snapshot_version {
                    self.write_bucket(db, tiered, bucket_id);
                }
            }
        }
    }

    /// Final record of a migration attempt: an LSN marker carrying the
    /// attempt number, flushed through the throttle.
    pub fn send_finalize(&self, attempt: u64) {
        tracing::debug!(attempt, "restore streamer finalize");
        self.write_raw(&serialize_entry(&Entry::lsn(attempt)));
        self.streamer.throttle_if_needed();
    }

    pub fn cancel(&mut self, db: &mut DbTable) {
        if self.snapshot_version != 0 {
            db.unregister_on_change(self.snapshot_version);
            self.snapshot_version = 0;
            self.cancelled = true;
            self.streamer.cancel();
        } else {
            self.cancelled = true;
        }
    }

    pub fn total_sent(&self) -> u64 {
        self.streamer.total_sent()
    }

    fn should_write_key(&self, key: &[u8]) -> bool {
        self.my_slots.contains(key_slot(key))
    }

    /// Serialize every in-scope entry of a not-yet-captured bucket and bump
    /// its version so the change handler knows it is done.
    fn write_bucket(&self, db: &mut DbTable, tiered: Option<&TieredStorage>, bucket_id: usize) {
        if db.prime.bucket_version(bucket_id) < self.snapshot_version {
            db.prime.set_bucket_version(bucket_id, self.snapshot_version);
            for (key, pv) in db.prime.bucket_entries(bucket_id) {
                if self.should_write_key(key) {
                    let expire_ms = db.expire_time(key);
                    self.write_entry(key, pv, expire_ms, tiered);
                }
            }
        }
        self.streamer.throttle_if_needed();
    }

    fn write_entry(
        &self,
        key: &[u8],
        pv: &PrimeValue,
        expire_ms: u64,
        tiered: Option<&TieredStorage>,
    ) {
        // Offloaded strings are resolved to a resident copy first: cool
        // values from their queue record, external ones from disk.
        let resolved = if pv.is_external() {
            let Some(tiered) = tiered else {
                tracing::error!("offloaded value without tiered storage");
                return;
            };
            if let Some(info) = pv.cool_info() {
                Some(tiered.cool_value(info.handle).clone())
            } else {
                let segment = pv.external_slice().expect("external value");
                match tiered.read_segment_sync(segment) {
                    Ok(bytes) => {
                        let mut hot = pv.clone();
                        hot.materialize(&bytes, true);
                        Some(hot)
                    }
                    Err(err) => {
                        self.context().report_error(format!("snapshot read failed: {err}"));
                        return;
                    }
                }
            }
        } else {
            None
        };
        let pv = resolved.as_ref().unwrap_or(pv);

        // Large containers are re-issued as native commands in chunks; other
        // values travel as one RESTORE.
        let chunked = self.chunk_size > 0
            && pv.malloc_used() > self.chunk_size
            && matches!(
                pv.obj_type(),
                ObjType::Set | ObjType::ZSet | ObjType::Hash | ObjType::List
            );
        if chunked {
            match pv.kind() {
                ValueKind::Set(items) => self.write_set(key, items.iter()),
                ValueKind::List(items) => self.write_list(key, items.iter()),
                ValueKind::ZSet(items) => self.write_zset(key, items),
                ValueKind::Hash(items) => self.write_hash(key, items.iter()),
                _ => unreachable!("chunked emission is container-only"),
            }
            self.write_stick_if_needed(key, pv);
            self.write_expire_if_needed(key, expire_ms);
        } else {
            self.write_restore(key, pv, expire_ms);
        }
    }

    fn write_set<'a>(&self, key: &[u8], items: impl Iterator<Item = &'a Bytes>) {
        let mut aggregator = CommandAggregator::new(key, self.chunk_size, |args| {
            self.write_command("SADD", args);
            self.streamer.throttle_if_needed();
        });
        for member in items {
            aggregator.add_arg(member.clone(), CommitMode::Auto);
        }
    }

    fn write_list<'a>(&self, key: &[u8], items: impl Iterator<Item = &'a Bytes>) {
        let mut aggregator = CommandAggregator::new(key, self.chunk_size, |args| {
            self.write_command("RPUSH", args);
            self.streamer.throttle_if_needed();
        });
        for element in items {
            aggregator.add_arg(element.clone(), CommitMode::Auto);
        }
    }

    fn write_zset(&self, key: &[u8], items: &[(f64, Bytes)]) {
        let mut aggregator = CommandAggregator::new(key, self.chunk_size, |args| {
            self.write_command("ZADD", args);
            self.streamer.throttle_if_needed();
        });
        for (score, member) in items {
            // Keep each (score, member) pair in one commit.
            aggregator.add_arg(
                Bytes::from(format_score(*score).into_bytes()),
                CommitMode::NoCommit,
            );
            aggregator.add_arg(member.clone(), CommitMode::Auto);
        }
    }

    fn write_hash<'a>(&self, key: &[u8], items: impl Iterator<Item = (&'a Bytes, &'a Bytes)>) {
        let mut aggregator = CommandAggregator::new(key, self.chunk_size, |args| {
            self.write_command("HSET", args);
            self.streamer.throttle_if_needed();
        });
        for (field, value) in items {
            aggregator.add_arg(field.clone(), CommitMode::NoCommit);
            aggregator.add_arg(value.clone(), CommitMode::Auto);
        }
    }

    fn write_restore(&self, key: &[u8], pv: &PrimeValue, expire_ms: u64) {
        let dump = match dump_value(pv) {
            Ok(dump) => dump,
            Err(err) => {
                self.context().report_error(format!("dump failed: {err}"));
                return;
            }
        };

        let mut args = Vec::with_capacity(5);
        args.push(Bytes::copy_from_slice(key));
        args.push(Bytes::from(expire_ms.to_string().into_bytes()));
        args.push(dump);
        // The expiry argument is absolute milliseconds since the epoch.
        args.push(Bytes::from_static(b"ABSTTL"));
        if pv.is_sticky() {
            args.push(Bytes::from_static(b"STICK"));
        }
        self.write_command("RESTORE", &args);
    }

    fn write_stick_if_needed(&self, key: &[u8], pv: &PrimeValue) {
        if pv.is_sticky() {
            self.write_command("STICK", &[Bytes::copy_from_slice(key)]);
        }
    }

    fn write_expire_if_needed(&self, key: &[u8], expire_ms: u64) {
        if expire_ms != 0 {
            // Spelling is part of the consuming replica's dialect.
            self.write_command(
                "PEXIRE",
                &[
                    Bytes::copy_from_slice(key),
                    Bytes::from(expire_ms.to_string().into_bytes()),
                ],
            );
        }
    }

    fn write_command(&self, cmd: &str, args: &[Bytes]) {
        let entry = Entry::command(0, 0, 1, Some(0), cmd, args.to_vec());
        self.write_raw(&serialize_entry(&entry));
    }

    fn write_raw(&self, data: &[u8]) {
        self.streamer.core().write(data);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Auto,
    /// Defer the commit so consecutive arguments stay in one command.
    NoCommit,
}

/// Batches member arguments for one key until a byte threshold, then hands
/// `[key, m1, m2, ...]` to the callback. Pending members flush on drop.
pub struct CommandAggregator<'a, F: FnMut(&[Bytes])> {
    key: &'a [u8],
    cb: F,
    members: Vec<Bytes>,
    agg_bytes: usize,
    threshold: usize,
}

impl<'a, F: FnMut(&[Bytes])> CommandAggregator<'a, F> {
    pub fn new(key: &'a [u8], threshold: usize, cb: F) -> Self {
        Self {
            key,
            cb,
            members: Vec::new(),
            agg_bytes: 0,
            threshold,
        }
    }

    pub fn add_arg(&mut self, arg: Bytes, commit_mode: CommitMode) {
        self.agg_bytes += arg.len();
        self.members.push(arg);
        if commit_mode != CommitMode::NoCommit && self.agg_bytes >= self.threshold {
            self.commit_pending();
        }
    }

    fn commit_pending(&mut self) {
        if self.members.is_empty() {
            return;
        }
        let mut args = Vec::with_capacity(self.members.len() + 1);
        args.push(Bytes::copy_from_slice(self.key));
        args.append(&mut self.members);
        (self.cb)(&args);
        self.agg_bytes = 0;
    }
}

impl<F: FnMut(&[Bytes])> Drop for CommandAggregator<'_, F> {
    fn drop(&mut self) {
        self.commit_pending();
    }
}

fn format_score(score: f64) -> String {
    if score == score.trunc() && score.is_finite() && score.abs() < 1e17 {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregator_commits_at_threshold() {
        let batches: std::cell::RefCell<Vec<Vec<Bytes>>> = std::cell::RefCell::new(Vec::new());
        {
            let mut agg =
                CommandAggregator::new(b"k", 10, |args| batches.borrow_mut().push(args.to_vec()));
            agg.add_arg(Bytes::from_static(b"aaaa"), CommitMode::Auto);
            agg.add_arg(Bytes::from_static(b"bbbb"), CommitMode::Auto);
            // 8 bytes so far, no commit yet.
            assert!(batches.borrow().is_empty());
            agg.add_arg(Bytes::from_static(b"cc"), CommitMode::Auto);
            // 10 bytes reaches the threshold.
        }
        let batches = batches.into_inner();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 4);
        assert_eq!(batches[0][0], Bytes::from_static(b"k"));
    }

    #[test]
    fn no_commit_mode_keeps_pairs_together() {
        let mut batches: Vec<usize> = Vec::new();
        {
            let mut agg = CommandAggregator::new(b"z", 4, |args| batches.push(args.len() - 1));
            for _ in 0..3 {
                agg.add_arg(Bytes::from_static(b"123"), CommitMode::NoCommit);
                agg.add_arg(Bytes::from_static(b"mem"), CommitMode::Auto);
            }
        }
        // Every commit carries an even number of member args.
        assert_eq!(batches, vec![2, 2, 2]);
    }

    #[test]
    fn drop_flushes_pending_members() {
        let mut batches: Vec<usize> = Vec::new();
        {
            let mut agg = CommandAggregator::new(b"s", 1 << 20, |args| batches.push(args.len()));
            agg.add_arg(Bytes::from_static(b"only"), CommitMode::Auto);
        }
        assert_eq!(batches, vec![2]);
    }

    #[test]
    fn score_formatting_is_compact() {
        assert_eq!(format_score(1.0), "1");
        assert_eq!(format_score(-3.0), "-3");
        assert_eq!(format_score(1.5), "1.5");
    }
}
