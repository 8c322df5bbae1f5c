//! Restore streamer: slot-scoped snapshot plus journal tail.

mod common;

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use ember_store::journal::dump::load_value;
use ember_store::journal::types::{Entry, Op};
use ember_store::slots::{key_slot, SlotSet};
use ember_store::value::{PrimeValue, ValueKind};
use ember_store::Shard;

use common::{init_tracing, keys_for_slot, parse_stream, replication_config, MemorySink};

fn new_shard() -> Shard {
    init_tracing();
    Shard::new(0, 1, None).unwrap()
}

/// Group emitted commands by key argument.
fn emissions_by_key(entries: &[Entry]) -> HashMap<Vec<u8>, Vec<Entry>> {
    let mut out: HashMap<Vec<u8>, Vec<Entry>> = HashMap::new();
    for entry in entries {
        if entry.opcode != Op::Command {
            continue;
        }
        let key = entry.args.first().expect("commands carry a key").to_vec();
        out.entry(key).or_default().push(entry.clone());
    }
    out
}

#[test]
fn single_slot_migration_emits_every_key_exactly_once() {
    let mut shard = new_shard();

    let in_scope = keys_for_slot(42, 100);
    let out_of_scope = keys_for_slot(7, 100);
    for key in &in_scope {
        shard.set(0, key.as_bytes(), format!("value-{key}").as_bytes());
    }
    for key in &out_of_scope {
        shard.set(0, key.as_bytes(), b"other");
    }

    let sink = MemorySink::new();
    let cntx = shard
        .start_slot_migration(
            SlotSet::from_slots([42]),
            Box::new(sink.clone()),
            &replication_config(),
        )
        .unwrap();

    // Mutations racing the snapshot: new keys in both slots.
    let new_in_scope = {
        let tag = common::tag_for_slot(42);
        (0..10)
            .map(|i| format!("{{{tag}}}:new{i}"))
            .collect::<Vec<_>>()
    };
    for key in &new_in_scope {
        assert_eq!(key_slot(key.as_bytes()), 42);
        shard.set(0, key.as_bytes(), b"fresh");
    }
    shard.set(0, out_of_scope[0].as_bytes(), b"updated");

    shard.run_migration_scan();
    shard.finalize_migration(1);
    shard.cancel_migration();
    assert!(!cntx.has_error());

    let entries = parse_stream(&sink.bytes());
    let by_key = emissions_by_key(&entries);

    for key in &in_scope {
        let emitted = by_key
            .get(key.as_bytes())
            .unwrap_or_else(|| panic!("{key} missing from the stream"));
        assert_eq!(emitted.len(), 1, "{key} must be emitted exactly once");
        assert_eq!(emitted[0].cmd, "RESTORE");
    }
    for key in &new_in_scope {
        let emitted = by_key
            .get(key.as_bytes())
            .unwrap_or_else(|| panic!("{key} missing from the stream"));
        assert_eq!(emitted.len(), 1, "{key} must be emitted exactly once");
        assert_eq!(emitted[0].cmd, "SET", "new keys arrive via the journal tail");
    }
    for key in &out_of_scope {
        assert!(
            !by_key.contains_key(key.as_bytes()),
            "{key} belongs to a slot out of scope"
        );
    }

    // The finalize marker is the last record.
    let last = entries.last().unwrap();
    assert_eq!(last.opcode, Op::Lsn);
    assert_eq!(last.lsn, 1);
}

#[test]
fn restore_payload_round_trips_through_dump() {
    let mut shard = new_shard();
    let keys = keys_for_slot(100, 1);
    let key = keys[0].as_bytes();
    shard.set(0, key, b"payload-bytes");
    shard.expire_at(0, key, 99_000);
    shard.stick(0, key);

    let sink = MemorySink::new();
    shard
        .start_slot_migration(
            SlotSet::from_slots([100]),
            Box::new(sink.clone()),
            &replication_config(),
        )
        .unwrap();
    shard.run_migration_scan();
    shard.cancel_migration();

    let entries = parse_stream(&sink.bytes());
    let restore = entries
        .iter()
        .find(|e| e.cmd == "RESTORE")
        .expect("restore emission");
    assert_eq!(restore.args[0], Bytes::copy_from_slice(key));
    assert_eq!(restore.args[1], Bytes::from_static(b"99000"));
    let loaded = load_value(&restore.args[2]).unwrap();
    assert_eq!(loaded.get_string().unwrap(), Bytes::from_static(b"payload-bytes"));
    assert_eq!(restore.args[3], Bytes::from_static(b"ABSTTL"));
    assert_eq!(restore.args[4], Bytes::from_static(b"STICK"));
}

#[test]
fn large_set_is_reissued_in_chunks() {
    let mut shard = new_shard();
    let keys = keys_for_slot(9, 1);
    let key = keys[0].as_bytes();

    let members: HashSet<Bytes> = (0..4000)
        .map(|i| Bytes::from(format!("member-{i:05}-padding-padding").into_bytes()))
        .collect();
    shard.set_value(0, key, PrimeValue::new(ValueKind::Set(members.clone())));
    shard.expire_at(0, key, 123_456);

    let sink = MemorySink::new();
    let config = replication_config();
    shard
        .start_slot_migration(SlotSet::from_slots([9]), Box::new(sink.clone()), &config)
        .unwrap();
    shard.run_migration_scan();
    shard.cancel_migration();

    let entries = parse_stream(&sink.bytes());
    let sadds: Vec<&Entry> = entries.iter().filter(|e| e.cmd == "SADD").collect();
    assert!(sadds.len() >= 2, "the set must be split into several SADDs");

    let mut rebuilt = HashSet::new();
    for sadd in &sadds {
        assert_eq!(sadd.args[0], Bytes::copy_from_slice(key));
        let payload: usize = sadd.args[1..].iter().map(Bytes::len).sum();
        assert!(
            payload <= config.serialization_max_chunk_size + 64,
            "chunk overshoots the limit: {payload}"
        );
        rebuilt.extend(sadd.args[1..].iter().cloned());
    }
    assert_eq!(rebuilt, members, "re-issued members rebuild the source set");

    // TTL travels as a separate record after chunked emission.
    let pexire = entries
        .iter()
        .find(|e| e.cmd == "PEXIRE")
        .expect("chunked values carry expiry separately");
    assert_eq!(pexire.args[1], Bytes::from_static(b"123456"));
}

#[test]
fn large_zset_keeps_score_member_pairs_whole() {
    let mut shard = new_shard();
    let keys = keys_for_slot(11, 1);
    let key = keys[0].as_bytes();

    let members: Vec<(f64, Bytes)> = (0..3000)
        .map(|i| {
            (
                i as f64,
                Bytes::from(format!("zmember-{i:05}-padding-pad").into_bytes()),
            )
        })
        .collect();
    shard.set_value(0, key, PrimeValue::new(ValueKind::ZSet(members.clone())));

    let sink = MemorySink::new();
    shard
        .start_slot_migration(
            SlotSet::from_slots([11]),
            Box::new(sink.clone()),
            &replication_config(),
        )
        .unwrap();
    shard.run_migration_scan();
    shard.cancel_migration();

    let entries = parse_stream(&sink.bytes());
    let zadds: Vec<&Entry> = entries.iter().filter(|e| e.cmd == "ZADD").collect();
    assert!(zadds.len() >= 2);

    let mut rebuilt = Vec::new();
    for zadd in &zadds {
        let members = &zadd.args[1..];
        assert_eq!(members.len() % 2, 0, "score/member pairs are never split");
        for pair in members.chunks_exact(2) {
            let score: f64 = std::str::from_utf8(&pair[0]).unwrap().parse().unwrap();
            rebuilt.push((score, pair[1].clone()));
        }
    }
    rebuilt.sort_by(|a, b| a.0.total_cmp(&b.0));
    assert_eq!(rebuilt, members);
}

#[test]
fn empty_slot_set_produces_only_the_finalize_marker() {
    let mut shard = new_shard();
    for key in keys_for_slot(3, 20) {
        shard.set(0, key.as_bytes(), b"data");
    }

    let sink = MemorySink::new();
    shard
        .start_slot_migration(SlotSet::new(), Box::new(sink.clone()), &replication_config())
        .unwrap();
    shard.run_migration_scan();
    shard.finalize_migration(7);
    shard.cancel_migration();

    let entries = parse_stream(&sink.bytes());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].opcode, Op::Lsn);
    assert_eq!(entries[0].lsn, 7);
}

#[test]
fn flush_during_migration_aborts_and_shuts_down_the_sink() {
    let mut shard = new_shard();
    for key in keys_for_slot(5, 10) {
        shard.set(0, key.as_bytes(), b"data");
    }

    let sink = MemorySink::new();
    let cntx = shard
        .start_slot_migration(
            SlotSet::from_slots([5]),
            Box::new(sink.clone()),
            &replication_config(),
        )
        .unwrap();
    shard.run_migration_scan();

    shard.flush_db(0);
    assert!(cntx.has_error(), "flush during migration must abort it");
    assert!(
        cntx.error().unwrap().contains("FLUSH"),
        "error names the flush"
    );

    // The sink teardown happens on the writer thread.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !sink.was_shut_down() {
        assert!(std::time::Instant::now() < deadline, "sink was not torn down");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    shard.cancel_migration();
}
