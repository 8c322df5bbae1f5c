//! Shared harness for integration tests: tracing setup, tiered config
//! helpers, controllable stream sinks, and journal-frame parsing.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once};

use bytes::Bytes;
use ember_store::config::{ReplicationConfig, TieredConfig};
use ember_store::journal::serializer::read_entry;
use ember_store::journal::streamer::StreamSink;
use ember_store::journal::types::Entry;
use ember_store::slots::{key_slot, SlotId};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn tiered_config(dir: &std::path::Path) -> TieredConfig {
    TieredConfig {
        prefix: dir.join("tiered").display().to_string(),
        max_file_size: 1 << 24,
        ..TieredConfig::default()
    }
}

pub fn replication_config() -> ReplicationConfig {
    ReplicationConfig {
        timeout_ms: 30_000,
        output_limit: 64 * 1024,
        serialization_max_chunk_size: 32 * 1024,
    }
}

/// Sink collecting every written byte.
#[derive(Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn was_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl StreamSink for MemorySink {
    fn write_bufs(&mut self, bufs: &[Bytes]) -> std::io::Result<()> {
        let mut data = self.data.lock().unwrap();
        for buf in bufs {
            data.extend_from_slice(buf);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Sink whose writes block while the gate is closed.
#[derive(Clone)]
pub struct GateSink {
    gate: Arc<(Mutex<bool>, Condvar)>,
    data: Arc<Mutex<Vec<u8>>>,
}

impl GateSink {
    /// A closed gate stalls every write until `open` is called.
    pub fn closed() -> Self {
        Self {
            gate: Arc::new((Mutex::new(false), Condvar::new())),
            data: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn open(&self) {
        let (lock, cvar) = &*self.gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl StreamSink for GateSink {
    fn write_bufs(&mut self, bufs: &[Bytes]) -> std::io::Result<()> {
        let (lock, cvar) = &*self.gate;
        let mut opened = lock.lock().unwrap();
        while !*opened {
            opened = cvar.wait(opened).unwrap();
        }
        drop(opened);

        let mut data = self.data.lock().unwrap();
        for buf in bufs {
            data.extend_from_slice(buf);
        }
        Ok(())
    }
}

/// Parse a concatenated journal byte stream back into entries.
pub fn parse_stream(mut data: &[u8]) -> Vec<Entry> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        entries.push(read_entry(&mut data).expect("well-formed journal stream"));
    }
    entries
}

/// A hash-tag whose slot equals `slot`, found by brute force.
pub fn tag_for_slot(slot: SlotId) -> String {
    for i in 0..1_000_000u32 {
        let tag = format!("t{i}");
        if key_slot(tag.as_bytes()) == slot {
            return tag;
        }
    }
    panic!("no tag found for slot {slot}");
}

/// Keys `{tag}:0..count` routed to `slot` via their hash tag.
pub fn keys_for_slot(slot: SlotId, count: usize) -> Vec<String> {
    let tag = tag_for_slot(slot);
    (0..count).map(|i| format!("{{{tag}}}:{i}")).collect()
}
