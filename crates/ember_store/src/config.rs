//! Runtime knobs with environment-variable overrides (`EMBER_*`).

use std::env;
use std::str::FromStr;

/// Tiered storage knobs.
#[derive(Clone, Debug)]
pub struct TieredConfig {
    /// Minimum memory budget above which hot-uploads occur.
    pub memory_margin: usize,
    /// Maximum number of concurrent stash requests.
    pub write_depth: usize,
    /// Per-shard low-water ratio of the memory limit.
    pub low_memory_factor: f64,
    /// Use the intermediate cooling layer when offloading.
    pub experimental_cooling: bool,
    /// Backing file path prefix; the shard id is appended.
    pub prefix: String,
    /// Maximum size of the backing file.
    pub max_file_size: u64,
    /// Per-shard memory limit used to derive the low-memory watermark.
    pub memory_limit: usize,
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self {
            memory_margin: read_env_usize("EMBER_TIERED_MEMORY_MARGIN", 10 * 1024 * 1024),
            write_depth: read_env_usize("EMBER_TIERED_WRITE_DEPTH", 50),
            low_memory_factor: read_env_f64("EMBER_TIERED_LOW_MEMORY_FACTOR", 0.1),
            experimental_cooling: read_env_bool("EMBER_TIERED_COOLING", true),
            prefix: env::var("EMBER_TIERED_PREFIX").unwrap_or_default(),
            max_file_size: read_env_u64("EMBER_TIERED_MAX_FILE_SIZE", 1 << 30),
            memory_limit: read_env_usize("EMBER_TIERED_MEMORY_LIMIT", 256 * 1024 * 1024),
        }
    }
}

impl TieredConfig {
    pub fn memory_low_limit(&self) -> usize {
        (self.memory_limit as f64 * self.low_memory_factor) as usize
    }
}

/// Replication streamer knobs.
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    /// Milliseconds to wait for stuck replication writes.
    pub timeout_ms: u64,
    /// Output buffer threshold applying back-pressure.
    pub output_limit: usize,
    /// Byte threshold above which container values are re-issued as chunked
    /// native commands instead of one RESTORE; 0 disables chunking.
    pub serialization_max_chunk_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: read_env_u64("EMBER_REPLICATION_TIMEOUT_MS", 30_000),
            output_limit: read_env_usize("EMBER_REPLICATION_OUTPUT_LIMIT", 64 * 1024),
            serialization_max_chunk_size: read_env_usize(
                "EMBER_SERIALIZATION_MAX_CHUNK_SIZE",
                32 * 1024,
            ),
        }
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| f64::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}
