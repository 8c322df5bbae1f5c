//! Page-addressed scratch file with a dedicated I/O worker thread.
//!
//! Allocation is synchronous and shard-local (watermark plus a free list at
//! page granularity). Reads and writes are shipped to the worker over an mpsc
//! channel; completions are posted to a queue the shard drains at its
//! suspension points. The file's content is scratch and is not expected to
//! survive a restart.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;

/// Disk allocation granularity.
pub const PAGE_SIZE: usize = 4096;

/// A slice of the backing file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DiskSegment {
    pub offset: u64,
    pub len: u32,
}

impl DiskSegment {
    pub fn new(offset: u64, len: u32) -> Self {
        Self { offset, len }
    }

    /// The page-aligned run of pages enclosing this segment.
    pub fn containing_pages(&self) -> DiskSegment {
        let start = self.offset - self.offset % PAGE_SIZE as u64;
        let end = self.offset + self.len as u64;
        let end = end.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        DiskSegment {
            offset: start,
            len: (end - start) as u32,
        }
    }

    /// Whether the segment is a whole-page run.
    pub fn is_page_aligned(&self) -> bool {
        self.offset % PAGE_SIZE as u64 == 0 && self.len as usize % PAGE_SIZE == 0
    }
}

/// Smallest value that takes whole pages of its own instead of sharing a
/// small bin.
pub const MIN_OCCUPANCY_SIZE: usize = PAGE_SIZE / 2;

pub fn occupies_whole_pages(len: usize) -> bool {
    len >= MIN_OCCUPANCY_SIZE
}

pub fn pages_for(len: usize) -> u64 {
    (len.max(1) as u64).div_ceil(PAGE_SIZE as u64)
}

enum IoCmd {
    Write {
        token: u64,
        offset: u64,
        buf: Bytes,
    },
    Read {
        token: u64,
        segment: DiskSegment,
    },
    Shutdown,
}

/// Completion posted by the worker thread.
pub enum IoCompletion {
    WriteDone {
        token: u64,
        result: std::io::Result<()>,
    },
    ReadDone {
        token: u64,
        result: std::io::Result<Vec<u8>>,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DiskStats {
    pub allocated_bytes: u64,
    pub capacity_bytes: u64,
    pub max_file_size: u64,
}

/// Page allocator: bump watermark with a coalescing free list.
struct PageAllocator {
    max_file_size: u64,
    /// First never-allocated byte offset.
    watermark: u64,
    /// Free runs: offset -> byte length, non-adjacent (coalesced on free).
    free: BTreeMap<u64, u64>,
    allocated_bytes: u64,
}

impl PageAllocator {
    fn new(max_file_size: u64) -> Self {
        Self {
            max_file_size,
            watermark: 0,
            free: BTreeMap::new(),
            allocated_bytes: 0,
        }
    }

    fn allocate(&mut self, len: usize) -> Option<u64> {
        let bytes = pages_for(len) * PAGE_SIZE as u64;
        // First fit from the free list.
        if let Some((&offset, &run)) = self.free.iter().find(|(_, run)| **run >= bytes) {
            self.free.remove(&offset);
            if run > bytes {
                self.free.insert(offset + bytes, run - bytes);
            }
            self.allocated_bytes += bytes;
            return Some(offset);
        }
        if self.watermark + bytes > self.max_file_size {
            return None;
        }
        let offset = self.watermark;
        self.watermark += bytes;
        self.allocated_bytes += bytes;
        Some(offset)
    }

    fn free(&mut self, segment: DiskSegment) {
        let pages = segment.containing_pages();
        debug_assert!(pages.offset + pages.len as u64 <= self.watermark);
        self.allocated_bytes = self.allocated_bytes.saturating_sub(pages.len as u64);

        let mut offset = pages.offset;
        let mut len = pages.len as u64;
        // Merge with the preceding run.
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                len += prev_len;
            }
        }
        // Merge with the following run.
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            len += next_len;
        }
        self.free.insert(offset, len);
    }

    fn stats(&self) -> DiskStats {
        DiskStats {
            allocated_bytes: self.allocated_bytes,
            capacity_bytes: self.watermark,
            max_file_size: self.max_file_size,
        }
    }
}

/// The per-shard backing store.
pub struct PageStore {
    path: PathBuf,
    /// Handle used for synchronous reads on the shard thread.
    file: File,
    allocator: PageAllocator,
    cmd_tx: mpsc::Sender<IoCmd>,
    completion_rx: mpsc::Receiver<IoCompletion>,
    worker: Option<thread::JoinHandle<()>>,
}

impl PageStore {
    pub fn open(path: impl AsRef<Path>, max_file_size: u64) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open tiered file {}", path.display()))?;

        let worker_file = file.try_clone().context("clone tiered file handle")?;
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (completion_tx, completion_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("ember-tiered-io".to_string())
            .spawn(move || io_worker(worker_file, cmd_rx, completion_tx))
            .context("spawn tiered io thread")?;

        Ok(Self {
            path,
            file,
            allocator: PageAllocator::new(max_file_size),
            cmd_tx,
            completion_rx,
            worker: Some(worker),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> DiskStats {
        self.allocator.stats()
    }

    /// Reserve whole pages for `len` bytes. None when the file would overflow.
    pub fn allocate(&mut self, len: usize) -> Option<DiskSegment> {
        self.allocator
            .allocate(len)
            .map(|offset| DiskSegment::new(offset, len as u32))
    }

    /// Release the page run containing `segment`.
    pub fn mark_free(&mut self, segment: DiskSegment) {
        self.allocator.free(segment);
    }

    pub fn submit_write(&self, token: u64, offset: u64, buf: Bytes) {
        let _ = self.cmd_tx.send(IoCmd::Write { token, offset, buf });
    }

    pub fn submit_read(&self, token: u64, segment: DiskSegment) {
        let _ = self.cmd_tx.send(IoCmd::Read { token, segment });
    }

    pub fn try_recv_completion(&self) -> Option<IoCompletion> {
        self.completion_rx.try_recv().ok()
    }

    pub fn recv_completion_timeout(&self, timeout: Duration) -> Option<IoCompletion> {
        self.completion_rx.recv_timeout(timeout).ok()
    }

    /// Positioned read on the shard thread, bypassing the worker. Used by the
    /// restore snapshot which may not suspend per entry.
    pub fn read_sync(&self, segment: DiskSegment) -> anyhow::Result<Bytes> {
        let mut buf = vec![0u8; segment.len as usize];
        self.file
            .read_exact_at(&mut buf, segment.offset)
            .with_context(|| format!("read segment at {}", segment.offset))?;
        Ok(Bytes::from(buf))
    }

    pub fn close(&mut self) {
        let _ = self.cmd_tx.send(IoCmd::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.close();
        }
    }
}

fn io_worker(file: File, rx: mpsc::Receiver<IoCmd>, tx: mpsc::Sender<IoCompletion>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            IoCmd::Write { token, offset, buf } => {
                let result = file.write_all_at(&buf, offset);
                if let Err(err) = &result {
                    tracing::warn!(error = ?err, offset, "tiered write failed");
                }
                if tx.send(IoCompletion::WriteDone { token, result }).is_err() {
                    return;
                }
            }
            IoCmd::Read { token, segment } => {
                let mut buf = vec![0u8; segment.len as usize];
                let result = file
                    .read_exact_at(&mut buf, segment.offset)
                    .map(move |()| buf);
                if let Err(err) = &result {
                    tracing::warn!(error = ?err, offset = segment.offset, "tiered read failed");
                }
                if tx.send(IoCompletion::ReadDone { token, result }).is_err() {
                    return;
                }
            }
            IoCmd::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containing_pages_rounds_out() {
        let seg = DiskSegment::new(4096 + 100, 50);
        let pages = seg.containing_pages();
        assert_eq!(pages.offset, 4096);
        assert_eq!(pages.len, 4096);

        let large = DiskSegment::new(8192, 5000);
        let pages = large.containing_pages();
        assert_eq!(pages.offset, 8192);
        assert_eq!(pages.len, 8192);
    }

    #[test]
    fn allocator_reuses_freed_runs() {
        let mut alloc = PageAllocator::new(16 * PAGE_SIZE as u64);
        let a = alloc.allocate(5000).unwrap(); // 2 pages
        let b = alloc.allocate(100).unwrap(); // 1 page
        assert_eq!(a, 0);
        assert_eq!(b, 2 * PAGE_SIZE as u64);
        assert_eq!(alloc.stats().allocated_bytes, 3 * PAGE_SIZE as u64);

        alloc.free(DiskSegment::new(a, 5000));
        let c = alloc.allocate(4096).unwrap();
        assert_eq!(c, 0, "freed run is reused first");
        assert_eq!(alloc.stats().allocated_bytes, 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn allocator_refuses_overflow() {
        let mut alloc = PageAllocator::new(2 * PAGE_SIZE as u64);
        assert!(alloc.allocate(PAGE_SIZE).is_some());
        assert!(alloc.allocate(PAGE_SIZE).is_some());
        assert!(alloc.allocate(1).is_none());
    }

    #[test]
    fn free_list_coalesces_neighbors() {
        let mut alloc = PageAllocator::new(16 * PAGE_SIZE as u64);
        let a = alloc.allocate(PAGE_SIZE).unwrap();
        let b = alloc.allocate(PAGE_SIZE).unwrap();
        let c = alloc.allocate(PAGE_SIZE).unwrap();
        alloc.free(DiskSegment::new(a, PAGE_SIZE as u32));
        alloc.free(DiskSegment::new(c, PAGE_SIZE as u32));
        alloc.free(DiskSegment::new(b, PAGE_SIZE as u32));
        // One merged run serves a 3-page request.
        assert_eq!(alloc.allocate(3 * PAGE_SIZE), Some(0));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path().join("tiered0"), 1 << 20).unwrap();
        let seg = store.allocate(11).unwrap();
        store.submit_write(1, seg.offset, Bytes::from_static(b"hello pages"));
        match store.recv_completion_timeout(Duration::from_secs(5)) {
            Some(IoCompletion::WriteDone { token: 1, result }) => result.unwrap(),
            other => panic!("unexpected completion: {}", completion_name(&other)),
        }

        store.submit_read(2, seg);
        match store.recv_completion_timeout(Duration::from_secs(5)) {
            Some(IoCompletion::ReadDone { token: 2, result }) => {
                assert_eq!(result.unwrap(), b"hello pages");
            }
            other => panic!("unexpected completion: {}", completion_name(&other)),
        }

        assert_eq!(store.read_sync(seg).unwrap(), Bytes::from_static(b"hello pages"));
        store.close();
    }

    fn completion_name(completion: &Option<IoCompletion>) -> &'static str {
        match completion {
            None => "none",
            Some(IoCompletion::WriteDone { .. }) => "write",
            Some(IoCompletion::ReadDone { .. }) => "read",
        }
    }
}
