//! Journal streamer: buffers journal records for one consumer and writes
//! them to a sink on a dedicated writer thread, applying back-pressure to the
//! producing shard when the sink is slow.
//!
//! Ordering: writes are serialized through the in-flight/pending protocol, so
//! the sink observes records exactly in journal append order. While a write
//! is in flight new records accumulate in `pending_buf`; the completion
//! flushes it as the next write.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::ReplicationConfig;
use crate::context::ExecutionContext;
use crate::journal::serializer;
use crate::journal::types::{Entry, JournalItem, Op};
use crate::journal::{ChangeCallback, JournalSlice};

/// Interval between LSN heartbeat records.
const LSN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
/// Poll period while draining in-flight bytes on cancel.
const INFLIGHT_DRAIN_POLL: Duration = Duration::from_secs(1);

/// Destination of a streamer. Writes happen on the streamer's writer thread.
pub trait StreamSink: Send {
    fn write_bufs(&mut self, bufs: &[Bytes]) -> std::io::Result<()>;

    /// Tear down the connection; used when a migration aborts.
    fn shutdown(&mut self) {}
}

impl StreamSink for std::net::TcpStream {
    fn write_bufs(&mut self, bufs: &[Bytes]) -> std::io::Result<()> {
        use std::io::Write;
        for buf in bufs {
            self.write_all(buf)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = std::net::TcpStream::shutdown(self, std::net::Shutdown::Both);
    }
}

/// Per-item filter installed by derived streamers; false drops the record.
pub type ItemFilter = Arc<dyn Fn(&JournalItem) -> bool + Send + Sync>;

#[derive(Default)]
struct StreamerState {
    pending_buf: Vec<u8>,
    in_flight_bytes: usize,
    total_sent: u64,
}

struct StreamerShared {
    state: Mutex<StreamerState>,
    waker: Condvar,
    cntx: ExecutionContext,
    output_limit: usize,
    timeout: Duration,
}

impl StreamerShared {
    fn stalled(&self, state: &StreamerState) -> bool {
        state.in_flight_bytes + state.pending_buf.len() >= self.output_limit
    }
}

enum WriterJob {
    Write { bufs: Vec<Bytes>, len: usize },
    ShutdownSink,
    Quit,
}

/// Write-side machinery shared by the journal and restore streamers.
pub(crate) struct StreamerCore {
    shared: Arc<StreamerShared>,
    tx: mpsc::Sender<WriterJob>,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl StreamerCore {
    pub(crate) fn new(
        sink: Box<dyn StreamSink>,
        cntx: ExecutionContext,
        config: &ReplicationConfig,
    ) -> anyhow::Result<Self> {
        let shared = Arc::new(StreamerShared {
            state: Mutex::new(StreamerState::default()),
            waker: Condvar::new(),
            cntx,
            output_limit: config.output_limit,
            timeout: Duration::from_millis(config.timeout_ms),
        });
        let (tx, rx) = mpsc::channel();
        let writer_shared = shared.clone();
        let writer = thread::Builder::new()
            .name("ember-stream-writer".to_string())
            .spawn(move || writer_loop(sink, writer_shared, rx))
            .map_err(|err| anyhow::anyhow!("spawn stream writer: {err}"))?;
        Ok(Self {
            shared,
            tx,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub(crate) fn context(&self) -> &ExecutionContext {
        &self.shared.cntx
    }

    /// Hand a record to the sink, preserving order: append to the pending
    /// buffer while a write is in flight, otherwise combine pending and the
    /// new record into a two-buffer write.
    pub(crate) fn write(&self, data: &[u8]) {
        debug_assert!(!data.is_empty());
        let job = {
            let mut state = self.shared.state.lock().expect("streamer state lock");
            if state.in_flight_bytes > 0 {
                state.pending_buf.extend_from_slice(data);
                return;
            }

            let mut bufs = Vec::with_capacity(2);
            let mut total = data.len();
            if !state.pending_buf.is_empty() {
                let pending = std::mem::take(&mut state.pending_buf);
                total += pending.len();
                bufs.push(Bytes::from(pending));
            }
            bufs.push(Bytes::copy_from_slice(data));
            state.in_flight_bytes += total;
            state.total_sent += total as u64;
            WriterJob::Write { bufs, len: total }
        };
        let _ = self.tx.send(job);
    }

    /// Block the producing thread while the output buffer is above the
    /// limit. A timeout reports `stream timeout` to the context.
    pub(crate) fn throttle_if_needed(&self) {
        if self.shared.cntx.is_stopped() || !self.is_stalled() {
            return;
        }

        let state = self.shared.state.lock().expect("streamer state lock");
        let (inflight_start, sent_start) = (state.in_flight_bytes, state.total_sent);
        let (state, result) = self
            .shared
            .waker
            .wait_timeout_while(state, self.shared.timeout, |state| {
                self.shared.stalled(state) && !self.shared.cntx.is_stopped()
            })
            .expect("streamer state lock");
        if result.timed_out() {
            tracing::warn!(
                inflight_start,
                sent_start,
                inflight = state.in_flight_bytes,
                sent = state.total_sent,
                "stream stalled past the replication timeout"
            );
            drop(state);
            self.shared.cntx.report_error("stream timeout");
        }
    }

    pub(crate) fn wait_for_inflight_to_complete(&self) {
        loop {
            let state = self.shared.state.lock().expect("streamer state lock");
            if state.in_flight_bytes == 0 {
                return;
            }
            let (state, result) = self
                .shared
                .waker
                .wait_timeout_while(state, INFLIGHT_DRAIN_POLL, |state| {
                    state.in_flight_bytes > 0
                })
                .expect("streamer state lock");
            if result.timed_out() {
                tracing::warn!(
                    in_flight = state.in_flight_bytes,
                    "still waiting for inflight bytes"
                );
            } else {
                return;
            }
        }
    }

    pub(crate) fn notify_all(&self) {
        self.shared.waker.notify_all();
    }

    pub(crate) fn shutdown_sink(&self) {
        let _ = self.tx.send(WriterJob::ShutdownSink);
    }

    pub(crate) fn join_writer(&self) {
        let _ = self.tx.send(WriterJob::Quit);
        if let Some(handle) = self.writer.lock().expect("writer handle lock").take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn is_stalled(&self) -> bool {
        let state = self.shared.state.lock().expect("streamer state lock");
        self.shared.stalled(&state)
    }

    pub(crate) fn total_sent(&self) -> u64 {
        self.shared.state.lock().expect("streamer state lock").total_sent
    }

    /// In-flight plus buffered bytes.
    pub(crate) fn buffered_bytes(&self) -> usize {
        let state = self.shared.state.lock().expect("streamer state lock");
        state.in_flight_bytes + state.pending_buf.len()
    }
}

fn writer_loop(
    mut sink: Box<dyn StreamSink>,
    shared: Arc<StreamerShared>,
    rx: mpsc::Receiver<WriterJob>,
) {
    while let Ok(job) = rx.recv() {
        match job {
            WriterJob::Quit => return,
            WriterJob::ShutdownSink => sink.shutdown(),
            WriterJob::Write { bufs, len } => {
                let mut next = Some((bufs, len));
                while let Some((bufs, len)) = next.take() {
                    let result = sink.write_bufs(&bufs);
                    next = complete_write(&shared, result, len);
                }
            }
        }
    }
}

/// Apply a write completion: account the bytes, report errors, and flush the
/// pending buffer when the pipe drained.
fn complete_write(
    shared: &StreamerShared,
    result: std::io::Result<()>,
    len: usize,
) -> Option<(Vec<Bytes>, usize)> {
    let mut state = shared.state.lock().expect("streamer state lock");
    debug_assert!(state.in_flight_bytes >= len);
    state.in_flight_bytes -= len;

    let mut next = None;
    match result {
        Err(err) => {
            if !shared.cntx.is_stopped() {
                shared.cntx.report_error(format!("stream write failed: {err}"));
            }
        }
        Ok(()) => {
            if state.in_flight_bytes == 0
                && !state.pending_buf.is_empty()
                && !shared.cntx.is_stopped()
            {
                let pending = std::mem::take(&mut state.pending_buf);
                let len = pending.len();
                state.in_flight_bytes += len;
                state.total_sent += len as u64;
                next = Some((vec![Bytes::from(pending)], len));
            }
        }
    }
    drop(state);
    shared.waker.notify_all();
    next
}

/// Replication streamer: subscribes to the journal and relays every record.
pub struct JournalStreamer {
    core: Arc<StreamerCore>,
    journal: Arc<JournalSlice>,
    cb_id: Option<u32>,
}

impl JournalStreamer {
    pub fn new(
        journal: Arc<JournalSlice>,
        cntx: ExecutionContext,
        config: &ReplicationConfig,
        sink: Box<dyn StreamSink>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            core: Arc::new(StreamerCore::new(sink, cntx, config)?),
            journal,
            cb_id: None,
        })
    }

    pub(crate) fn core(&self) -> &Arc<StreamerCore> {
        &self.core
    }

    pub fn start(&mut self, send_lsn: bool) {
        self.start_filtered(send_lsn, None);
    }

    /// Register the journal subscription. `filter` lets derived streamers
    /// drop records; records it rejects still count for back-pressure waits.
    pub(crate) fn start_filtered(&mut self, send_lsn: bool, filter: Option<ItemFilter>) {
        debug_assert!(self.cb_id.is_none());
        let core = self.core.clone();
        let last_lsn_time: Mutex<Option<Instant>> = Mutex::new(None);
        let cb: ChangeCallback = Arc::new(move |item: &JournalItem, allow_await: bool| {
            if allow_await {
                core.throttle_if_needed();
            }
            // A NOOP exists only to trigger the await above.
            if item.opcode == Op::Noop {
                return;
            }
            if let Some(filter) = &filter {
                if !filter(item) {
                    return;
                }
            }

            core.write(&item.data);

            if send_lsn {
                let mut last = last_lsn_time.lock().expect("lsn heartbeat lock");
                let due = last.map_or(true, |at| at.elapsed() >= LSN_HEARTBEAT_INTERVAL);
                if due {
                    *last = Some(Instant::now());
                    drop(last);
                    core.write(&serializer::serialize_entry(&Entry::lsn(item.lsn)));
                }
            }
        });
        self.cb_id = Some(self.journal.register_on_change(cb));
    }

    /// Wake all throttled producers, unregister, and drain in-flight writes.
    /// The wake must come first: a producer throttling inside the journal
    /// callback holds the callback lock that unregistration needs.
    pub fn cancel(&mut self) {
        tracing::debug!("journal streamer cancel");
        self.core.notify_all();
        if let Some(id) = self.cb_id.take() {
            self.journal.unregister_on_change(id);
        }
        self.core.wait_for_inflight_to_complete();
        self.core.join_writer();
    }

    pub fn throttle_if_needed(&self) {
        self.core.throttle_if_needed();
    }

    pub fn total_sent(&self) -> u64 {
        self.core.total_sent()
    }

    /// In-flight plus pending bytes, the back-pressure measure.
    pub fn buffered_bytes(&self) -> usize {
        self.core.buffered_bytes()
    }

    pub fn is_stalled(&self) -> bool {
        self.core.is_stalled()
    }
}

impl Drop for JournalStreamer {
    fn drop(&mut self) {
        if let Some(id) = self.cb_id.take() {
            self.journal.unregister_on_change(id);
        }
        self.core.join_writer();
    }
}
