//! Chunked append-only log storage.
//!
//! The log is the concatenation of fixed-size chunk files under
//! `<log>/operations/`, named by chunk index. Two 8-byte little-endian marker
//! files sit beside them: `size` (logical persistent end offset) and `start`
//! (logical begin offset, advanced by truncation). Only the tail chunk is
//! ever written in steady state.
//!
//! # Append protocol
//!
//! [`LogStorage::append_reservation`] reserves descriptor space with a single
//! atomic fetch-add and hands back a [`WriteSlot`] at a known absolute
//! position. The producer serializes off the critical path and submits the
//! finished descriptor to a bounded queue drained by a small worker pool;
//! when the queue is full the producer performs the write inline. A slot
//! dropped unfilled stores the torn-write marker (negated head byte) so
//! readers classify the record as `Incomplete` instead of tripping over
//! garbage.
//!
//! `emerging_size` (the reservation front) runs ahead of `size` (the
//! contiguous prefix of closed reservations) until every earlier slot closes.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use vfsr_error::{Result, VfsrError};
use vfsr_types::{LogPos, RecoveryTunables};

use crate::codec::{
    classify_head, descriptor_len, torn_head_byte, HeadByte, OpMask, OperationReadResult,
    VfsOperation, MAX_TAG,
};

/// Name of the chunk directory under the log root.
pub const OPERATIONS_DIR: &str = "operations";
/// Marker file holding the logical persistent end offset.
pub const SIZE_MARKER: &str = "size";
/// Marker file holding the logical begin offset.
pub const START_MARKER: &str = "start";

const WORKER_COUNT: usize = 2;

/// Open mode for a [`LogStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Reads only; `append_reservation` and truncation fail.
    ReadOnly,
    /// Full append/read access; spawns the write worker pool.
    Writable,
}

/// Storage construction knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    /// On-disk chunk granularity in bytes.
    pub chunk_size: u64,
    /// Bounded submission-channel capacity; a full channel makes the
    /// submitter write inline.
    pub write_buffer_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024 * 1024,
            write_buffer_capacity: 5_000,
        }
    }
}

impl LogConfig {
    #[must_use]
    pub fn from_tunables(tunables: &RecoveryTunables) -> Self {
        Self {
            chunk_size: tunables.log_chunk_size,
            write_buffer_capacity: tunables.log_write_buffer_capacity,
        }
    }
}

/// Append-path counters, snapshotted by [`LogStorage::append_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendStats {
    pub reservations: u64,
    pub queued_writes: u64,
    /// Writes the submitter ran synchronously because the channel was full.
    pub inline_writes: u64,
    pub torn_writes: u64,
}

struct ChunkSet {
    dir: PathBuf,
    chunk_size: u64,
    writable: bool,
    files: RwLock<HashMap<u64, Arc<File>>>,
}

impl ChunkSet {
    fn chunk(&self, index: u64) -> Result<Arc<File>> {
        if let Some(file) = self.files.read().get(&index) {
            return Ok(Arc::clone(file));
        }

        let path = self.dir.join(index.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(self.writable)
            .create(self.writable)
            .open(&path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    VfsrError::NotFound(format!("log chunk {index} missing at {}", path.display()))
                }
                _ => VfsrError::Io(err),
            })?;
        if self.writable && file.metadata()?.len() < self.chunk_size {
            file.set_len(self.chunk_size)?;
        }

        let file = Arc::new(file);
        self.files
            .write()
            .entry(index)
            .or_insert_with(|| Arc::clone(&file));
        Ok(file)
    }

    fn read_exact_at(&self, mut pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0_usize;
        while filled < buf.len() {
            let index = pos / self.chunk_size;
            let offset = pos % self.chunk_size;
            let available = usize::try_from(self.chunk_size - offset)
                .map_err(|_| VfsrError::Format("chunk span does not fit usize".to_owned()))?;
            let take = available.min(buf.len() - filled);
            self.chunk(index)?
                .read_exact_at(&mut buf[filled..filled + take], offset)?;
            filled += take;
            pos = pos
                .checked_add(take as u64)
                .ok_or_else(|| VfsrError::Format("log position overflow".to_owned()))?;
        }
        Ok(())
    }

    fn write_all_at(&self, mut pos: u64, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let index = pos / self.chunk_size;
            let offset = pos % self.chunk_size;
            let available = usize::try_from(self.chunk_size - offset)
                .map_err(|_| VfsrError::Format("chunk span does not fit usize".to_owned()))?;
            let take = available.min(bytes.len());
            self.chunk(index)?.write_all_at(&bytes[..take], offset)?;
            bytes = &bytes[take..];
            pos = pos
                .checked_add(take as u64)
                .ok_or_else(|| VfsrError::Format("log position overflow".to_owned()))?;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        for file in self.files.read().values() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn drop_chunks_below(&self, index: u64) {
        let mut files = self.files.write();
        files.retain(|&i, _| i >= index);
        drop(files);
        // Removing already-dropped chunk files is advisory.
        for i in 0..index {
            let path = self.dir.join(i.to_string());
            if path.exists() {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(target: "vfsr::log", chunk = i, %err, "failed to remove dropped chunk");
                }
            }
        }
    }
}

struct WriteJob {
    pos: u64,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct CommitWindow {
    /// Largest offset below which every reservation has closed.
    frontier: u64,
    /// Closed spans not yet contiguous with the frontier: start -> end.
    closed: BTreeMap<u64, u64>,
}

struct LogInner {
    chunks: ChunkSet,
    start: AtomicU64,
    emerging: AtomicU64,
    window: Mutex<CommitWindow>,
    window_cv: Condvar,
    queue: Mutex<VecDeque<WriteJob>>,
    queue_cv: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
    first_error: Mutex<Option<VfsrError>>,
    reservations: AtomicU64,
    queued_writes: AtomicU64,
    inline_writes: AtomicU64,
    torn_writes: AtomicU64,
}

impl LogInner {
    fn perform_write(&self, job: &WriteJob) {
        let end = job.pos.saturating_add(job.bytes.len() as u64);
        if let Err(err) = self.chunks.write_all_at(job.pos, &job.bytes) {
            warn!(target: "vfsr::log", pos = job.pos, %err, "log write failed");
            let mut slot = self.first_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        // Failed spans close too: the frontier must not wedge, and the error
        // surfaces from flush/close.
        self.mark_closed(job.pos, end);
    }

    fn mark_closed(&self, pos: u64, end: u64) {
        let mut window = self.window.lock();
        window.closed.insert(pos, end);
        while let Some((&first_pos, &first_end)) = window.closed.iter().next() {
            if first_pos != window.frontier {
                break;
            }
            window.frontier = first_end;
            window.closed.remove(&first_pos);
        }
        self.window_cv.notify_all();
    }

    fn worker_loop(self: &Arc<Self>) {
        loop {
            let job = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(job) = queue.pop_front() {
                        break job;
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    self.queue_cv.wait(&mut queue);
                }
            };
            self.perform_write(&job);
        }
    }
}

/// Durable append-only record log. See the module docs for the protocol.
pub struct LogStorage {
    inner: Arc<LogInner>,
    workers: Vec<JoinHandle<()>>,
    mode: OpenMode,
}

impl LogStorage {
    /// Open the log rooted at `log_dir` (the directory containing
    /// `operations/`). Missing marker files read as zero; a writable open
    /// creates the directory tree.
    pub fn open(log_dir: &Path, mode: OpenMode, config: LogConfig) -> Result<Self> {
        let ops_dir = log_dir.join(OPERATIONS_DIR);
        if mode == OpenMode::Writable {
            std::fs::create_dir_all(&ops_dir)?;
        } else if !ops_dir.is_dir() {
            return Err(VfsrError::NotFound(format!(
                "log operations directory missing at {}",
                ops_dir.display()
            )));
        }

        let size = read_marker(&ops_dir.join(SIZE_MARKER))?.unwrap_or(0);
        let start = read_marker(&ops_dir.join(START_MARKER))?.unwrap_or(0);
        if start > size {
            return Err(VfsrError::Format(format!(
                "log start offset {start} exceeds size {size}"
            )));
        }

        let inner = Arc::new(LogInner {
            chunks: ChunkSet {
                dir: ops_dir,
                chunk_size: config.chunk_size,
                writable: mode == OpenMode::Writable,
                files: RwLock::new(HashMap::new()),
            },
            start: AtomicU64::new(start),
            emerging: AtomicU64::new(size),
            window: Mutex::new(CommitWindow {
                frontier: size,
                closed: BTreeMap::new(),
            }),
            window_cv: Condvar::new(),
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            capacity: config.write_buffer_capacity,
            shutdown: AtomicBool::new(false),
            first_error: Mutex::new(None),
            reservations: AtomicU64::new(0),
            queued_writes: AtomicU64::new(0),
            inline_writes: AtomicU64::new(0),
            torn_writes: AtomicU64::new(0),
        });

        let workers = if mode == OpenMode::Writable {
            (0..WORKER_COUNT)
                .map(|i| {
                    let inner = Arc::clone(&inner);
                    std::thread::Builder::new()
                        .name(format!("vfsr-log-writer-{i}"))
                        .spawn(move || inner.worker_loop())
                        .map_err(VfsrError::Io)
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        debug!(
            target: "vfsr::log",
            dir = %log_dir.display(),
            ?mode,
            size,
            start,
            "opened log storage"
        );
        Ok(Self {
            inner,
            workers,
            mode,
        })
    }

    /// Logical begin offset; positions below it are no longer addressable.
    #[must_use]
    pub fn start_offset(&self) -> LogPos {
        LogPos(self.inner.start.load(Ordering::Acquire))
    }

    /// Contiguous prefix of fully written records.
    #[must_use]
    pub fn size(&self) -> LogPos {
        LogPos(self.inner.window.lock().frontier)
    }

    /// Reservation front; diverges from [`size`](Self::size) while slots are
    /// open.
    #[must_use]
    pub fn emerging_size(&self) -> LogPos {
        LogPos(self.inner.emerging.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn append_stats(&self) -> AppendStats {
        AppendStats {
            reservations: self.inner.reservations.load(Ordering::Relaxed),
            queued_writes: self.inner.queued_writes.load(Ordering::Relaxed),
            inline_writes: self.inner.inline_writes.load(Ordering::Relaxed),
            torn_writes: self.inner.torn_writes.load(Ordering::Relaxed),
        }
    }

    /// Atomically reserve descriptor space for `tag` at the end of the log.
    pub fn append_reservation(&self, tag: u8) -> Result<WriteSlot<'_>> {
        if self.mode == OpenMode::ReadOnly {
            return Err(VfsrError::Format(
                "cannot append to a read-only log".to_owned(),
            ));
        }
        let len = descriptor_len(tag).ok_or_else(|| {
            VfsrError::Format(format!("cannot reserve space for invalid tag {tag}"))
        })?;
        let pos = self.inner.emerging.fetch_add(len, Ordering::AcqRel);
        self.inner.reservations.fetch_add(1, Ordering::Relaxed);
        Ok(WriteSlot {
            storage: self,
            pos,
            tag,
            len,
            consumed: false,
        })
    }

    /// Serialize and append `op`, returning its position. Convenience over
    /// reservation + fill for single-producer callers.
    pub fn append(&self, op: &VfsOperation) -> Result<LogPos> {
        let slot = self.append_reservation(op.tag())?;
        let pos = slot.position();
        slot.fill(op)?;
        Ok(pos)
    }

    /// Classify and decode the record at `pos`.
    pub fn read_at(&self, pos: LogPos) -> Result<OperationReadResult> {
        self.read_at_filtered(pos, OpMask::ALL)
    }

    /// Classify the record at `pos`, deserializing the payload only when the
    /// tag is inside `mask`. Excluded tags validate framing alone and report
    /// `Incomplete(tag)` — the fast path recovery uses to skip irrelevant
    /// operations.
    pub fn read_at_filtered(&self, pos: LogPos, mask: OpMask) -> Result<OperationReadResult> {
        let start = self.start_offset().0;
        let end = self.size().0;
        if pos.0 < start || pos.0 >= end {
            return Err(VfsrError::Format(format!(
                "read position {} outside log bounds [{start}, {end})",
                pos.0
            )));
        }

        let head_raw = self.read_byte(pos.0)?;
        let (tag, torn) = match classify_head(head_raw) {
            HeadByte::Whole(tag) => (tag, false),
            HeadByte::Torn(tag) => (tag, true),
            HeadByte::OutOfRange(byte) => {
                return Ok(OperationReadResult::Invalid {
                    detail: format!("head byte {byte:#04x} is not a valid tag"),
                });
            }
        };

        let len = descriptor_len(tag).expect("classified tags are in range");
        let Some(rec_end) = pos.0.checked_add(len) else {
            return Ok(OperationReadResult::Invalid {
                detail: "descriptor length overflows the position space".to_owned(),
            });
        };
        if rec_end > end {
            return Ok(OperationReadResult::Invalid {
                detail: format!("descriptor for tag {tag} extends past end of log ({rec_end} > {end})"),
            });
        }

        let tail = self.read_byte(rec_end - 1)?;
        if tail != tag {
            return Ok(OperationReadResult::Invalid {
                detail: format!("frame mismatch: head claims tag {tag}, tail byte is {tail:#04x}"),
            });
        }
        if torn || !mask.contains(tag) {
            return Ok(OperationReadResult::Incomplete { tag });
        }

        let payload_len = usize::try_from(len - 2)
            .map_err(|_| VfsrError::Format("descriptor length does not fit usize".to_owned()))?;
        let mut payload = vec![0_u8; payload_len];
        self.inner.chunks.read_exact_at(pos.0 + 1, &mut payload)?;
        match VfsOperation::decode_payload(tag, &payload) {
            Ok(op) => Ok(OperationReadResult::Complete(op)),
            Err(err) => Ok(OperationReadResult::Invalid {
                detail: format!("payload for tag {tag} does not deserialize: {err}"),
            }),
        }
    }

    /// Classify the record ending exactly at `pos`.
    pub fn read_preceding(&self, pos: LogPos) -> Result<OperationReadResult> {
        self.read_preceding_filtered(pos, OpMask::ALL)
    }

    /// Filtered variant of [`read_preceding`](Self::read_preceding).
    pub fn read_preceding_filtered(&self, pos: LogPos, mask: OpMask) -> Result<OperationReadResult> {
        let start = self.start_offset().0;
        if pos.0 <= start {
            return Err(VfsrError::Format(format!(
                "no record precedes position {} (start offset {start})",
                pos.0
            )));
        }

        // The tail byte is the positive tag even for torn records, so it
        // determines the descriptor length.
        let tail_raw = self.read_byte(pos.0 - 1)?;
        if !(1..=MAX_TAG).contains(&tail_raw) {
            return Ok(OperationReadResult::Invalid {
                detail: format!("tail byte {tail_raw:#04x} is not a valid tag"),
            });
        }
        let len = descriptor_len(tail_raw).expect("tag in range");
        let Some(rec_pos) = pos.0.checked_sub(len) else {
            return Ok(OperationReadResult::Invalid {
                detail: format!("descriptor for tag {tail_raw} would precede position zero"),
            });
        };
        if rec_pos < start {
            return Ok(OperationReadResult::Invalid {
                detail: format!("descriptor for tag {tail_raw} would cross the start offset"),
            });
        }

        let result = self.read_at_filtered(LogPos(rec_pos), mask)?;
        // Head and tail must agree on the length we just walked back over;
        // a differing head tag means this was never a record boundary.
        match &result {
            OperationReadResult::Complete(op) if op.tag() != tail_raw => {
                Ok(OperationReadResult::Invalid {
                    detail: format!(
                        "tail claims tag {tail_raw} but head decodes tag {}",
                        op.tag()
                    ),
                })
            }
            OperationReadResult::Incomplete { tag } if *tag != tail_raw => {
                Ok(OperationReadResult::Invalid {
                    detail: format!("tail claims tag {tail_raw} but head claims tag {tag}"),
                })
            }
            _ => Ok(result),
        }
    }

    /// Wait for every reservation made before this call to close, then fsync
    /// the chunks and persist the size marker.
    pub fn flush(&self) -> Result<()> {
        let target = self.inner.emerging.load(Ordering::Acquire);
        {
            let mut window = self.inner.window.lock();
            while window.frontier < target {
                self.inner.window_cv.wait(&mut window);
            }
        }
        if let Some(err) = self.inner.first_error.lock().take() {
            return Err(err);
        }
        if self.mode == OpenMode::Writable {
            self.inner.chunks.sync_all()?;
            write_marker(
                &self.inner.chunks.dir.join(SIZE_MARKER),
                self.size().0,
            )?;
        }
        Ok(())
    }

    /// Advance the start offset to `pos`, logically dropping earlier chunks.
    /// Positions at or beyond `pos` stay valid; earlier ones fail.
    pub fn clear_up_to(&self, pos: LogPos) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(VfsrError::Format(
                "cannot truncate a read-only log".to_owned(),
            ));
        }
        let size = self.size().0;
        let old_start = self.start_offset().0;
        if pos.0 < old_start || pos.0 > size {
            return Err(VfsrError::Format(format!(
                "truncation point {} outside [{old_start}, {size}]",
                pos.0
            )));
        }
        self.inner.start.store(pos.0, Ordering::Release);
        write_marker(&self.inner.chunks.dir.join(START_MARKER), pos.0)?;
        self.inner
            .chunks
            .drop_chunks_below(pos.0 / self.inner.chunks.chunk_size);
        trace!(target: "vfsr::log", start = pos.0, "advanced log start offset");
        Ok(())
    }

    /// Flush, stop the worker pool, and release the storage.
    pub fn close(mut self) -> Result<()> {
        let flush_result = self.flush();
        self.stop_workers();
        flush_result
    }

    fn stop_workers(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.queue_cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn read_byte(&self, pos: u64) -> Result<u8> {
        let mut buf = [0_u8; 1];
        self.inner.chunks.read_exact_at(pos, &mut buf)?;
        Ok(buf[0])
    }

    fn submit(&self, pos: u64, bytes: Vec<u8>) {
        let job = WriteJob { pos, bytes };
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() < self.inner.capacity && !self.workers.is_empty() {
                queue.push_back(job);
                self.inner.queue_cv.notify_one();
                self.inner.queued_writes.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Backpressure without loss: a full channel makes the producer pay
        // for the write itself.
        self.inner.inline_writes.fetch_add(1, Ordering::Relaxed);
        self.inner.perform_write(&job);
    }
}

impl Drop for LogStorage {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop_workers();
        }
    }
}

/// A reserved descriptor slot at a fixed log position.
///
/// Exactly one of [`fill`](Self::fill) or [`fail`](Self::fail) consumes the
/// slot; dropping it unconsumed stores the torn-write marker.
pub struct WriteSlot<'a> {
    storage: &'a LogStorage,
    pos: u64,
    tag: u8,
    len: u64,
    consumed: bool,
}

impl WriteSlot<'_> {
    #[must_use]
    pub fn position(&self) -> LogPos {
        LogPos(self.pos)
    }

    #[must_use]
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Serialize `op` into the reserved slot and submit the write.
    pub fn fill(mut self, op: &VfsOperation) -> Result<()> {
        if op.tag() != self.tag {
            // Abandoning the slot as torn keeps the log walkable.
            self.write_torn_marker();
            self.consumed = true;
            return Err(VfsrError::Format(format!(
                "slot reserved for tag {} cannot hold tag {}",
                self.tag,
                op.tag()
            )));
        }
        self.consumed = true;
        self.storage.submit(self.pos, op.encode_descriptor());
        Ok(())
    }

    /// Abandon the slot, storing the torn-write marker immediately.
    pub fn fail(mut self) {
        self.write_torn_marker();
        self.consumed = true;
    }

    fn write_torn_marker(&self) {
        self.storage.inner.torn_writes.fetch_add(1, Ordering::Relaxed);
        let mut bytes = vec![0_u8; usize::try_from(self.len).unwrap_or(2)];
        bytes[0] = torn_head_byte(self.tag);
        *bytes.last_mut().expect("descriptor is at least 2 bytes") = self.tag;
        // The middle stays indeterminate on disk conceptually; writing zeros
        // is fine because only the frame bytes are interpreted.
        self.storage.submit(self.pos, bytes);
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        if !self.consumed {
            self.write_torn_marker();
        }
    }
}

/// Read an 8-byte little-endian marker file; `None` when absent.
pub fn read_marker(path: &Path) -> Result<Option<u64>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                VfsrError::Format(format!(
                    "marker file {} is {} bytes, expected 8",
                    path.display(),
                    bytes.len()
                ))
            })?;
            Ok(Some(u64::from_le_bytes(arr)))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(VfsrError::Io(err)),
    }
}

/// Write an 8-byte little-endian marker file.
pub fn write_marker(path: &Path, value: u64) -> Result<()> {
    std::fs::write(path, value.to_le_bytes())?;
    Ok(())
}
