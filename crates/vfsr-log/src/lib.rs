#![forbid(unsafe_code)]
//! Append-only operation log: self-framing binary records, concurrent
//! reserved-slot appends, random-access classified reads, and bidirectional
//! iteration.
//!
//! The log is the sole surviving source of truth when the primary VFS record
//! storage is damaged, so this crate is strictly conservative: every read
//! classifies the bytes as `Complete`, `Incomplete` (torn write), or
//! `Invalid` (not a record boundary), and nothing here ever mutates a record
//! in place.

pub mod codec;
pub mod iter;
pub mod storage;

pub use codec::{
    descriptor_len, value_size, OpMask, OperationReadResult, OperationResult, VfsOperation,
    MAX_TAG,
};
pub use iter::LogIterator;
pub use storage::{
    read_marker, write_marker, AppendStats, LogConfig, LogStorage, OpenMode, WriteSlot,
    OPERATIONS_DIR, SIZE_MARKER, START_MARKER,
};
