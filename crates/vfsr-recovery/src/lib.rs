#![forbid(unsafe_code)]
//! Time-machine recovery for a damaged VFS cache.
//!
//! The operation log is the only surviving source of truth; this crate
//! replays it backward from a chosen cut point, materializes per-file state,
//! rebuilds record, content, attribute, and tree storage in a fresh
//! directory, and arms the marker-file swap that installs the new cache on
//! the next process start.

pub mod orchestrator;
pub mod points;
pub mod records;
pub mod swap;

pub use orchestrator::{
    recover_from_point, recover_from_point_with, recover_from_point_with_source,
    AttributeDescriptor, DefaultQueryContext, FileStateCounts, NoProgress, ProgressReporter,
    RecoveryQueryContext, RecoveryResult, RecoveryState, VFSLOG_DIR,
};
pub use points::{
    find_closest_preceding_clean_point, generate_recovery_points_prior_to, thin_out,
    RecoveryPoint, RecoveryPointInfo, RecoveryPoints, ThinnedPoints, MAX_SKIP_MS,
};
pub use records::{
    read_creation_timestamp, AttributeStore, FsRecords, RecordView, ATTRIBUTES_FILE,
    CONTENT_FILE, HEADER_TIMESTAMP_OFFSET, RECORDS_FILE,
};
pub use swap::{
    apply_pending_swap, write_swap_marker, SwapOutcome, BACKUP_DIR, REPLACEMENT_MARKER,
};
