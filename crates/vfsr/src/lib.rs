#![forbid(unsafe_code)]
//! Facade crate for the VFS recovery engine.
//!
//! Hosts embed this library around a crash boundary: in steady state the
//! operation log records every cache mutation; after damage,
//! [`recover_from_point`] rebuilds a fresh cache directory from the log, and
//! [`apply_pending_swap`] installs it on the next start.

pub use vfsr_error::{Result, VfsrError};
pub use vfsr_log::{
    descriptor_len, value_size, LogConfig, LogIterator, LogStorage, OpMask, OpenMode,
    OperationReadResult, OperationResult, VfsOperation, WriteSlot,
};
pub use vfsr_payload::{PayloadSource, PayloadStore};
pub use vfsr_recovery::{
    apply_pending_swap, find_closest_preceding_clean_point, generate_recovery_points_prior_to,
    recover_from_point, recover_from_point_with, recover_from_point_with_source, thin_out,
    AttributeDescriptor, DefaultQueryContext, FileStateCounts, FsRecords, NoProgress,
    ProgressReporter, RecoveryPoint, RecoveryPointInfo, RecoveryQueryContext, RecoveryResult,
    RecoveryState, SwapOutcome, REPLACEMENT_MARKER,
};
pub use vfsr_snapshot::{
    build_snapshot, Constraint, Filler, PropertySelector, PropertyState, RecordField, Snapshot,
    SnapshotView,
};
pub use vfsr_types::{
    flags, AttrId, FileId, LogPos, NameId, PayloadId, RecoveryTunables, SUPER_ROOT_ID,
};
