#![forbid(unsafe_code)]
//! Snapshot engine: lazy, queryable views of per-file VFS state at a chosen
//! log position, computed by filtered backward replay under a composable
//! filler policy.

pub mod children;
pub mod filler;
pub mod snapshot;

pub use children::{
    decode_children, decode_super_root_children, encode_children, encode_super_root_children,
    CHILDREN_PAYLOAD_VERSION,
};
pub use filler::{Constraint, Filler, PropertySelector, RecordField};
pub use snapshot::{
    build_snapshot, LayeredSnapshot, PropertyState, Snapshot, SnapshotView, UnavailableCause,
};
