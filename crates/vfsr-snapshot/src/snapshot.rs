//! Backward-replay snapshot engine.
//!
//! A snapshot is built in one pass: walk the log backward from a position
//! with the filler's tag mask, and fix each `(file, field)` slot the first
//! time it is seen — the newest write wins. Attribute entries accumulate per
//! `(file, key)`. A field whose newest write carried an exceptional result
//! is `NotAvailable`, as is anything never written before the walk ended.
//! Hitting an `Invalid` record ends the walk: the region beyond it is not
//! usable history in that direction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use vfsr_error::Result;
use vfsr_log::codec::OperationReadResult;
use vfsr_log::{LogIterator, VfsOperation};
use vfsr_types::{AttrId, FileId, PayloadId};

use crate::filler::{Filler, RecordField};

/// Why a queried property has no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnavailableCause {
    /// No operation for this slot survived in the walked window.
    NeverWritten,
    /// The newest write to this slot failed on the source side.
    ExceptionalWrite,
    /// The snapshot's filler never covered this slot.
    OutOfScope,
}

/// State of one queried property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyState {
    Ready(u64),
    NotAvailable(UnavailableCause),
}

impl PropertyState {
    #[must_use]
    pub fn ready(self) -> Option<u64> {
        match self {
            Self::Ready(value) => Some(value),
            Self::NotAvailable(_) => None,
        }
    }

    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Slot {
    #[default]
    Unset,
    Ready(u64),
    Failed,
}

impl Slot {
    fn state(self) -> PropertyState {
        match self {
            Self::Unset => PropertyState::NotAvailable(UnavailableCause::NeverWritten),
            Self::Ready(value) => PropertyState::Ready(value),
            Self::Failed => PropertyState::NotAvailable(UnavailableCause::ExceptionalWrite),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrSlot {
    Ready(PayloadId),
    Failed,
}

#[derive(Debug, Default)]
struct FileRow {
    slots: [Slot; 6],
    /// `Some(true)` once a delete is the newest mutation; `Some(false)` once
    /// any other mutation proves the file outlived the walk window.
    liveness: Option<bool>,
    attributes: BTreeMap<AttrId, AttrSlot>,
}

fn field_index(field: RecordField) -> usize {
    match field {
        RecordField::Parent => 0,
        RecordField::Name => 1,
        RecordField::Length => 2,
        RecordField::Timestamp => 3,
        RecordField::Flags => 4,
        RecordField::Content => 5,
    }
}

/// Read-only view of per-file state at a log position. Implemented by
/// [`Snapshot`] and by [`LayeredSnapshot`] compositions.
pub trait SnapshotView {
    fn property(&self, file: FileId, field: RecordField) -> PropertyState;

    /// `Some(true)` deleted, `Some(false)` alive, `None` unknown to this
    /// view.
    fn deletion(&self, file: FileId) -> Option<bool>;

    /// Newest successfully written payload ref per attribute key.
    fn attributes(&self, file: FileId) -> Vec<(AttrId, PayloadId)>;

    fn attribute(&self, file: FileId, attr: AttrId) -> Option<PayloadId>;

    /// Whether `payload` was successfully appended in the walked window.
    fn payload_recorded(&self, payload: PayloadId) -> PropertyState;

    /// Largest file id named by any complete operation seen during the walk,
    /// constraint notwithstanding.
    fn observed_max_file_id(&self) -> FileId;

    fn is_deleted(&self, file: FileId) -> bool {
        self.deletion(file) == Some(true)
    }

    /// Compose with an older view consulted for any `NotAvailable` query.
    fn preceded_by<O: SnapshotView>(self, older: O) -> LayeredSnapshot<Self, O>
    where
        Self: Sized,
    {
        LayeredSnapshot { newer: self, older }
    }
}

/// Materialized result of one backward pass.
#[derive(Debug)]
pub struct Snapshot {
    filler: Filler,
    rows: BTreeMap<FileId, FileRow>,
    payloads: BTreeMap<PayloadId, bool>,
    observed_max_file: u32,
    fixed_scalar_slots: u64,
}

impl Snapshot {
    fn new(filler: Filler) -> Self {
        Self {
            filler,
            rows: BTreeMap::new(),
            payloads: BTreeMap::new(),
            observed_max_file: 0,
            fixed_scalar_slots: 0,
        }
    }

    #[must_use]
    pub fn filler(&self) -> Filler {
        self.filler
    }

    fn set_scalar(&mut self, file: FileId, field: RecordField, slot: Slot) {
        let row = self.rows.entry(file).or_default();
        let cell = &mut row.slots[field_index(field)];
        if *cell == Slot::Unset {
            *cell = slot;
            self.fixed_scalar_slots += 1;
        }
    }

    fn note_alive(&mut self, file: FileId, deleted: bool) {
        let row = self.rows.entry(file).or_default();
        if row.liveness.is_none() {
            row.liveness = Some(deleted);
        }
    }

    fn observe_file(&mut self, file: Option<FileId>) {
        if let Some(file) = file {
            self.observed_max_file = self.observed_max_file.max(file.0);
        }
    }

    /// Apply one complete operation; newest-first set-if-absent semantics.
    fn absorb(&mut self, op: &VfsOperation) {
        self.observe_file(op.file_id());
        let selector = self.filler.selector;
        let constraint = self.filler.constraint;

        let scalar = |field: RecordField, value: u64| (field, value);
        let (file, fielded) = match *op {
            VfsOperation::SetParent { file, parent, .. } => {
                (file, Some(scalar(RecordField::Parent, u64::from(parent.0))))
            }
            VfsOperation::SetNameId { file, name, .. } => {
                (file, Some(scalar(RecordField::Name, u64::from(name.0))))
            }
            VfsOperation::SetLength { file, length, .. } => {
                (file, Some(scalar(RecordField::Length, length)))
            }
            VfsOperation::SetTimestamp {
                file, timestamp, ..
            } => (file, Some(scalar(RecordField::Timestamp, timestamp))),
            VfsOperation::SetFlags { file, flags, .. } => {
                (file, Some(scalar(RecordField::Flags, u64::from(flags))))
            }
            VfsOperation::SetContentId { file, content, .. } => {
                (file, Some(scalar(RecordField::Content, u64::from(content.0))))
            }
            VfsOperation::DeleteRecord { file, result } => {
                if constraint.admits(file) {
                    self.note_alive(file, result.is_ok());
                }
                return;
            }
            VfsOperation::SetAttribute {
                file,
                attr,
                payload,
                result,
            } => {
                if selector.has_attributes() && constraint.admits(file) {
                    self.note_alive(file, false);
                    let row = self.rows.entry(file).or_default();
                    row.attributes.entry(attr).or_insert(if result.is_ok() {
                        AttrSlot::Ready(payload)
                    } else {
                        AttrSlot::Failed
                    });
                }
                return;
            }
            VfsOperation::AppendContent { payload, result } => {
                if selector.has_payloads() {
                    self.payloads.entry(payload).or_insert(result.is_ok());
                }
                return;
            }
            VfsOperation::EventStart { .. } => return,
        };

        let Some((field, value)) = fielded else {
            return;
        };
        if !selector.has_field(field) || !constraint.admits(file) {
            return;
        }
        self.note_alive(file, false);
        let result = op.result().expect("field operations carry a result");
        self.set_scalar(
            file,
            field,
            if result.is_ok() {
                Slot::Ready(value)
            } else {
                Slot::Failed
            },
        );
    }

    /// Whether every selected scalar slot for every in-scope file is fixed.
    /// Only decidable for finite constraints without attribute or payload
    /// selection.
    fn saturated(&self) -> bool {
        if self.filler.selector.has_attributes() || self.filler.selector.has_payloads() {
            return false;
        }
        let Some(files) = self.filler.constraint.cardinality() else {
            return false;
        };
        let needed = files.saturating_mul(u64::from(self.filler.selector.field_count()));
        needed > 0 && self.fixed_scalar_slots >= needed
    }
}

impl SnapshotView for Snapshot {
    fn property(&self, file: FileId, field: RecordField) -> PropertyState {
        if !self.filler.selector.has_field(field) || !self.filler.constraint.admits(file) {
            return PropertyState::NotAvailable(UnavailableCause::OutOfScope);
        }
        self.rows
            .get(&file)
            .map_or(Slot::Unset, |row| row.slots[field_index(field)])
            .state()
    }

    fn deletion(&self, file: FileId) -> Option<bool> {
        self.rows.get(&file).and_then(|row| row.liveness)
    }

    fn attributes(&self, file: FileId) -> Vec<(AttrId, PayloadId)> {
        self.rows.get(&file).map_or_else(Vec::new, |row| {
            row.attributes
                .iter()
                .filter_map(|(&attr, slot)| match slot {
                    AttrSlot::Ready(payload) => Some((attr, *payload)),
                    AttrSlot::Failed => None,
                })
                .collect()
        })
    }

    fn attribute(&self, file: FileId, attr: AttrId) -> Option<PayloadId> {
        match self.rows.get(&file)?.attributes.get(&attr)? {
            AttrSlot::Ready(payload) => Some(*payload),
            AttrSlot::Failed => None,
        }
    }

    fn payload_recorded(&self, payload: PayloadId) -> PropertyState {
        if !self.filler.selector.has_payloads() {
            return PropertyState::NotAvailable(UnavailableCause::OutOfScope);
        }
        match self.payloads.get(&payload) {
            Some(true) => PropertyState::Ready(u64::from(payload.0)),
            Some(false) => PropertyState::NotAvailable(UnavailableCause::ExceptionalWrite),
            None => PropertyState::NotAvailable(UnavailableCause::NeverWritten),
        }
    }

    fn observed_max_file_id(&self) -> FileId {
        FileId(self.observed_max_file)
    }
}

/// A newer view backed by an older one for `NotAvailable` fall-through.
#[derive(Debug)]
pub struct LayeredSnapshot<N, O> {
    newer: N,
    older: O,
}

impl<N: SnapshotView, O: SnapshotView> SnapshotView for LayeredSnapshot<N, O> {
    fn property(&self, file: FileId, field: RecordField) -> PropertyState {
        match self.newer.property(file, field) {
            PropertyState::Ready(value) => PropertyState::Ready(value),
            PropertyState::NotAvailable(_) => self.older.property(file, field),
        }
    }

    fn deletion(&self, file: FileId) -> Option<bool> {
        self.newer.deletion(file).or_else(|| self.older.deletion(file))
    }

    fn attributes(&self, file: FileId) -> Vec<(AttrId, PayloadId)> {
        let mut merged: BTreeMap<AttrId, PayloadId> =
            self.older.attributes(file).into_iter().collect();
        for (attr, payload) in self.newer.attributes(file) {
            merged.insert(attr, payload);
        }
        merged.into_iter().collect()
    }

    fn attribute(&self, file: FileId, attr: AttrId) -> Option<PayloadId> {
        self.newer
            .attribute(file, attr)
            .or_else(|| self.older.attribute(file, attr))
    }

    fn payload_recorded(&self, payload: PayloadId) -> PropertyState {
        match self.newer.payload_recorded(payload) {
            PropertyState::Ready(value) => PropertyState::Ready(value),
            PropertyState::NotAvailable(_) => self.older.payload_recorded(payload),
        }
    }

    fn observed_max_file_id(&self) -> FileId {
        self.newer
            .observed_max_file_id()
            .max(self.older.observed_max_file_id())
    }
}

/// Walk `iter` backward to its begin bound (or until the filler saturates,
/// or an invalid record ends usable history) and materialize the view.
pub fn build_snapshot(iter: &mut LogIterator<'_>, filler: Filler) -> Result<Snapshot> {
    let mask = filler.op_mask();
    let mut snapshot = Snapshot::new(filler);
    let mut walked = 0_u64;

    while iter.has_previous() {
        match iter.previous_filtered(mask)? {
            OperationReadResult::Complete(op) => {
                snapshot.absorb(&op);
            }
            OperationReadResult::Incomplete { .. } => {}
            OperationReadResult::Invalid { detail } => {
                debug!(
                    target: "vfsr::snapshot",
                    position = iter.position().0,
                    detail = %detail,
                    "backward walk reached invalid record; treating as end of history"
                );
                break;
            }
        }
        walked += 1;
        if snapshot.saturated() {
            trace!(
                target: "vfsr::snapshot",
                walked,
                "filler saturated before log start"
            );
            break;
        }
    }
    Ok(snapshot)
}
