//! Filler policies: which operations a snapshot pass consumes.
//!
//! A filler is the composition of three orthogonal aspects:
//!
//! - *property selection* — which record fields to reconstruct,
//! - *constraint* — a predicate on the file each operation names,
//! - *mode* — scalars take the newest non-excepted write, attributes
//!   accumulate per `(file, key)`; the mode follows the property kind.
//!
//! Fillers are small value objects composed with [`Filler::sum`] and
//! [`Filler::constrain`], then lowered to a tag mask for the filtered
//! backward walk.

use vfsr_log::codec::{
    OpMask, TAG_APPEND_CONTENT, TAG_DELETE_RECORD, TAG_SET_ATTRIBUTE, TAG_SET_CONTENT_ID,
    TAG_SET_FLAGS, TAG_SET_LENGTH, TAG_SET_NAME_ID, TAG_SET_PARENT, TAG_SET_TIMESTAMP,
};
use vfsr_types::FileId;

/// A scalar field of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordField {
    Parent,
    Name,
    Length,
    Timestamp,
    Flags,
    Content,
}

impl RecordField {
    pub const ALL: [Self; 6] = [
        Self::Parent,
        Self::Name,
        Self::Length,
        Self::Timestamp,
        Self::Flags,
        Self::Content,
    ];

    fn bit(self) -> u8 {
        match self {
            Self::Parent => 1 << 0,
            Self::Name => 1 << 1,
            Self::Length => 1 << 2,
            Self::Timestamp => 1 << 3,
            Self::Flags => 1 << 4,
            Self::Content => 1 << 5,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Parent => TAG_SET_PARENT,
            Self::Name => TAG_SET_NAME_ID,
            Self::Length => TAG_SET_LENGTH,
            Self::Timestamp => TAG_SET_TIMESTAMP,
            Self::Flags => TAG_SET_FLAGS,
            Self::Content => TAG_SET_CONTENT_ID,
        }
    }
}

/// Which parts of per-file state a snapshot pass reconstructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySelector {
    fields: u8,
    attributes: bool,
    payloads: bool,
}

impl PropertySelector {
    pub const EMPTY: Self = Self {
        fields: 0,
        attributes: false,
        payloads: false,
    };

    /// Every scalar field, no attributes, no payload tracking.
    #[must_use]
    pub fn all_scalars() -> Self {
        let mut out = Self::EMPTY;
        for field in RecordField::ALL {
            out.fields |= field.bit();
        }
        out
    }

    #[must_use]
    pub fn of(fields: &[RecordField]) -> Self {
        let mut out = Self::EMPTY;
        for field in fields {
            out.fields |= field.bit();
        }
        out
    }

    /// Also reconstruct the per-file attribute map.
    #[must_use]
    pub fn with_attributes(mut self) -> Self {
        self.attributes = true;
        self
    }

    /// Also track which content payload ids were successfully appended.
    #[must_use]
    pub fn with_payloads(mut self) -> Self {
        self.payloads = true;
        self
    }

    #[must_use]
    pub fn has_field(self, field: RecordField) -> bool {
        self.fields & field.bit() != 0
    }

    #[must_use]
    pub fn has_attributes(self) -> bool {
        self.attributes
    }

    #[must_use]
    pub fn has_payloads(self) -> bool {
        self.payloads
    }

    #[must_use]
    pub fn field_count(self) -> u32 {
        self.fields.count_ones()
    }

    #[must_use]
    fn union(self, other: Self) -> Self {
        Self {
            fields: self.fields | other.fields,
            attributes: self.attributes || other.attributes,
            payloads: self.payloads || other.payloads,
        }
    }
}

/// Predicate over the file an operation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    Any,
    /// Inclusive file-id range.
    FileRange { lo: FileId, hi: FileId },
    SuperRootOnly,
}

impl Constraint {
    #[must_use]
    pub fn admits(self, file: FileId) -> bool {
        match self {
            Self::Any => true,
            Self::FileRange { lo, hi } => (lo..=hi).contains(&file),
            Self::SuperRootOnly => file.is_super_root(),
        }
    }

    /// Number of admitted file ids, when finite.
    #[must_use]
    pub fn cardinality(self) -> Option<u64> {
        match self {
            Self::Any => None,
            Self::FileRange { lo, hi } => {
                Some(u64::from(hi.0).saturating_sub(u64::from(lo.0)).saturating_add(1))
            }
            Self::SuperRootOnly => Some(1),
        }
    }

    fn union(self, other: Self) -> Self {
        if self == other {
            self
        } else {
            Self::Any
        }
    }
}

/// A composed snapshot policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filler {
    pub selector: PropertySelector,
    pub constraint: Constraint,
}

impl Filler {
    /// Lift a property selector into an unconstrained filler.
    #[must_use]
    pub fn for_properties(selector: PropertySelector) -> Self {
        Self {
            selector,
            constraint: Constraint::Any,
        }
    }

    /// Union of effects: both selections apply; differing constraints widen
    /// to `Any`.
    #[must_use]
    pub fn sum(self, other: Self) -> Self {
        Self {
            selector: self.selector.union(other.selector),
            constraint: self.constraint.union(other.constraint),
        }
    }

    /// Restrict to operations whose file satisfies `constraint`.
    #[must_use]
    pub fn constrain(mut self, constraint: Constraint) -> Self {
        self.constraint = constraint;
        self
    }

    /// Tag mask for the filtered backward walk.
    ///
    /// Any record-field selection also pulls in `DeleteRecord`: deletion
    /// decides a file's liveness regardless of which fields are wanted.
    #[must_use]
    pub fn op_mask(self) -> OpMask {
        let mut mask = OpMask::EMPTY;
        for field in RecordField::ALL {
            if self.selector.has_field(field) {
                mask = mask.with(field.tag());
            }
        }
        if self.selector.fields != 0 {
            mask = mask.with(TAG_DELETE_RECORD);
        }
        if self.selector.has_attributes() {
            mask = mask.with(TAG_SET_ATTRIBUTE);
        }
        if self.selector.has_payloads() {
            mask = mask.with(TAG_APPEND_CONTENT);
        }
        mask
    }
}
