//! Binary operation codec.
//!
//! Every log record is a *descriptor*: one tag byte, a fixed-size payload
//! fully determined by the tag, and a second copy of the tag byte. A writer
//! that fails mid-record stores the head byte negated (two's complement), so
//! a reader can classify the record as torn without a checksum:
//!
//! ```text
//! Descriptor:
//! +----------+----------------------+----------+
//! | tag: u8  | payload[size(tag)]   | tag: u8  |
//! +----------+----------------------+----------+
//!
//! Torn write: head = 256 - tag, tail = tag, payload indeterminate.
//! ```
//!
//! Tag `0` is reserved as invalid; valid tags are `1..=MAX_TAG`.

use serde::{Deserialize, Serialize};
use vfsr_types::{read_le_u32, read_le_u64, AttrId, FileId, NameId, ParseError, PayloadId};

/// Highest valid operation tag.
pub const MAX_TAG: u8 = 10;

pub const TAG_SET_PARENT: u8 = 1;
pub const TAG_SET_NAME_ID: u8 = 2;
pub const TAG_SET_LENGTH: u8 = 3;
pub const TAG_SET_TIMESTAMP: u8 = 4;
pub const TAG_SET_FLAGS: u8 = 5;
pub const TAG_SET_CONTENT_ID: u8 = 6;
pub const TAG_DELETE_RECORD: u8 = 7;
pub const TAG_SET_ATTRIBUTE: u8 = 8;
pub const TAG_APPEND_CONTENT: u8 = 9;
pub const TAG_EVENT_START: u8 = 10;

/// Wire size of an [`OperationResult`]: kind byte + value.
const RESULT_SIZE: usize = 9;

/// Outcome recorded with each mutating operation.
///
/// `Failed` marks an operation whose source-side execution raised; recovery
/// passes skip such records entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Ok(u64),
    Failed(u32),
}

impl OperationResult {
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok(_))
    }

    fn encode(self, buf: &mut [u8]) {
        match self {
            Self::Ok(value) => {
                buf[0] = 0;
                buf[1..9].copy_from_slice(&value.to_le_bytes());
            }
            Self::Failed(code) => {
                buf[0] = 1;
                buf[1..9].copy_from_slice(&u64::from(code).to_le_bytes());
            }
        }
    }

    fn decode(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let kind = *vfsr_types::ensure_slice(bytes, offset, 1)?
            .first()
            .expect("slice of length 1");
        let value = read_le_u64(bytes, offset + 1)?;
        match kind {
            0 => Ok(Self::Ok(value)),
            1 => {
                let code = u32::try_from(value)
                    .map_err(|_| ParseError::IntegerConversion { field: "error_code" })?;
                Ok(Self::Failed(code))
            }
            _ => Err(ParseError::InvalidField {
                field: "result_kind",
                reason: "must be 0 or 1",
            }),
        }
    }
}

/// One decoded log operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsOperation {
    SetParent {
        file: FileId,
        parent: FileId,
        result: OperationResult,
    },
    SetNameId {
        file: FileId,
        name: NameId,
        result: OperationResult,
    },
    SetLength {
        file: FileId,
        length: u64,
        result: OperationResult,
    },
    SetTimestamp {
        file: FileId,
        timestamp: u64,
        result: OperationResult,
    },
    SetFlags {
        file: FileId,
        flags: u32,
        result: OperationResult,
    },
    SetContentId {
        file: FileId,
        content: PayloadId,
        result: OperationResult,
    },
    DeleteRecord {
        file: FileId,
        result: OperationResult,
    },
    SetAttribute {
        file: FileId,
        attr: AttrId,
        payload: PayloadId,
        result: OperationResult,
    },
    AppendContent {
        payload: PayloadId,
        result: OperationResult,
    },
    /// Delimits a coarse-grained user-visible event; recovery points land
    /// immediately after one of these.
    EventStart { timestamp_ms: u64 },
}

/// Payload size in bytes for a tag, excluding the two framing bytes.
#[must_use]
pub fn value_size(tag: u8) -> Option<usize> {
    match tag {
        TAG_SET_PARENT | TAG_SET_NAME_ID | TAG_SET_FLAGS | TAG_SET_CONTENT_ID => {
            Some(4 + 4 + RESULT_SIZE)
        }
        TAG_SET_LENGTH | TAG_SET_TIMESTAMP => Some(4 + 8 + RESULT_SIZE),
        TAG_DELETE_RECORD | TAG_APPEND_CONTENT => Some(4 + RESULT_SIZE),
        TAG_SET_ATTRIBUTE => Some(4 + 4 + 4 + RESULT_SIZE),
        TAG_EVENT_START => Some(8),
        _ => None,
    }
}

/// Full on-disk descriptor length for a tag (payload plus both frame bytes).
#[must_use]
pub fn descriptor_len(tag: u8) -> Option<u64> {
    value_size(tag).map(|size| size as u64 + 2)
}

impl VfsOperation {
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::SetParent { .. } => TAG_SET_PARENT,
            Self::SetNameId { .. } => TAG_SET_NAME_ID,
            Self::SetLength { .. } => TAG_SET_LENGTH,
            Self::SetTimestamp { .. } => TAG_SET_TIMESTAMP,
            Self::SetFlags { .. } => TAG_SET_FLAGS,
            Self::SetContentId { .. } => TAG_SET_CONTENT_ID,
            Self::DeleteRecord { .. } => TAG_DELETE_RECORD,
            Self::SetAttribute { .. } => TAG_SET_ATTRIBUTE,
            Self::AppendContent { .. } => TAG_APPEND_CONTENT,
            Self::EventStart { .. } => TAG_EVENT_START,
        }
    }

    /// The result marker, if this operation kind carries one.
    #[must_use]
    pub fn result(&self) -> Option<OperationResult> {
        match self {
            Self::SetParent { result, .. }
            | Self::SetNameId { result, .. }
            | Self::SetLength { result, .. }
            | Self::SetTimestamp { result, .. }
            | Self::SetFlags { result, .. }
            | Self::SetContentId { result, .. }
            | Self::DeleteRecord { result, .. }
            | Self::SetAttribute { result, .. }
            | Self::AppendContent { result, .. } => Some(*result),
            Self::EventStart { .. } => None,
        }
    }

    /// The file this operation mutates, if any.
    #[must_use]
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            Self::SetParent { file, .. }
            | Self::SetNameId { file, .. }
            | Self::SetLength { file, .. }
            | Self::SetTimestamp { file, .. }
            | Self::SetFlags { file, .. }
            | Self::SetContentId { file, .. }
            | Self::DeleteRecord { file, .. }
            | Self::SetAttribute { file, .. } => Some(*file),
            Self::AppendContent { .. } | Self::EventStart { .. } => None,
        }
    }

    /// Serialize the payload (framing bytes excluded) into `buf`.
    ///
    /// `buf` must be exactly `value_size(self.tag())` bytes.
    pub fn encode_payload(&self, buf: &mut [u8]) {
        debug_assert_eq!(Some(buf.len()), value_size(self.tag()));
        match self {
            Self::SetParent {
                file,
                parent,
                result,
            } => {
                buf[0..4].copy_from_slice(&file.0.to_le_bytes());
                buf[4..8].copy_from_slice(&parent.0.to_le_bytes());
                result.encode(&mut buf[8..17]);
            }
            Self::SetNameId { file, name, result } => {
                buf[0..4].copy_from_slice(&file.0.to_le_bytes());
                buf[4..8].copy_from_slice(&name.0.to_le_bytes());
                result.encode(&mut buf[8..17]);
            }
            Self::SetLength {
                file,
                length,
                result,
            } => {
                buf[0..4].copy_from_slice(&file.0.to_le_bytes());
                buf[4..12].copy_from_slice(&length.to_le_bytes());
                result.encode(&mut buf[12..21]);
            }
            Self::SetTimestamp {
                file,
                timestamp,
                result,
            } => {
                buf[0..4].copy_from_slice(&file.0.to_le_bytes());
                buf[4..12].copy_from_slice(&timestamp.to_le_bytes());
                result.encode(&mut buf[12..21]);
            }
            Self::SetFlags {
                file,
                flags,
                result,
            } => {
                buf[0..4].copy_from_slice(&file.0.to_le_bytes());
                buf[4..8].copy_from_slice(&flags.to_le_bytes());
                result.encode(&mut buf[8..17]);
            }
            Self::SetContentId {
                file,
                content,
                result,
            } => {
                buf[0..4].copy_from_slice(&file.0.to_le_bytes());
                buf[4..8].copy_from_slice(&content.0.to_le_bytes());
                result.encode(&mut buf[8..17]);
            }
            Self::DeleteRecord { file, result } => {
                buf[0..4].copy_from_slice(&file.0.to_le_bytes());
                result.encode(&mut buf[4..13]);
            }
            Self::SetAttribute {
                file,
                attr,
                payload,
                result,
            } => {
                buf[0..4].copy_from_slice(&file.0.to_le_bytes());
                buf[4..8].copy_from_slice(&attr.0.to_le_bytes());
                buf[8..12].copy_from_slice(&payload.0.to_le_bytes());
                result.encode(&mut buf[12..21]);
            }
            Self::AppendContent { payload, result } => {
                buf[0..4].copy_from_slice(&payload.0.to_le_bytes());
                result.encode(&mut buf[4..13]);
            }
            Self::EventStart { timestamp_ms } => {
                buf[0..8].copy_from_slice(&timestamp_ms.to_le_bytes());
            }
        }
    }

    /// Deserialize a payload previously produced by [`encode_payload`].
    ///
    /// [`encode_payload`]: Self::encode_payload
    pub fn decode_payload(tag: u8, bytes: &[u8]) -> Result<Self, ParseError> {
        let expected = value_size(tag).ok_or(ParseError::InvalidField {
            field: "tag",
            reason: "outside valid tag range",
        })?;
        if bytes.len() != expected {
            return Err(ParseError::InsufficientData {
                needed: expected,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let op = match tag {
            TAG_SET_PARENT => Self::SetParent {
                file: FileId(read_le_u32(bytes, 0)?),
                parent: FileId(read_le_u32(bytes, 4)?),
                result: OperationResult::decode(bytes, 8)?,
            },
            TAG_SET_NAME_ID => Self::SetNameId {
                file: FileId(read_le_u32(bytes, 0)?),
                name: NameId(read_le_u32(bytes, 4)?),
                result: OperationResult::decode(bytes, 8)?,
            },
            TAG_SET_LENGTH => Self::SetLength {
                file: FileId(read_le_u32(bytes, 0)?),
                length: read_le_u64(bytes, 4)?,
                result: OperationResult::decode(bytes, 12)?,
            },
            TAG_SET_TIMESTAMP => Self::SetTimestamp {
                file: FileId(read_le_u32(bytes, 0)?),
                timestamp: read_le_u64(bytes, 4)?,
                result: OperationResult::decode(bytes, 12)?,
            },
            TAG_SET_FLAGS => Self::SetFlags {
                file: FileId(read_le_u32(bytes, 0)?),
                flags: read_le_u32(bytes, 4)?,
                result: OperationResult::decode(bytes, 8)?,
            },
            TAG_SET_CONTENT_ID => Self::SetContentId {
                file: FileId(read_le_u32(bytes, 0)?),
                content: PayloadId(read_le_u32(bytes, 4)?),
                result: OperationResult::decode(bytes, 8)?,
            },
            TAG_DELETE_RECORD => Self::DeleteRecord {
                file: FileId(read_le_u32(bytes, 0)?),
                result: OperationResult::decode(bytes, 4)?,
            },
            TAG_SET_ATTRIBUTE => Self::SetAttribute {
                file: FileId(read_le_u32(bytes, 0)?),
                attr: AttrId(read_le_u32(bytes, 4)?),
                payload: PayloadId(read_le_u32(bytes, 8)?),
                result: OperationResult::decode(bytes, 12)?,
            },
            TAG_APPEND_CONTENT => Self::AppendContent {
                payload: PayloadId(read_le_u32(bytes, 0)?),
                result: OperationResult::decode(bytes, 4)?,
            },
            TAG_EVENT_START => Self::EventStart {
                timestamp_ms: read_le_u64(bytes, 0)?,
            },
            _ => unreachable!("value_size accepted the tag"),
        };
        Ok(op)
    }

    /// Serialize the full descriptor: head tag, payload, tail tag.
    #[must_use]
    pub fn encode_descriptor(&self) -> Vec<u8> {
        let tag = self.tag();
        let size = value_size(tag).expect("own tag is valid");
        let mut out = vec![0_u8; size + 2];
        out[0] = tag;
        self.encode_payload(&mut out[1..=size]);
        out[size + 1] = tag;
        out
    }
}

/// Torn-write head byte for a tag (`256 - tag`, i.e. the two's-complement
/// negation).
#[must_use]
pub fn torn_head_byte(tag: u8) -> u8 {
    tag.wrapping_neg()
}

/// Interpretation of a descriptor's head byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadByte {
    /// Head names a valid tag and claims a fully written record.
    Whole(u8),
    /// Head is the negative encoding: the writer aborted mid-record.
    Torn(u8),
    /// Head is zero or names a tag outside `1..=MAX_TAG`.
    OutOfRange(u8),
}

/// Classify a raw head byte without touching the rest of the descriptor.
#[must_use]
pub fn classify_head(raw: u8) -> HeadByte {
    let signed = raw as i8;
    if signed > 0 && raw <= MAX_TAG {
        HeadByte::Whole(raw)
    } else if signed < 0 && signed.unsigned_abs() <= MAX_TAG {
        HeadByte::Torn(signed.unsigned_abs())
    } else {
        HeadByte::OutOfRange(raw)
    }
}

/// Bit set over operation tags, used for filtered reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpMask(u16);

impl OpMask {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self((1 << MAX_TAG as u16) - 1);

    #[must_use]
    pub fn of(tags: &[u8]) -> Self {
        let mut mask = Self::EMPTY;
        for &tag in tags {
            mask = mask.with(tag);
        }
        mask
    }

    #[must_use]
    pub fn with(self, tag: u8) -> Self {
        debug_assert!((1..=MAX_TAG).contains(&tag));
        Self(self.0 | 1 << (tag - 1))
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn contains(self, tag: u8) -> bool {
        (1..=MAX_TAG).contains(&tag) && self.0 & (1 << (tag - 1)) != 0
    }
}

/// Classification of one random-access log read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationReadResult {
    /// Both frame bytes match and the payload deserialized.
    Complete(VfsOperation),
    /// The record was reserved but never fully written (aborted or crashed
    /// appender), or its tag falls outside the requested mask.
    Incomplete { tag: u8 },
    /// The framing is inconsistent; this position is not a record boundary.
    Invalid { detail: String },
}

impl OperationReadResult {
    #[must_use]
    pub fn as_complete(&self) -> Option<&VfsOperation> {
        match self {
            Self::Complete(op) => Some(op),
            _ => None,
        }
    }

    /// Descriptor length implied by this read, when one is defined.
    ///
    /// `Invalid` reads have no length: the position is not a record boundary.
    #[must_use]
    pub fn descriptor_len(&self) -> Option<u64> {
        match self {
            Self::Complete(op) => descriptor_len(op.tag()),
            Self::Incomplete { tag } => descriptor_len(*tag),
            Self::Invalid { .. } => None,
        }
    }
}
