#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The reserved super-root file id. Every connected record is reachable from
/// it via parent chains.
pub const SUPER_ROOT_ID: FileId = FileId(1);

/// Dense, 1-based identifier of a file record. `0` never names a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl FileId {
    /// Parent value carried by records attached directly under the super-root
    /// (a legacy quirk: such records carry `0`, not the super-root id).
    pub const UNSET: Self = Self(0);

    #[must_use]
    pub fn is_super_root(self) -> bool {
        self == SUPER_ROOT_ID
    }
}

/// Dense, 1-based handle into the content payload store. `0` means
/// "no content".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PayloadId(pub u32);

impl PayloadId {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Index into the interned-name enumerator file (copied verbatim during
/// recovery, never rebuilt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NameId(pub u32);

/// Enumerated attribute key, resolved against the attribute enumerator file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttrId(pub u32);

/// Absolute byte position in the operation log.
///
/// Unit-carrying wrapper to prevent mixing log offsets with payload handles
/// or table indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPos(pub u64);

impl LogPos {
    pub const ZERO: Self = Self(0);

    /// Advance by a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Retreat by a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

/// Record flag bits stored in the `flags` field of each file record.
pub mod flags {
    /// The record is unreachable from the super-root and its id is free.
    pub const FREE_RECORD: u32 = 1 << 0;
    /// The content blob referenced by this record was lost; the host must
    /// reload it from the real filesystem.
    pub const MUST_RELOAD_CONTENT: u32 = 1 << 1;
    /// The recorded length is untrusted and must be re-stat'ed.
    pub const MUST_RELOAD_LENGTH: u32 = 1 << 2;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Runtime knobs, overridable through `VFSR_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryTunables {
    /// Number of file ids reconstructed per stage-2 snapshot pass.
    pub records_init_chunk_size: u32,
    /// Capacity of the bounded log-write submission channel.
    pub log_write_buffer_capacity: usize,
    /// On-disk log chunk granularity in bytes.
    pub log_chunk_size: u64,
    /// Consecutive clean operations required before a recovery point.
    pub clean_window: u32,
    /// Seed spacing for the geometric restore-point menu, in milliseconds.
    pub restore_point_initial_skip_ms: u64,
    /// Geometric factor applied to the spacing after each emitted point.
    pub restore_point_multiplier: f64,
}

impl Default for RecoveryTunables {
    fn default() -> Self {
        Self {
            records_init_chunk_size: 750_000,
            log_write_buffer_capacity: 5_000,
            log_chunk_size: 64 * 1024 * 1024,
            clean_window: 50_000,
            restore_point_initial_skip_ms: 30_000,
            restore_point_multiplier: 1.618,
        }
    }
}

impl RecoveryTunables {
    /// Defaults overlaid with any `VFSR_*` environment overrides.
    ///
    /// Unparseable values fall back to the default silently; the host decides
    /// its environment, not this crate.
    #[must_use]
    pub fn from_env() -> Self {
        let mut out = Self::default();
        if let Some(v) = env_parse::<u32>("VFSR_RECORDS_INIT_CHUNK_SIZE") {
            out.records_init_chunk_size = v;
        }
        if let Some(v) = env_parse::<usize>("VFSR_LOG_WRITE_BUFFER_CAPACITY") {
            out.log_write_buffer_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("VFSR_LOG_CHUNK_SIZE") {
            out.log_chunk_size = v;
        }
        if let Some(v) = env_parse::<u32>("VFSR_CLEAN_WINDOW") {
            out.clean_window = v;
        }
        if let Some(v) = env_parse::<u64>("VFSR_RESTORE_POINT_INITIAL_SKIP_MS") {
            out.restore_point_initial_skip_ms = v;
        }
        if let Some(v) = env_parse::<f64>("VFSR_RESTORE_POINT_MULTIPLIER") {
            out.restore_point_multiplier = v;
        }
        out
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_pos_checked_arithmetic() {
        assert_eq!(LogPos(10).checked_add(5), Some(LogPos(15)));
        assert_eq!(LogPos(10).checked_sub(5), Some(LogPos(5)));
        assert_eq!(LogPos(u64::MAX).checked_add(1), None);
        assert_eq!(LogPos(0).checked_sub(1), None);
    }

    #[test]
    fn super_root_identity() {
        assert!(SUPER_ROOT_ID.is_super_root());
        assert!(!FileId(2).is_super_root());
        assert!(PayloadId::NONE.is_none());
        assert!(!PayloadId(1).is_none());
    }

    #[test]
    fn ensure_slice_bounds() {
        let data = [1_u8, 2, 3, 4];
        assert!(ensure_slice(&data, 0, 4).is_ok());
        assert!(ensure_slice(&data, 2, 3).is_err());
        assert!(ensure_slice(&data, usize::MAX, 1).is_err());
    }

    #[test]
    fn le_readers_round_trip() {
        let mut data = Vec::new();
        data.extend_from_slice(&0xBEEF_u16.to_le_bytes());
        data.extend_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        data.extend_from_slice(&0x1234_5678_9ABC_DEF0_u64.to_le_bytes());
        assert_eq!(read_le_u16(&data, 0).expect("u16"), 0xBEEF);
        assert_eq!(read_le_u32(&data, 2).expect("u32"), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&data, 6).expect("u64"), 0x1234_5678_9ABC_DEF0);
        assert!(read_le_u64(&data, 8).is_err());
    }

    #[test]
    fn tunables_defaults_match_documented_values() {
        let t = RecoveryTunables::default();
        assert_eq!(t.records_init_chunk_size, 750_000);
        assert_eq!(t.log_write_buffer_capacity, 5_000);
        assert_eq!(t.log_chunk_size, 64 * 1024 * 1024);
        assert_eq!(t.clean_window, 50_000);
        assert_eq!(t.restore_point_initial_skip_ms, 30_000);
        assert!((t.restore_point_multiplier - 1.618).abs() < f64::EPSILON);
    }
}
