//! Delta-compressed children-attribute payloads.
//!
//! Two layouts share the varint plumbing:
//!
//! - The super-root's child set is a versioned list of `(nameId, fileId)`
//!   pairs; each pair is stored as the delta against the previous pair's
//!   running sums.
//! - Every other parent stores its sorted child ids; the first delta is
//!   relative to the parent's own id, later deltas are consecutive
//!   differences.
//!
//! Deltas are zigzag-encoded LEB128 varints (the first super-root delta and
//! `firstChild - parentId` can both be negative).

use vfsr_types::{FileId, NameId, ParseError};

/// Version byte prefixed to the super-root children payload.
pub const CHILDREN_PAYLOAD_VERSION: u8 = 1;

fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_uvarint(bytes: &[u8], offset: &mut usize) -> Result<u64, ParseError> {
    let mut value = 0_u64;
    let mut shift = 0_u32;
    loop {
        let Some(&byte) = bytes.get(*offset) else {
            return Err(ParseError::InsufficientData {
                needed: 1,
                offset: *offset,
                actual: 0,
            });
        };
        *offset += 1;
        if shift >= 64 {
            return Err(ParseError::InvalidField {
                field: "varint",
                reason: "exceeds 64 bits",
            });
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn write_delta(out: &mut Vec<u8>, value: i64) {
    write_uvarint(out, zigzag(value));
}

fn read_delta(bytes: &[u8], offset: &mut usize) -> Result<i64, ParseError> {
    read_uvarint(bytes, offset).map(unzigzag)
}

fn checked_id(running: i64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(running).map_err(|_| ParseError::IntegerConversion { field })
}

/// Encode the super-root child set. Pairs are sorted by file id first.
#[must_use]
pub fn encode_super_root_children(children: &[(NameId, FileId)]) -> Vec<u8> {
    let mut sorted: Vec<(NameId, FileId)> = children.to_vec();
    sorted.sort_by_key(|&(_, file)| file);

    let mut out = vec![CHILDREN_PAYLOAD_VERSION];
    write_uvarint(&mut out, sorted.len() as u64);
    let mut prev_name = 0_i64;
    let mut prev_file = 0_i64;
    for (name, file) in sorted {
        write_delta(&mut out, i64::from(name.0) - prev_name);
        write_delta(&mut out, i64::from(file.0) - prev_file);
        prev_name = i64::from(name.0);
        prev_file = i64::from(file.0);
    }
    out
}

/// Decode a super-root child payload produced by
/// [`encode_super_root_children`].
pub fn decode_super_root_children(bytes: &[u8]) -> Result<Vec<(NameId, FileId)>, ParseError> {
    let mut offset = 0_usize;
    match bytes.first() {
        Some(&CHILDREN_PAYLOAD_VERSION) => offset = 1,
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: "children_version",
                reason: "unknown version byte",
            });
        }
        None => {
            return Err(ParseError::InsufficientData {
                needed: 1,
                offset: 0,
                actual: 0,
            });
        }
    }

    let count = read_uvarint(bytes, &mut offset)?;
    let count = usize::try_from(count)
        .map_err(|_| ParseError::IntegerConversion { field: "child_count" })?;
    let mut out = Vec::with_capacity(count);
    let mut running_name = 0_i64;
    let mut running_file = 0_i64;
    for _ in 0..count {
        running_name += read_delta(bytes, &mut offset)?;
        running_file += read_delta(bytes, &mut offset)?;
        out.push((
            NameId(checked_id(running_name, "name_id")?),
            FileId(checked_id(running_file, "file_id")?),
        ));
    }
    Ok(out)
}

/// Encode a non-root parent's child list. `children` is sorted in place of
/// the caller's ordering; the first delta is taken against `parent`.
#[must_use]
pub fn encode_children(parent: FileId, children: &[FileId]) -> Vec<u8> {
    let mut sorted: Vec<FileId> = children.to_vec();
    sorted.sort_unstable();

    let mut out = Vec::new();
    write_uvarint(&mut out, sorted.len() as u64);
    let mut prev = i64::from(parent.0);
    for child in sorted {
        write_delta(&mut out, i64::from(child.0) - prev);
        prev = i64::from(child.0);
    }
    out
}

/// Decode a payload produced by [`encode_children`] for the same `parent`.
pub fn decode_children(parent: FileId, bytes: &[u8]) -> Result<Vec<FileId>, ParseError> {
    let mut offset = 0_usize;
    let count = read_uvarint(bytes, &mut offset)?;
    let count = usize::try_from(count)
        .map_err(|_| ParseError::IntegerConversion { field: "child_count" })?;
    let mut out = Vec::with_capacity(count);
    let mut running = i64::from(parent.0);
    for _ in 0..count {
        running += read_delta(bytes, &mut offset)?;
        out.push(FileId(checked_id(running, "file_id")?));
    }
    Ok(out)
}
