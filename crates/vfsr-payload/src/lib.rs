#![forbid(unsafe_code)]
//! Append-only content-blob store.
//!
//! Blobs are addressed by dense 1-based [`PayloadId`]s assigned in append
//! order. Each record is length-prefixed and checksummed:
//!
//! ```text
//! +-----------+------------+--------------+
//! | len: u32  | crc32c: u32| bytes[len]   |
//! +-----------+------------+--------------+
//! ```
//!
//! Opening scans the file once to rebuild the offset index; a torn tail
//! record (crashed appender) is ignored, so the valid prefix stays readable.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use vfsr_error::{Result, VfsrError};
use vfsr_types::PayloadId;

const RECORD_HEADER: u64 = 8;

/// Narrow read interface over a blob store.
///
/// Consumers that only read blobs (recovery reads the damaged cache's store
/// this way) take a `dyn PayloadSource`, so hosts can interpose their own
/// store implementations or fault-injecting wrappers.
pub trait PayloadSource {
    /// Read the blob for `id`; `None` when the id was never assigned.
    fn read_payload(&self, id: PayloadId) -> Result<Option<Vec<u8>>>;
}

impl PayloadSource for PayloadStore {
    fn read_payload(&self, id: PayloadId) -> Result<Option<Vec<u8>>> {
        self.read(id)
    }
}

#[derive(Debug, Clone, Copy)]
struct BlobSlot {
    offset: u64,
    len: u32,
    crc: u32,
}

/// Append-only blob store. See the module docs for the on-disk format.
#[derive(Debug)]
pub struct PayloadStore {
    file: File,
    path: PathBuf,
    slots: Vec<BlobSlot>,
    tail: u64,
    writable: bool,
}

impl PayloadStore {
    /// Open (or create) the store at `path` for appending.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_inner(path, true)
    }

    /// Open an existing store for reads only.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Self::open_inner(path, false)
    }

    fn open_inner(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    VfsrError::NotFound(format!("payload store missing at {}", path.display()))
                }
                _ => VfsrError::Io(err),
            })?;
        let file_len = file.metadata()?.len();

        let mut slots = Vec::new();
        let mut offset = 0_u64;
        while offset + RECORD_HEADER <= file_len {
            let mut header = [0_u8; 8];
            file.read_exact_at(&mut header, offset)?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let data_end = offset + RECORD_HEADER + u64::from(len);
            if data_end > file_len {
                // Torn tail append; the prefix before it is still whole.
                warn!(
                    target: "vfsr::payload",
                    offset,
                    len,
                    file_len,
                    "ignoring torn tail record in payload store"
                );
                break;
            }
            slots.push(BlobSlot {
                offset: offset + RECORD_HEADER,
                len,
                crc,
            });
            offset = data_end;
        }

        debug!(
            target: "vfsr::payload",
            path = %path.display(),
            blobs = slots.len(),
            writable,
            "opened payload store"
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            tail: offset,
            slots,
            writable,
        })
    }

    /// Number of stored blobs; also the value of the last assigned id.
    #[must_use]
    pub fn count(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    /// Append `bytes`, returning the dense id assigned to it.
    pub fn append(&mut self, bytes: &[u8]) -> Result<PayloadId> {
        if !self.writable {
            return Err(VfsrError::Format(format!(
                "payload store {} is read-only",
                self.path.display()
            )));
        }
        let len = u32::try_from(bytes.len())
            .map_err(|_| VfsrError::Format("payload exceeds u32 length".to_owned()))?;
        let crc = crc32c::crc32c(bytes);

        let mut record = Vec::with_capacity(bytes.len() + 8);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&crc.to_le_bytes());
        record.extend_from_slice(bytes);
        self.file.write_all_at(&record, self.tail)?;

        self.slots.push(BlobSlot {
            offset: self.tail + RECORD_HEADER,
            len,
            crc,
        });
        self.tail += record.len() as u64;
        Ok(PayloadId(self.count()))
    }

    /// Read the blob for `id`; `None` when the id was never assigned.
    pub fn read(&self, id: PayloadId) -> Result<Option<Vec<u8>>> {
        if id.is_none() {
            return Ok(None);
        }
        let Some(slot) = self.slots.get(id.0 as usize - 1) else {
            return Ok(None);
        };

        let mut bytes = vec![0_u8; slot.len as usize];
        self.file.read_exact_at(&mut bytes, slot.offset)?;
        let computed = crc32c::crc32c(&bytes);
        if computed != slot.crc {
            return Err(VfsrError::Format(format!(
                "payload {} checksum mismatch: stored {:#010x}, computed {computed:#010x}",
                id.0, slot.crc
            )));
        }
        Ok(Some(bytes))
    }

    /// Fsync pending appends.
    pub fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("content");
        let mut store = PayloadStore::open(&path).expect("open");

        for i in 1..=5_u32 {
            let id = store.append(&vec![i as u8; i as usize * 3]).expect("append");
            assert_eq!(id, PayloadId(i));
        }
        for i in 1..=5_u32 {
            let bytes = store.read(PayloadId(i)).expect("read").expect("present");
            assert_eq!(bytes, vec![i as u8; i as usize * 3]);
        }
        assert_eq!(store.read(PayloadId(6)).expect("read"), None);
        assert_eq!(store.read(PayloadId::NONE).expect("read"), None);
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("content");
        {
            let mut store = PayloadStore::open(&path).expect("open");
            store.append(b"alpha").expect("append");
            store.append(b"beta").expect("append");
            store.flush().expect("flush");
        }
        let store = PayloadStore::open_read_only(&path).expect("reopen");
        assert_eq!(store.count(), 2);
        assert_eq!(
            store.read(PayloadId(2)).expect("read").expect("present"),
            b"beta"
        );
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("content");
        {
            let mut store = PayloadStore::open(&path).expect("open");
            store.append(b"whole").expect("append");
            store.flush().expect("flush");
        }
        // Simulate a crash mid-append: header promises more data than exists.
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).expect("open");
            file.write_all(&100_u32.to_le_bytes()).expect("len");
            file.write_all(&0_u32.to_le_bytes()).expect("crc");
            file.write_all(b"par").expect("partial data");
        }
        let store = PayloadStore::open_read_only(&path).expect("reopen");
        assert_eq!(store.count(), 1);
        assert_eq!(
            store.read(PayloadId(1)).expect("read").expect("present"),
            b"whole"
        );
    }

    #[test]
    fn corrupted_blob_fails_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("content");
        {
            let mut store = PayloadStore::open(&path).expect("open");
            store.append(&[0xAB; 32]).expect("append");
            store.flush().expect("flush");
        }
        {
            let file = OpenOptions::new().write(true).open(&path).expect("open");
            file.write_all_at(&[0xFF], 12).expect("stomp");
        }
        let store = PayloadStore::open_read_only(&path).expect("reopen");
        assert!(store.read(PayloadId(1)).is_err());
    }

    #[test]
    fn source_trait_reads_match_inherent_reads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("content");
        let mut store = PayloadStore::open(&path).expect("open");
        store.append(b"via-trait").expect("append");

        let source: &dyn PayloadSource = &store;
        assert_eq!(
            source.read_payload(PayloadId(1)).expect("read"),
            Some(b"via-trait".to_vec())
        );
        assert_eq!(source.read_payload(PayloadId(2)).expect("read"), None);
    }

    #[test]
    fn read_only_store_rejects_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("content");
        PayloadStore::open(&path).expect("create");
        let mut store = PayloadStore::open_read_only(&path).expect("open");
        assert!(store.append(b"nope").is_err());
    }
}
