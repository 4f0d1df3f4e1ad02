//! Destination record storage for a freshly recovered cache.
//!
//! Layout of the `records` file:
//!
//! ```text
//! +--------------------------------------------+
//! | Header (32 bytes)                          |
//! |   magic: u32        = 0x52534656 ("VFSR")  |
//! |   version: u16      = 1                    |
//! |   reserved: u16                            |
//! |   creation_ts: u64  (offset 8)             |
//! |   max_file_id: u32  (offset 16)            |
//! |   reserved: 12 bytes                       |
//! +--------------------------------------------+
//! | Record stride (32 bytes), one per file id  |
//! |   parent: u32 | name: u32                  |
//! |   flags: u32  | content: u32               |
//! |   length: u64 | timestamp: u64             |
//! +--------------------------------------------+
//! ```
//!
//! File id `i` occupies stride slot `i - 1`; the super-root sits in slot 0.
//! Content blobs live in a sibling `content` payload store, attribute blobs
//! in an append-only `attributes` entry file — attribute record identity is
//! deliberately not stable across recoveries, only `(file, attr)` content is.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;
use vfsr_error::{Result, VfsrError};
use vfsr_payload::PayloadStore;
use vfsr_types::{read_le_u32, read_le_u64, AttrId, FileId, NameId, PayloadId};

/// Byte offset of the 8-byte creation timestamp within the header.
pub const HEADER_TIMESTAMP_OFFSET: u64 = 8;

const RECORDS_MAGIC: u32 = 0x5253_4656; // "VFSR" in little-endian payload.
const RECORDS_VERSION: u16 = 1;
const HEADER_SIZE: u64 = 32;
const RECORD_STRIDE: u64 = 32;
const MAX_FILE_ID_OFFSET: u64 = 16;

/// Name of the record table file within a cache directory.
pub const RECORDS_FILE: &str = "records";
/// Name of the content payload store within a cache directory.
pub const CONTENT_FILE: &str = "content";
/// Name of the attribute entry file within a cache directory.
pub const ATTRIBUTES_FILE: &str = "attributes";

/// One decoded record row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView {
    pub parent: FileId,
    pub name: NameId,
    pub flags: u32,
    pub content: PayloadId,
    pub length: u64,
    pub timestamp: u64,
}

/// Append-only per-file attribute storage.
///
/// Entries are `file: u32 | attr: u32 | len: u32 | bytes`; the newest entry
/// for a `(file, attr)` pair wins.
#[derive(Debug)]
pub struct AttributeStore {
    file: File,
    tail: u64,
    index: HashMap<(u32, u32), (u64, u32)>,
}

impl AttributeStore {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let mut index = HashMap::new();
        let mut offset = 0_u64;
        while offset + 12 <= file_len {
            let mut header = [0_u8; 12];
            file.read_exact_at(&mut header, offset)?;
            let owner = read_le_u32(&header, 0)
                .map_err(|err| VfsrError::Format(err.to_string()))?;
            let attr = read_le_u32(&header, 4)
                .map_err(|err| VfsrError::Format(err.to_string()))?;
            let len = read_le_u32(&header, 8)
                .map_err(|err| VfsrError::Format(err.to_string()))?;
            let data_end = offset + 12 + u64::from(len);
            if data_end > file_len {
                break;
            }
            index.insert((owner, attr), (offset + 12, len));
            offset = data_end;
        }

        Ok(Self {
            file,
            tail: offset,
            index,
        })
    }

    pub fn write(&mut self, file: FileId, attr: AttrId, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| VfsrError::Format("attribute payload exceeds u32 length".to_owned()))?;
        let mut entry = Vec::with_capacity(bytes.len() + 12);
        entry.extend_from_slice(&file.0.to_le_bytes());
        entry.extend_from_slice(&attr.0.to_le_bytes());
        entry.extend_from_slice(&len.to_le_bytes());
        entry.extend_from_slice(bytes);
        self.file.write_all_at(&entry, self.tail)?;
        self.index
            .insert((file.0, attr.0), (self.tail + 12, len));
        self.tail += entry.len() as u64;
        Ok(())
    }

    pub fn read(&self, file: FileId, attr: AttrId) -> Result<Option<Vec<u8>>> {
        let Some(&(offset, len)) = self.index.get(&(file.0, attr.0)) else {
            return Ok(None);
        };
        let mut bytes = vec![0_u8; len as usize];
        self.file.read_exact_at(&mut bytes, offset)?;
        Ok(Some(bytes))
    }

    pub fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Handle over a cache directory's record table, content store, and
/// attribute store.
#[derive(Debug)]
pub struct FsRecords {
    table: File,
    dir: PathBuf,
    content: PayloadStore,
    attributes: AttributeStore,
    max_file_id: u32,
}

impl FsRecords {
    /// Create a fresh record storage inside `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        let path = dir.join(RECORDS_FILE);
        if path.exists() {
            return Err(VfsrError::RecoveryFailed(format!(
                "record table already exists at {}",
                path.display()
            )));
        }
        let table = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut header = [0_u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&RECORDS_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&RECORDS_VERSION.to_le_bytes());
        table.write_all_at(&header, 0)?;

        debug!(target: "vfsr::records", dir = %dir.display(), "created record storage");
        Ok(Self {
            table,
            dir: dir.to_path_buf(),
            content: PayloadStore::open(&dir.join(CONTENT_FILE))?,
            attributes: AttributeStore::open(&dir.join(ATTRIBUTES_FILE))?,
            max_file_id: 0,
        })
    }

    /// Open an existing record storage inside `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(RECORDS_FILE);
        let table = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut header = [0_u8; HEADER_SIZE as usize];
        table.read_exact_at(&mut header, 0)?;
        let magic = read_le_u32(&header, 0).map_err(|err| VfsrError::Format(err.to_string()))?;
        if magic != RECORDS_MAGIC {
            return Err(VfsrError::Format(format!(
                "record table magic mismatch: expected {RECORDS_MAGIC:#010x}, got {magic:#010x}"
            )));
        }
        let max_file_id =
            read_le_u32(&header, MAX_FILE_ID_OFFSET as usize).map_err(|err| {
                VfsrError::Format(err.to_string())
            })?;

        Ok(Self {
            table,
            dir: dir.to_path_buf(),
            content: PayloadStore::open(&dir.join(CONTENT_FILE))?,
            attributes: AttributeStore::open(&dir.join(ATTRIBUTES_FILE))?,
            max_file_id,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn max_file_id(&self) -> FileId {
        FileId(self.max_file_id)
    }

    fn record_offset(file: FileId) -> Result<u64> {
        if file.0 == 0 {
            return Err(VfsrError::Format("file id 0 names no record".to_owned()));
        }
        Ok(HEADER_SIZE + u64::from(file.0 - 1) * RECORD_STRIDE)
    }

    /// Extend the table (and the header's max id) to cover ids up to `max`,
    /// zero-filling untouched rows so every id below the ceiling reads back.
    pub fn ensure_allocated(&mut self, max: FileId) -> Result<()> {
        if max.0 > self.max_file_id {
            self.max_file_id = max.0;
            self.table
                .write_all_at(&self.max_file_id.to_le_bytes(), MAX_FILE_ID_OFFSET)?;
        }
        let needed = HEADER_SIZE + u64::from(self.max_file_id) * RECORD_STRIDE;
        if self.table.metadata()?.len() < needed {
            self.table.set_len(needed)?;
        }
        Ok(())
    }

    fn grow_to(&mut self, file: FileId) -> Result<()> {
        if file.0 > self.max_file_id {
            self.max_file_id = file.0;
            self.table
                .write_all_at(&self.max_file_id.to_le_bytes(), MAX_FILE_ID_OFFSET)?;
        }
        Ok(())
    }

    /// Overwrite the scalar fields of `file`'s record (content binding is
    /// separate).
    pub fn fill_record(
        &mut self,
        file: FileId,
        timestamp: u64,
        length: u64,
        flags: u32,
        name: NameId,
        parent: FileId,
    ) -> Result<()> {
        let offset = Self::record_offset(file)?;
        let mut row = [0_u8; RECORD_STRIDE as usize];
        row[0..4].copy_from_slice(&parent.0.to_le_bytes());
        row[4..8].copy_from_slice(&name.0.to_le_bytes());
        row[8..12].copy_from_slice(&flags.to_le_bytes());
        // content at 12..16 stays zero until bound.
        row[16..24].copy_from_slice(&length.to_le_bytes());
        row[24..32].copy_from_slice(&timestamp.to_le_bytes());
        self.table.write_all_at(&row, offset)?;
        self.grow_to(file)
    }

    pub fn set_flags(&mut self, file: FileId, flags: u32) -> Result<()> {
        let offset = Self::record_offset(file)?;
        self.table.write_all_at(&flags.to_le_bytes(), offset + 8)?;
        self.grow_to(file)
    }

    pub fn set_content_id(&mut self, file: FileId, content: PayloadId) -> Result<()> {
        let offset = Self::record_offset(file)?;
        self.table
            .write_all_at(&content.0.to_le_bytes(), offset + 12)?;
        self.grow_to(file)
    }

    /// Read a record row back.
    pub fn record(&self, file: FileId) -> Result<RecordView> {
        let offset = Self::record_offset(file)?;
        let mut row = [0_u8; RECORD_STRIDE as usize];
        self.table.read_exact_at(&mut row, offset)?;
        let view = RecordView {
            parent: FileId(read_le_u32(&row, 0).map_err(|err| VfsrError::Format(err.to_string()))?),
            name: NameId(read_le_u32(&row, 4).map_err(|err| VfsrError::Format(err.to_string()))?),
            flags: read_le_u32(&row, 8).map_err(|err| VfsrError::Format(err.to_string()))?,
            content: PayloadId(
                read_le_u32(&row, 12).map_err(|err| VfsrError::Format(err.to_string()))?,
            ),
            length: read_le_u64(&row, 16).map_err(|err| VfsrError::Format(err.to_string()))?,
            timestamp: read_le_u64(&row, 24).map_err(|err| VfsrError::Format(err.to_string()))?,
        };
        Ok(view)
    }

    /// Store a content blob; the assigned id must stay dense.
    pub fn allocate_content_record_and_store(&mut self, bytes: &[u8]) -> Result<PayloadId> {
        self.content.append(bytes)
    }

    pub fn read_content(&self, id: PayloadId) -> Result<Option<Vec<u8>>> {
        self.content.read(id)
    }

    pub fn write_attribute(&mut self, file: FileId, attr: AttrId, bytes: &[u8]) -> Result<()> {
        self.attributes.write(file, attr, bytes)
    }

    pub fn read_attribute(&self, file: FileId, attr: AttrId) -> Result<Option<Vec<u8>>> {
        self.attributes.read(file, attr)
    }

    pub fn set_creation_timestamp(&mut self, timestamp: u64) -> Result<()> {
        self.table
            .write_all_at(&timestamp.to_le_bytes(), HEADER_TIMESTAMP_OFFSET)?;
        Ok(())
    }

    pub fn creation_timestamp(&self) -> Result<u64> {
        let mut bytes = [0_u8; 8];
        self.table.read_exact_at(&mut bytes, HEADER_TIMESTAMP_OFFSET)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn flush(&self) -> Result<()> {
        self.table.sync_all()?;
        self.content.flush()?;
        self.attributes.flush()?;
        Ok(())
    }
}

/// Read the 8-byte creation timestamp from a `records` file header without
/// opening the rest of the storage (the source table may be damaged beyond
/// its header).
pub fn read_creation_timestamp(records_path: &Path) -> Result<u64> {
    let file = File::open(records_path)?;
    let mut bytes = [0_u8; 8];
    file.read_exact_at(&mut bytes, HEADER_TIMESTAMP_OFFSET)?;
    Ok(u64::from_le_bytes(bytes))
}
