//! End-to-end recovery scenarios over real on-disk fixtures.

use std::cell::Cell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use vfsr_error::{Result, VfsrError};
use vfsr_log::codec::{OperationResult, TAG_SET_LENGTH};
use vfsr_log::{LogConfig, LogStorage, OpenMode, VfsOperation};
use vfsr_payload::{PayloadSource, PayloadStore};
use vfsr_recovery::{
    apply_pending_swap, find_closest_preceding_clean_point, recover_from_point_with,
    recover_from_point_with_source, DefaultQueryContext, FsRecords, NoProgress,
    ProgressReporter, RecoveryResult, SwapOutcome, CONTENT_FILE, REPLACEMENT_MARKER, VFSLOG_DIR,
};
use vfsr_snapshot::{decode_children, decode_super_root_children, encode_children,
    encode_super_root_children};
use vfsr_types::{flags, AttrId, FileId, LogPos, NameId, PayloadId, RecoveryTunables};

const CHILDREN_ATTR: AttrId = AttrId(1);
const CREATION_TS: u64 = 0x1BAD_B002_CAFE;

fn tunables() -> RecoveryTunables {
    RecoveryTunables {
        // Small chunks exercise the multi-pass paths on tiny fixtures.
        records_init_chunk_size: 3,
        log_write_buffer_capacity: 16,
        log_chunk_size: 4096,
        clean_window: 1,
        restore_point_initial_skip_ms: 30_000,
        restore_point_multiplier: 1.618,
    }
}

fn query() -> DefaultQueryContext {
    DefaultQueryContext {
        children_attr: CHILDREN_ATTR,
    }
}

struct SourceCache {
    root: PathBuf,
    records: FsRecords,
    log: LogStorage,
}

impl SourceCache {
    fn build(root: &Path) -> Self {
        std::fs::create_dir_all(root).expect("mkdir cache root");
        std::fs::write(root.join("names"), b"interned-names").expect("names file");
        std::fs::write(root.join("attributes_enums"), b"attr-enums").expect("enum file");

        let mut records = FsRecords::create(root).expect("create source records");
        records
            .set_creation_timestamp(CREATION_TS)
            .expect("creation timestamp");
        let log = LogStorage::open(
            &root.join(VFSLOG_DIR),
            OpenMode::Writable,
            LogConfig::from_tunables(&tunables()),
        )
        .expect("open source log");
        Self {
            root: root.to_path_buf(),
            records,
            log,
        }
    }

    fn append(&self, op: VfsOperation) {
        self.log.append(&op).expect("append");
    }

    /// Emit the full six-field definition of a file.
    fn define_file(
        &self,
        file: u32,
        parent: u32,
        name: u32,
        length: u64,
        timestamp: u64,
        flag_bits: u32,
        content: u32,
    ) {
        let file = FileId(file);
        let ok = OperationResult::Ok(0);
        self.append(VfsOperation::SetParent {
            file,
            parent: FileId(parent),
            result: ok,
        });
        self.append(VfsOperation::SetNameId {
            file,
            name: NameId(name),
            result: ok,
        });
        self.append(VfsOperation::SetLength {
            file,
            length,
            result: ok,
        });
        self.append(VfsOperation::SetTimestamp {
            file,
            timestamp,
            result: ok,
        });
        self.append(VfsOperation::SetFlags {
            file,
            flags: flag_bits,
            result: ok,
        });
        self.append(VfsOperation::SetContentId {
            file,
            content: PayloadId(content),
            result: ok,
        });
    }

    /// Store a blob in the source payload store and log its append.
    fn add_payload(&mut self, bytes: &[u8]) -> PayloadId {
        let id = self
            .records
            .allocate_content_record_and_store(bytes)
            .expect("store payload");
        self.append(VfsOperation::AppendContent {
            payload: id,
            result: OperationResult::Ok(u64::from(id.0)),
        });
        id
    }

    fn set_attribute(&self, file: u32, attr: AttrId, payload: PayloadId) {
        self.append(VfsOperation::SetAttribute {
            file: FileId(file),
            attr,
            payload,
            result: OperationResult::Ok(0),
        });
    }

    fn set_super_root_children(&mut self, children: &[(u32, u32)]) {
        let pairs: Vec<(NameId, FileId)> = children
            .iter()
            .map(|&(name, file)| (NameId(name), FileId(file)))
            .collect();
        let payload = self.add_payload(&encode_super_root_children(&pairs));
        self.set_attribute(1, CHILDREN_ATTR, payload);
    }

    /// Flush everything and return the cut point at the current log end.
    fn seal(&mut self) -> LogPos {
        self.records.flush().expect("flush records");
        self.log.flush().expect("flush log");
        self.log.size()
    }

    fn recover_to(&self, cut: LogPos, new_dir: &Path) -> Result<RecoveryResult> {
        recover_from_point_with(cut, &query(), &self.root, new_dir, &NoProgress, &tunables())
    }
}

#[test]
fn clean_replay_connects_single_file_under_super_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);

    source.define_file(2, 1, 5, 10, 100, 0, 0);
    source.set_super_root_children(&[(5, 2)]);
    let cut = source.seal();

    let result = source.recover_to(cut, &new).expect("recover");
    assert_eq!(result.file_state_counts.initialized, 0);
    assert_eq!(result.file_state_counts.connected, 2);
    assert_eq!(result.file_state_counts.unused, 0);
    assert_eq!(result.file_state_counts.botched, 0);
    assert_eq!(result.max_file_id, 2);
    assert_eq!(result.lost_contents, 0);

    let recovered = FsRecords::open(&new).expect("open new records");
    let record = recovered.record(FileId(2)).expect("record 2");
    assert_eq!(record.parent, FileId(1));
    assert_eq!(record.name, NameId(5));
    assert_eq!(record.length, 10);
    assert_eq!(record.timestamp, 100);
    assert_eq!(record.flags, 0);
    assert_eq!(record.content, PayloadId::NONE);
    assert_eq!(recovered.creation_timestamp().expect("ts"), CREATION_TS);

    let children_bytes = recovered
        .read_attribute(FileId(1), CHILDREN_ATTR)
        .expect("read attr")
        .expect("present");
    assert_eq!(
        decode_super_root_children(&children_bytes).expect("decode"),
        vec![(NameId(5), FileId(2))]
    );

    // Interner files came over verbatim; the swap is armed.
    assert_eq!(
        std::fs::read(new.join("names")).expect("names"),
        b"interned-names"
    );
    assert!(old.join(REPLACEMENT_MARKER).is_file());

    // The truncated log copy ends exactly at the cut point.
    let new_log = LogStorage::open(
        &new.join(VFSLOG_DIR),
        OpenMode::ReadOnly,
        LogConfig::from_tunables(&tunables()),
    )
    .expect("open new log");
    assert_eq!(new_log.size(), cut);
}

#[test]
fn torn_tail_yields_clean_point_and_recoverable_prefix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);

    source.define_file(2, 1, 5, 10, 100, 0, 0);
    source.set_super_root_children(&[(5, 2)]);
    source
        .log
        .append_reservation(TAG_SET_LENGTH)
        .expect("reserve")
        .fail();
    let end = source.seal();

    let point = find_closest_preceding_clean_point(&source.log, end, 1)
        .expect("scan")
        .expect("clean point exists");
    let torn_len = vfsr_log::descriptor_len(TAG_SET_LENGTH).expect("len");
    assert_eq!(point, end.checked_sub(torn_len).expect("before torn"));

    let result = source.recover_to(point, &new).expect("recover");
    assert_eq!(result.max_file_id, 2);
    assert_eq!(result.file_state_counts.connected, 2);
}

#[test]
fn duplicate_children_deduplicate_against_historical_list() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);

    source.define_file(5, 1, 20, 0, 50, 0, 0);
    source.define_file(7, 5, 30, 1, 51, 0, 0);
    source.define_file(9, 5, 30, 2, 52, 0, 0);
    source.set_super_root_children(&[(20, 5)]);
    let historical = source.add_payload(&encode_children(FileId(5), &[FileId(7)]));
    source.set_attribute(5, CHILDREN_ATTR, historical);
    let cut = source.seal();

    let result = source.recover_to(cut, &new).expect("recover");
    assert_eq!(result.duplicate_children_deduplicated, 1);
    assert_eq!(result.duplicate_children_count, 2);
    assert_eq!(result.duplicate_children_lost, 0);
    // Super-root, 5, and 7 are connected; 9 lost the name conflict.
    assert_eq!(result.file_state_counts.connected, 3);
    assert_eq!(result.file_state_counts.unused, 1);

    let recovered = FsRecords::open(&new).expect("open new records");
    let children_bytes = recovered
        .read_attribute(FileId(5), CHILDREN_ATTR)
        .expect("read attr")
        .expect("present");
    assert_eq!(
        decode_children(FileId(5), &children_bytes).expect("decode"),
        vec![FileId(7)]
    );
    let nine = recovered.record(FileId(9)).expect("record 9");
    assert_ne!(nine.flags & flags::FREE_RECORD, 0);
}

#[test]
fn lost_content_zeroes_reference_and_appends_bookkeeping_ops() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);

    // File 8 references payload 42, which never made it into the store.
    source.define_file(8, 1, 6, 99, 100, 0, 42);
    source.set_super_root_children(&[(6, 8)]);
    let cut = source.seal();

    let result = source.recover_to(cut, &new).expect("recover");
    assert_eq!(result.recovered_contents, 1); // the children payload
    assert_eq!(result.lost_contents, 1);
    assert_eq!(result.last_recovered_content_id, 1);

    let recovered = FsRecords::open(&new).expect("open new records");
    let record = recovered.record(FileId(8)).expect("record 8");
    assert_eq!(record.content, PayloadId::NONE);
    assert_ne!(record.flags & flags::MUST_RELOAD_CONTENT, 0);
    assert_ne!(record.flags & flags::MUST_RELOAD_LENGTH, 0);

    // The new log carries the two synthetic operations after the cut point.
    let new_log = LogStorage::open(
        &new.join(VFSLOG_DIR),
        OpenMode::ReadOnly,
        LogConfig::from_tunables(&tunables()),
    )
    .expect("open new log");
    let mut iter = new_log.iterator_at(cut);
    let first = iter.next().expect("first synthetic op");
    let second = iter.next().expect("second synthetic op");
    assert!(matches!(
        first.as_complete(),
        Some(VfsOperation::SetContentId {
            file: FileId(8),
            content: PayloadId::NONE,
            ..
        })
    ));
    match second.as_complete() {
        Some(VfsOperation::SetFlags {
            file,
            flags: bits, ..
        }) => {
            assert_eq!(*file, FileId(8));
            assert_ne!(bits & flags::MUST_RELOAD_CONTENT, 0);
            assert_ne!(bits & flags::MUST_RELOAD_LENGTH, 0);
        }
        other => panic!("expected SetFlags, got {other:?}"),
    }
    assert!(!iter.has_next());
}

#[test]
fn super_root_child_with_zero_parent_connects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);

    // Legacy quirk: the record carries parent id 0 yet lives in the
    // super-root's explicit child list.
    source.define_file(3, 0, 40, 0, 10, 0, 0);
    source.set_super_root_children(&[(40, 3)]);
    let cut = source.seal();

    let result = source.recover_to(cut, &new).expect("recover");
    assert_eq!(result.file_state_counts.connected, 2);
    assert_eq!(result.file_state_counts.unused, 0);
}

#[test]
fn deleted_and_partial_records_settle_into_unused_and_botched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);

    source.define_file(2, 1, 5, 10, 100, 0, 0);
    // File 3 is deleted after definition; file 4 only ever got a parent.
    source.define_file(3, 1, 6, 0, 100, 0, 0);
    source.append(VfsOperation::DeleteRecord {
        file: FileId(3),
        result: OperationResult::Ok(0),
    });
    source.append(VfsOperation::SetParent {
        file: FileId(4),
        parent: FileId(1),
        result: OperationResult::Ok(0),
    });
    source.set_super_root_children(&[(5, 2)]);
    let cut = source.seal();

    let result = source.recover_to(cut, &new).expect("recover");
    assert_eq!(result.file_state_counts.connected, 2);
    assert_eq!(result.file_state_counts.unused, 1); // deleted file 3
    assert_eq!(result.file_state_counts.botched, 1); // partial file 4
    assert_eq!(result.max_file_id, 4);

    let recovered = FsRecords::open(&new).expect("open new records");
    let three = recovered.record(FileId(3)).expect("record 3");
    assert_ne!(three.flags & flags::FREE_RECORD, 0);
}

#[test]
fn attributes_are_rewritten_through_the_accessor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);

    source.define_file(2, 1, 5, 10, 100, 0, 0);
    let blob = source.add_payload(b"attribute-bytes");
    source.set_attribute(2, AttrId(7), blob);
    // A second attribute whose payload reference is dangling.
    source.set_attribute(2, AttrId(8), PayloadId(999));
    source.set_super_root_children(&[(5, 2)]);
    let cut = source.seal();

    let result = source.recover_to(cut, &new).expect("recover");
    assert_eq!(result.recovered_attributes, 1);
    assert_eq!(result.botched_attributes, 1);

    let recovered = FsRecords::open(&new).expect("open new records");
    assert_eq!(
        recovered
            .read_attribute(FileId(2), AttrId(7))
            .expect("read attr"),
        Some(b"attribute-bytes".to_vec())
    );
    assert_eq!(
        recovered
            .read_attribute(FileId(2), AttrId(8))
            .expect("read attr"),
        None
    );
}

#[test]
fn swap_installs_the_recovered_cache_on_next_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);

    source.define_file(2, 1, 5, 10, 100, 0, 0);
    source.set_super_root_children(&[(5, 2)]);
    let cut = source.seal();
    source.recover_to(cut, &new).expect("recover");

    // Simulate process restart: storages closed, swap applied.
    drop(source);
    let outcome = apply_pending_swap(&old).expect("swap");
    assert!(matches!(outcome, SwapOutcome::Swapped { .. }));

    let installed = FsRecords::open(&old).expect("open installed cache");
    assert_eq!(installed.record(FileId(2)).expect("record").name, NameId(5));
    assert_eq!(installed.creation_timestamp().expect("ts"), CREATION_TS);
}

#[test]
fn non_empty_destination_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = dir.path().join("occupied");
    let mut source = SourceCache::build(&old);
    source.define_file(2, 1, 5, 10, 100, 0, 0);
    let cut = source.seal();

    std::fs::create_dir_all(&new).expect("mkdir");
    std::fs::write(new.join("leftover"), b"x").expect("occupy");

    let err = source.recover_to(cut, &new).expect_err("must fail");
    assert!(matches!(err, VfsrError::RecoveryFailed(_)));
    assert!(!old.join(REPLACEMENT_MARKER).exists());
}

#[test]
fn missing_enumerators_are_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = dir.path().join("fresh");
    let mut source = SourceCache::build(&old);
    source.define_file(2, 1, 5, 10, 100, 0, 0);
    let cut = source.seal();
    std::fs::remove_file(old.join("attributes_enums")).expect("remove enums");

    let err = source.recover_to(cut, &new).expect_err("must fail");
    assert!(matches!(err, VfsrError::RecoveryFailed(_)));
}

/// Payload source wrapper that injects deterministic read I/O errors.
struct FaultyPayloadSource {
    inner: PayloadStore,
    read_fail_ids: HashSet<u32>,
}

impl FaultyPayloadSource {
    fn new(inner: PayloadStore, read_fail_ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            inner,
            read_fail_ids: read_fail_ids.into_iter().collect(),
        }
    }
}

impl PayloadSource for FaultyPayloadSource {
    fn read_payload(&self, id: PayloadId) -> Result<Option<Vec<u8>>> {
        if self.read_fail_ids.contains(&id.0) {
            return Err(VfsrError::Io(std::io::Error::other(format!(
                "simulated payload read i/o error at id {}",
                id.0
            ))));
        }
        self.inner.read_payload(id)
    }
}

fn faulty_source(root: &Path, read_fail_ids: impl IntoIterator<Item = u32>) -> FaultyPayloadSource {
    let store = PayloadStore::open_read_only(&root.join(CONTENT_FILE)).expect("open source store");
    FaultyPayloadSource::new(store, read_fail_ids)
}

#[test]
fn attribute_payload_read_io_error_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);

    // The attribute references a payload id that was never appended, so the
    // dense stage-1 walk stops before it and the attribute rewrite in stage
    // 2 is the first reader to hit the injected fault.
    source.define_file(2, 1, 5, 10, 100, 0, 0);
    source.set_attribute(2, AttrId(7), PayloadId(999));
    source.set_super_root_children(&[(5, 2)]);
    let cut = source.seal();

    let faulty = faulty_source(&old, [999]);
    let err = recover_from_point_with_source(
        cut,
        &query(),
        &old,
        &new,
        &NoProgress,
        &tunables(),
        Box::new(faulty),
    )
    .expect_err("recovery must abort on a payload read I/O error");
    assert!(
        matches!(
            &err,
            VfsrError::RecoveryFailed(detail)
                if detail.contains("simulated payload read i/o error")
        ),
        "expected explicit read I/O failure cause, got {err:?}"
    );
    assert!(!old.join(REPLACEMENT_MARKER).exists());
}

#[test]
fn content_payload_read_io_error_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);

    source.define_file(2, 1, 5, 10, 100, 0, 0);
    // Payload 1 (the super-root children blob) is walked by stage 1.
    source.set_super_root_children(&[(5, 2)]);
    let cut = source.seal();

    let faulty = faulty_source(&old, [1]);
    let err = recover_from_point_with_source(
        cut,
        &query(),
        &old,
        &new,
        &NoProgress,
        &tunables(),
        Box::new(faulty),
    )
    .expect_err("recovery must abort on a content read I/O error");
    assert!(
        matches!(
            &err,
            VfsrError::RecoveryFailed(detail)
                if detail.contains("simulated payload read i/o error")
        ),
        "expected explicit read I/O failure cause, got {err:?}"
    );
    assert!(!old.join(REPLACEMENT_MARKER).exists());
}

struct CancelAfter {
    remaining: Cell<u32>,
}

impl ProgressReporter for CancelAfter {
    fn report(&self, _fraction: f64, _text: Option<&str>) -> Result<()> {
        let left = self.remaining.get();
        if left == 0 {
            return Err(VfsrError::Cancelled);
        }
        self.remaining.set(left - 1);
        Ok(())
    }
}

#[test]
fn cancellation_unwinds_without_arming_the_swap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("caches");
    let new = old.join("recovered");
    let mut source = SourceCache::build(&old);
    source.define_file(2, 1, 5, 10, 100, 0, 0);
    source.set_super_root_children(&[(5, 2)]);
    let cut = source.seal();

    let progress = CancelAfter {
        remaining: Cell::new(2),
    };
    let err = recover_from_point_with(cut, &query(), &old, &new, &progress, &tunables())
        .expect_err("cancelled");
    assert!(matches!(err, VfsrError::Cancelled));
    // The destination may be partially populated, but no swap was armed.
    assert!(!old.join(REPLACEMENT_MARKER).exists());
}
