//! Four-stage recovery pipeline.
//!
//! Given a cut point in the operation log, recovery materializes historical
//! per-file state and rebuilds a complete cache directory next to (or
//! inside) the damaged one:
//!
//! 0. setup — validate the destination, copy the interner files verbatim,
//!    copy the log truncated to the cut point, open fresh storages;
//! 1. contents — copy the dense recoverable prefix of content payloads;
//! 2. records — chunked snapshot passes initialize every file record and
//!    rewrite its attributes;
//! 3. tree — rebuild parent→children, deduplicate same-name siblings
//!    against historical child lists, connect everything reachable from the
//!    super-root;
//! 4. sweep — everything unreachable is marked free.
//!
//! Non-fatal anomalies land in [`RecoveryResult`] counters; fatal conditions
//! unwind without writing the swap marker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vfsr_error::{Result, VfsrError};
use vfsr_log::codec::OperationResult;
use vfsr_log::{LogConfig, LogStorage, OpenMode, VfsOperation};
use vfsr_payload::{PayloadSource, PayloadStore};
use vfsr_snapshot::{
    build_snapshot, decode_children, decode_super_root_children, encode_children,
    encode_super_root_children, Constraint, Filler, PropertySelector, RecordField, Snapshot,
    SnapshotView,
};
use vfsr_types::{
    flags, AttrId, FileId, LogPos, NameId, PayloadId, RecoveryTunables, SUPER_ROOT_ID,
};

use crate::records::{read_creation_timestamp, FsRecords, CONTENT_FILE, RECORDS_FILE};
use crate::swap::write_swap_marker;

/// Log directory name within a cache directory.
pub const VFSLOG_DIR: &str = "vfslog";

const MAX_DETAILED_OFFENDERS: u32 = 10;
const CANCEL_POLL_INTERVAL: u32 = 1024;

/// Stage progress sink. Returning an error cancels recovery between units
/// of work.
pub trait ProgressReporter {
    fn report(&self, fraction: f64, text: Option<&str>) -> Result<()>;
}

/// Reporter that never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _fraction: f64, _text: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Concrete shape of an enumerated attribute key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub id: AttrId,
    /// Version byte expected at the head of stored payloads, when the
    /// attribute is versioned.
    pub version_prefix: Option<u8>,
}

/// Narrow host interface: resolves enumerated attribute keys. The enumerator
/// files themselves are copied verbatim, never parsed here.
pub trait RecoveryQueryContext {
    /// The attribute key under which parents store their child lists.
    fn children_attribute(&self) -> AttrId;

    /// Resolve an enumerated key; `None` marks the key unknown, which
    /// recovery counts as a botched attribute and moves on.
    fn attribute_descriptor(&self, attr: AttrId) -> Option<AttributeDescriptor>;
}

/// Context treating every attribute as known and unversioned.
#[derive(Debug, Clone, Copy)]
pub struct DefaultQueryContext {
    pub children_attr: AttrId,
}

impl RecoveryQueryContext for DefaultQueryContext {
    fn children_attribute(&self) -> AttrId {
        self.children_attr
    }

    fn attribute_descriptor(&self, attr: AttrId) -> Option<AttributeDescriptor> {
        Some(AttributeDescriptor {
            id: attr,
            version_prefix: None,
        })
    }
}

/// Per-file lifecycle during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Undefined,
    Initialized,
    Connected,
    Unused,
    Botched,
}

/// Final per-state tallies over `[1, max_file_id]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStateCounts {
    pub initialized: u32,
    pub connected: u32,
    pub unused: u32,
    pub botched: u32,
}

/// Aggregate outcome of one recovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub file_state_counts: FileStateCounts,
    pub max_file_id: u32,
    pub last_recovered_content_id: u32,
    pub recovered_contents: u32,
    pub lost_contents: u32,
    pub recovered_attributes: u64,
    pub botched_attributes: u64,
    /// Total children involved in same-name sibling conflicts.
    pub duplicate_children_count: u64,
    /// Conflict groups resolved to a single child via historical lists.
    pub duplicate_children_deduplicated: u64,
    /// Children dropped because their conflict group could not be resolved.
    pub duplicate_children_lost: u64,
    pub duration_ms: u64,
    pub detail: Option<String>,
}

impl RecoveryResult {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Recover the cache at `old_dir` into the empty `new_dir`, reading history
/// up to `cut_point`, with tunables from the environment.
pub fn recover_from_point(
    cut_point: LogPos,
    query: &dyn RecoveryQueryContext,
    old_dir: &Path,
    new_dir: &Path,
    progress: &dyn ProgressReporter,
) -> Result<RecoveryResult> {
    recover_from_point_with(
        cut_point,
        query,
        old_dir,
        new_dir,
        progress,
        &RecoveryTunables::from_env(),
    )
}

/// [`recover_from_point`] with explicit tunables.
pub fn recover_from_point_with(
    cut_point: LogPos,
    query: &dyn RecoveryQueryContext,
    old_dir: &Path,
    new_dir: &Path,
    progress: &dyn ProgressReporter,
    tunables: &RecoveryTunables,
) -> Result<RecoveryResult> {
    run_recovery(cut_point, query, old_dir, new_dir, progress, tunables, None)
}

/// [`recover_from_point_with`] reading content and attribute blobs through a
/// caller-supplied source instead of the source cache's own `content` store.
///
/// The blob store is an external collaborator reached only through the
/// [`PayloadSource`] interface; hosts use this to interpose their own store
/// implementations.
pub fn recover_from_point_with_source(
    cut_point: LogPos,
    query: &dyn RecoveryQueryContext,
    old_dir: &Path,
    new_dir: &Path,
    progress: &dyn ProgressReporter,
    tunables: &RecoveryTunables,
    payloads: Box<dyn PayloadSource>,
) -> Result<RecoveryResult> {
    run_recovery(
        cut_point,
        query,
        old_dir,
        new_dir,
        progress,
        tunables,
        Some(payloads),
    )
}

fn run_recovery(
    cut_point: LogPos,
    query: &dyn RecoveryQueryContext,
    old_dir: &Path,
    new_dir: &Path,
    progress: &dyn ProgressReporter,
    tunables: &RecoveryTunables,
    payloads: Option<Box<dyn PayloadSource>>,
) -> Result<RecoveryResult> {
    let started = Instant::now();
    let mut ctx = RecoveryContext::setup(cut_point, old_dir, new_dir, tunables, progress, payloads)?;
    let result = ctx.run(query, started);
    match result {
        Ok(result) => Ok(result),
        Err(err @ (VfsrError::Cancelled | VfsrError::RecoveryFailed(_))) => Err(err),
        Err(err) => Err(VfsrError::RecoveryFailed(format!(
            "recovery aborted: {err}"
        ))),
    }
}

struct RecoveryContext<'a> {
    cut_point: LogPos,
    old_dir: PathBuf,
    new_dir: PathBuf,
    source_log: LogStorage,
    source_payloads: Option<Box<dyn PayloadSource>>,
    new_records: FsRecords,
    new_log: LogStorage,
    tunables: RecoveryTunables,
    progress: &'a dyn ProgressReporter,

    states: Vec<RecoveryState>,
    max_file_id: u32,
    last_recovered_content_id: u32,

    // Stage-2 accumulations consumed by stage 3.
    name_of: HashMap<u32, NameId>,
    parent_children: HashMap<u32, Vec<FileId>>,
    children_attr_refs: HashMap<u32, PayloadId>,

    recovered_contents: u32,
    lost_contents: u32,
    recovered_attributes: u64,
    botched_attributes: u64,
    duplicate_children_count: u64,
    duplicate_children_deduplicated: u64,
    duplicate_children_lost: u64,
    attr_offenders: u32,
    dup_offenders: u32,
}

impl<'a> RecoveryContext<'a> {
    // ── Stage 0: setup ────────────────────────────────────────────────────

    fn setup(
        cut_point: LogPos,
        old_dir: &Path,
        new_dir: &Path,
        tunables: &RecoveryTunables,
        progress: &'a dyn ProgressReporter,
        payloads: Option<Box<dyn PayloadSource>>,
    ) -> Result<Self> {
        progress.report(0.0, Some("validating recovery destination"))?;

        if old_dir == new_dir {
            return Err(VfsrError::RecoveryFailed(
                "destination directory equals the source cache".to_owned(),
            ));
        }
        if old_dir.join(VFSLOG_DIR) == new_dir.to_path_buf() {
            return Err(VfsrError::RecoveryFailed(
                "destination directory equals the source log directory".to_owned(),
            ));
        }
        if new_dir.exists() {
            if !new_dir.is_dir() || std::fs::read_dir(new_dir)?.next().is_some() {
                return Err(VfsrError::RecoveryFailed(format!(
                    "destination {} exists and is not an empty directory",
                    new_dir.display()
                )));
            }
        } else {
            std::fs::create_dir_all(new_dir)?;
        }

        // Interner files are copied verbatim: their identifier spaces are
        // referenced by every log operation.
        let mut names_copied = false;
        let mut attr_enums_copied = false;
        for entry in std::fs::read_dir(old_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("names") {
                std::fs::copy(entry.path(), new_dir.join(name))?;
                names_copied = true;
            } else if name.starts_with("attributes_enums") {
                std::fs::copy(entry.path(), new_dir.join(name))?;
                attr_enums_copied = true;
            }
        }
        if !names_copied || !attr_enums_copied {
            return Err(VfsrError::RecoveryFailed(format!(
                "enumerator files missing in {} (names: {names_copied}, attribute enums: {attr_enums_copied})",
                old_dir.display()
            )));
        }

        let log_config = LogConfig::from_tunables(tunables);
        let source_log = LogStorage::open(&old_dir.join(VFSLOG_DIR), OpenMode::ReadOnly, log_config)?;
        if cut_point < source_log.start_offset() || cut_point > source_log.size() {
            return Err(VfsrError::RecoveryFailed(format!(
                "cut point {} outside usable log window [{}, {}]",
                cut_point.0,
                source_log.start_offset().0,
                source_log.size().0
            )));
        }

        // Full log copy, then logically truncate the copy to the cut point.
        copy_dir_recursive(&old_dir.join(VFSLOG_DIR), &new_dir.join(VFSLOG_DIR))?;
        vfsr_log::write_marker(
            &new_dir.join(VFSLOG_DIR).join(vfsr_log::OPERATIONS_DIR).join(vfsr_log::SIZE_MARKER),
            cut_point.0,
        )?;
        let new_log = LogStorage::open(&new_dir.join(VFSLOG_DIR), OpenMode::Writable, log_config)?;

        let source_payloads: Option<Box<dyn PayloadSource>> = match payloads {
            Some(source) => Some(source),
            None => match PayloadStore::open_read_only(&old_dir.join(CONTENT_FILE)) {
                Ok(store) => Some(Box::new(store)),
                Err(VfsrError::NotFound(_)) => None,
                Err(err) => return Err(err),
            },
        };

        let new_records = FsRecords::create(new_dir)?;

        info!(
            target: "vfsr::recovery",
            old = %old_dir.display(),
            new = %new_dir.display(),
            cut = cut_point.0,
            "recovery setup complete"
        );
        Ok(Self {
            cut_point,
            old_dir: old_dir.to_path_buf(),
            new_dir: new_dir.to_path_buf(),
            source_log,
            source_payloads,
            new_records,
            new_log,
            tunables: tunables.clone(),
            progress,
            states: vec![RecoveryState::Undefined; 2],
            max_file_id: 0,
            last_recovered_content_id: 0,
            name_of: HashMap::new(),
            parent_children: HashMap::new(),
            children_attr_refs: HashMap::new(),
            recovered_contents: 0,
            lost_contents: 0,
            recovered_attributes: 0,
            botched_attributes: 0,
            duplicate_children_count: 0,
            duplicate_children_deduplicated: 0,
            duplicate_children_lost: 0,
            attr_offenders: 0,
            dup_offenders: 0,
        })
    }

    fn run(&mut self, query: &dyn RecoveryQueryContext, started: Instant) -> Result<RecoveryResult> {
        self.recover_contents()?;
        self.initialize_records(query)?;
        self.rebuild_tree(query)?;
        self.sweep_unused()?;
        self.finalize()?;

        let mut counts = FileStateCounts::default();
        for state in self.states.iter().skip(1).take(self.max_file_id as usize) {
            match state {
                RecoveryState::Initialized => counts.initialized += 1,
                RecoveryState::Connected => counts.connected += 1,
                RecoveryState::Unused => counts.unused += 1,
                RecoveryState::Botched => counts.botched += 1,
                RecoveryState::Undefined => {
                    return Err(VfsrError::RecoveryFailed(
                        "a file id finished recovery without a state".to_owned(),
                    ));
                }
            }
        }

        let result = RecoveryResult {
            file_state_counts: counts,
            max_file_id: self.max_file_id,
            last_recovered_content_id: self.last_recovered_content_id,
            recovered_contents: self.recovered_contents,
            lost_contents: self.lost_contents,
            recovered_attributes: self.recovered_attributes,
            botched_attributes: self.botched_attributes,
            duplicate_children_count: self.duplicate_children_count,
            duplicate_children_deduplicated: self.duplicate_children_deduplicated,
            duplicate_children_lost: self.duplicate_children_lost,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            detail: None,
        };
        info!(
            target: "vfsr::recovery",
            connected = result.file_state_counts.connected,
            unused = result.file_state_counts.unused,
            botched = result.file_state_counts.botched,
            recovered_contents = result.recovered_contents,
            lost_contents = result.lost_contents,
            duration_ms = result.duration_ms,
            "recovery finished"
        );
        Ok(result)
    }

    // ── Stage 1: contents ─────────────────────────────────────────────────

    fn recover_contents(&mut self) -> Result<()> {
        self.progress.report(0.05, Some("recovering content blobs"))?;
        let (_, mut iter) = self.source_log.constrained_iterators_until(self.cut_point)?;
        let snapshot = build_snapshot(
            &mut iter,
            Filler::for_properties(PropertySelector::EMPTY.with_payloads()),
        )?;

        let mut id = 1_u32;
        loop {
            if id % CANCEL_POLL_INTERVAL == 0 {
                self.progress.report(0.05, Some("recovering content blobs"))?;
            }
            if !snapshot.payload_recorded(PayloadId(id)).is_ready() {
                break;
            }
            let bytes = match &self.source_payloads {
                Some(store) => match store.read_payload(PayloadId(id)) {
                    Ok(Some(bytes)) => Some(bytes),
                    Ok(None) => None,
                    Err(VfsrError::Io(err)) => return Err(VfsrError::Io(err)),
                    Err(_) => None,
                },
                None => None,
            };
            let Some(bytes) = bytes else { break };

            let new_id = self.new_records.allocate_content_record_and_store(&bytes)?;
            if new_id.0 != id {
                // The new store must allocate densely or every surviving
                // content reference is off by the gap.
                return Err(VfsrError::RecoveryFailed(format!(
                    "content allocation went sparse: stored payload {id} under id {}",
                    new_id.0
                )));
            }
            self.recovered_contents += 1;
            self.last_recovered_content_id = id;
            id += 1;
        }

        debug!(
            target: "vfsr::recovery",
            recovered = self.recovered_contents,
            last = self.last_recovered_content_id,
            "content recovery stopped at first unavailable payload"
        );
        Ok(())
    }

    // ── Stage 2: record initialization ────────────────────────────────────

    fn initialize_records(&mut self, query: &dyn RecoveryQueryContext) -> Result<()> {
        self.progress.report(0.25, Some("initializing file records"))?;
        let chunk = self.tunables.records_init_chunk_size.max(1);
        let children_attr = query.children_attribute();

        let mut lo = 1_u32;
        loop {
            let hi = lo.saturating_add(chunk - 1);
            let (_, mut iter) = self.source_log.constrained_iterators_until(self.cut_point)?;
            let filler = Filler::for_properties(
                PropertySelector::all_scalars().with_attributes(),
            )
            .constrain(Constraint::FileRange {
                lo: FileId(lo),
                hi: FileId(hi),
            });
            let snapshot = build_snapshot(&mut iter, filler)?;

            let observed = snapshot.observed_max_file_id().0;
            if observed > self.max_file_id {
                self.max_file_id = observed;
                self.states
                    .resize(self.max_file_id as usize + 1, RecoveryState::Undefined);
                self.new_records.ensure_allocated(FileId(self.max_file_id))?;
            }

            let chunk_hi = hi.min(self.max_file_id);
            for file_id in lo..=chunk_hi {
                if file_id % CANCEL_POLL_INTERVAL == 0 {
                    self.progress.report(0.25, Some("initializing file records"))?;
                }
                self.initialize_one(&snapshot, FileId(file_id), children_attr, query)?;
            }

            if u64::from(chunk_hi) >= u64::from(self.max_file_id) {
                break;
            }
            lo = chunk_hi + 1;
        }
        Ok(())
    }

    fn initialize_one(
        &mut self,
        snapshot: &Snapshot,
        file: FileId,
        children_attr: AttrId,
        query: &dyn RecoveryQueryContext,
    ) -> Result<()> {
        if let Some(payload) = snapshot.attribute(file, children_attr) {
            self.children_attr_refs.insert(file.0, payload);
        }
        if file.is_super_root() {
            // The super-root is synthetic; its record is never filled.
            self.states[1] = RecoveryState::Initialized;
            return Ok(());
        }

        let parent = snapshot.property(file, RecordField::Parent);
        let name = snapshot.property(file, RecordField::Name);
        let length = snapshot.property(file, RecordField::Length);
        let timestamp = snapshot.property(file, RecordField::Timestamp);
        let flag_bits = snapshot.property(file, RecordField::Flags);
        let content = snapshot.property(file, RecordField::Content);

        let all_ready = [parent, name, length, timestamp, flag_bits, content]
            .iter()
            .all(|p| p.is_ready());
        if !all_ready {
            self.states[file.0 as usize] = RecoveryState::Botched;
            return Ok(());
        }
        if snapshot.is_deleted(file) {
            self.states[file.0 as usize] = RecoveryState::Unused;
            return Ok(());
        }

        let parent = FileId(parent.ready().expect("checked ready") as u32);
        let name = NameId(name.ready().expect("checked ready") as u32);
        let length = length.ready().expect("checked ready");
        let timestamp = timestamp.ready().expect("checked ready");
        let mut flag_bits = flag_bits.ready().expect("checked ready") as u32;
        let content = PayloadId(content.ready().expect("checked ready") as u32);

        self.new_records
            .fill_record(file, timestamp, length, flag_bits, name, parent)?;

        if content.0 <= self.last_recovered_content_id {
            self.new_records.set_content_id(file, content)?;
        } else {
            // The referenced blob did not survive. Zero the reference and
            // flag the record so the host reloads, and log the same two
            // facts into the new log so a later recovery from it cannot
            // re-adopt the dead id.
            flag_bits |= flags::MUST_RELOAD_CONTENT | flags::MUST_RELOAD_LENGTH;
            self.new_records.set_content_id(file, PayloadId::NONE)?;
            self.new_records.set_flags(file, flag_bits)?;
            self.new_log.append(&VfsOperation::SetContentId {
                file,
                content: PayloadId::NONE,
                result: OperationResult::Ok(0),
            })?;
            self.new_log.append(&VfsOperation::SetFlags {
                file,
                flags: flag_bits,
                result: OperationResult::Ok(0),
            })?;
            self.lost_contents += 1;
        }

        self.recover_attributes(snapshot, file, children_attr, query)?;

        self.name_of.insert(file.0, name);
        self.parent_children.entry(parent.0).or_default().push(file);
        self.states[file.0 as usize] = RecoveryState::Initialized;
        Ok(())
    }

    fn recover_attributes(
        &mut self,
        snapshot: &Snapshot,
        file: FileId,
        children_attr: AttrId,
        query: &dyn RecoveryQueryContext,
    ) -> Result<()> {
        for (attr, payload_ref) in snapshot.attributes(file) {
            if attr == children_attr {
                continue;
            }
            let Some(descriptor) = query.attribute_descriptor(attr) else {
                self.count_attr_offender(file, attr, "unknown attribute key");
                continue;
            };
            let bytes = match &self.source_payloads {
                Some(store) => match store.read_payload(payload_ref) {
                    Ok(bytes) => bytes,
                    Err(VfsrError::Io(err)) => return Err(VfsrError::Io(err)),
                    Err(_) => None,
                },
                None => None,
            };
            let Some(mut bytes) = bytes else {
                self.count_attr_offender(file, attr, "payload unreadable");
                continue;
            };
            if let Some(version) = descriptor.version_prefix {
                if bytes.first() == Some(&version) {
                    bytes.remove(0);
                } else {
                    self.count_attr_offender(file, attr, "version prefix mismatch");
                    continue;
                }
            }
            // Attribute write failures of I/O class are fatal.
            self.new_records.write_attribute(file, descriptor.id, &bytes)?;
            self.recovered_attributes += 1;
        }
        Ok(())
    }

    fn count_attr_offender(&mut self, file: FileId, attr: AttrId, reason: &str) {
        self.botched_attributes += 1;
        self.attr_offenders += 1;
        if self.attr_offenders <= MAX_DETAILED_OFFENDERS {
            warn!(
                target: "vfsr::recovery",
                file = file.0,
                attr = attr.0,
                reason,
                "attribute not recovered"
            );
        }
    }

    // ── Stage 3: tree reconstruction ──────────────────────────────────────

    fn rebuild_tree(&mut self, query: &dyn RecoveryQueryContext) -> Result<()> {
        self.progress.report(0.7, Some("rebuilding the directory tree"))?;
        let children_attr = query.children_attribute();

        let explicit = self.read_super_root_children();

        // Legacy quirk: records hanging directly under the super-root may
        // carry parent id 0 instead of 1. Both populations are candidates;
        // the explicit child list decides membership.
        let mut direct_candidates: Vec<FileId> = Vec::new();
        for parent_key in [0_u32, SUPER_ROOT_ID.0] {
            if let Some(children) = self.parent_children.get(&parent_key) {
                direct_candidates.extend(children.iter().copied());
            }
        }
        let explicit_ids: BTreeMap<u32, NameId> =
            explicit.iter().map(|&(name, file)| (file.0, name)).collect();
        let initial: Vec<(FileId, NameId)> = direct_candidates
            .into_iter()
            .filter(|file| {
                self.states.get(file.0 as usize) == Some(&RecoveryState::Initialized)
            })
            .filter_map(|file| explicit_ids.get(&file.0).map(|&name| (file, name)))
            .collect();

        let survivors = self.dedup_children(
            SUPER_ROOT_ID,
            initial,
            &explicit.iter().map(|&(_, file)| file).collect::<Vec<_>>(),
        );

        let pairs: Vec<(NameId, FileId)> = survivors
            .iter()
            .map(|&file| (self.name_of.get(&file.0).copied().unwrap_or_else(|| {
                explicit_ids.get(&file.0).copied().unwrap_or(NameId(0))
            }), file))
            .collect();
        self.new_records.write_attribute(
            SUPER_ROOT_ID,
            children_attr,
            &encode_super_root_children(&pairs),
        )?;

        let mut queue: VecDeque<FileId> = VecDeque::new();
        if !survivors.is_empty() {
            self.states[1] = RecoveryState::Connected;
        }
        for child in survivors {
            self.states[child.0 as usize] = RecoveryState::Connected;
            queue.push_back(child);
        }

        let mut processed = 0_u32;
        while let Some(parent) = queue.pop_front() {
            processed += 1;
            if processed % CANCEL_POLL_INTERVAL == 0 {
                self.progress.report(0.7, Some("rebuilding the directory tree"))?;
            }

            let candidates: Vec<(FileId, NameId)> = self
                .parent_children
                .get(&parent.0)
                .map(|children| {
                    children
                        .iter()
                        .filter(|file| {
                            self.states.get(file.0 as usize)
                                == Some(&RecoveryState::Initialized)
                        })
                        .filter_map(|&file| {
                            self.name_of.get(&file.0).map(|&name| (file, name))
                        })
                        .collect()
                })
                .unwrap_or_default();
            if candidates.is_empty() {
                continue;
            }

            let historical = self.read_historical_children(parent);
            let survivors = self.dedup_children(parent, candidates, &historical);

            self.new_records.write_attribute(
                parent,
                children_attr,
                &encode_children(parent, &survivors),
            )?;
            for child in survivors {
                self.states[child.0 as usize] = RecoveryState::Connected;
                queue.push_back(child);
            }
        }

        if self.dup_offenders > MAX_DETAILED_OFFENDERS {
            warn!(
                target: "vfsr::recovery",
                more = self.dup_offenders - MAX_DETAILED_OFFENDERS,
                "further duplicate-children conflicts were not logged in detail"
            );
        }
        Ok(())
    }

    /// Resolve same-name sibling conflicts against the parent's historical
    /// child list; returns the surviving children sorted by id.
    fn dedup_children(
        &mut self,
        parent: FileId,
        candidates: Vec<(FileId, NameId)>,
        historical: &[FileId],
    ) -> Vec<FileId> {
        let mut by_name: BTreeMap<u32, Vec<FileId>> = BTreeMap::new();
        for (file, name) in candidates {
            by_name.entry(name.0).or_default().push(file);
        }

        let mut survivors = Vec::new();
        for (name, group) in by_name {
            if group.len() == 1 {
                survivors.push(group[0]);
                continue;
            }
            self.duplicate_children_count += group.len() as u64;
            let winners: Vec<FileId> = group
                .iter()
                .copied()
                .filter(|file| historical.contains(file))
                .collect();
            self.dup_offenders += 1;
            if winners.len() == 1 {
                self.duplicate_children_deduplicated += 1;
                if self.dup_offenders <= MAX_DETAILED_OFFENDERS {
                    warn!(
                        target: "vfsr::recovery",
                        parent = parent.0,
                        name,
                        kept = winners[0].0,
                        dropped = group.len() - 1,
                        "same-name siblings deduplicated via historical child list"
                    );
                }
                survivors.push(winners[0]);
            } else {
                self.duplicate_children_lost += group.len() as u64;
                if self.dup_offenders <= MAX_DETAILED_OFFENDERS {
                    warn!(
                        target: "vfsr::recovery",
                        parent = parent.0,
                        name,
                        dropped = group.len(),
                        historical_matches = winners.len(),
                        "same-name siblings dropped: historical list does not single one out"
                    );
                }
            }
        }
        survivors.sort_unstable();
        survivors
    }

    fn read_super_root_children(&self) -> Vec<(NameId, FileId)> {
        let Some(&payload) = self.children_attr_refs.get(&SUPER_ROOT_ID.0) else {
            return Vec::new();
        };
        match self.read_source_payload(payload) {
            Some(bytes) => decode_super_root_children(&bytes).unwrap_or_else(|err| {
                warn!(
                    target: "vfsr::recovery",
                    %err,
                    "super-root children payload does not decode"
                );
                Vec::new()
            }),
            None => Vec::new(),
        }
    }

    fn read_historical_children(&self, parent: FileId) -> Vec<FileId> {
        let Some(&payload) = self.children_attr_refs.get(&parent.0) else {
            return Vec::new();
        };
        match self.read_source_payload(payload) {
            Some(bytes) => decode_children(parent, &bytes).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn read_source_payload(&self, payload: PayloadId) -> Option<Vec<u8>> {
        self.source_payloads
            .as_ref()
            .and_then(|store| store.read_payload(payload).ok())
            .flatten()
    }

    // ── Stage 4: sweep ────────────────────────────────────────────────────

    fn sweep_unused(&mut self) -> Result<()> {
        self.progress.report(0.9, Some("marking unreachable records free"))?;
        for file_id in 2..=self.max_file_id {
            if file_id % CANCEL_POLL_INTERVAL == 0 {
                self.progress.report(0.9, Some("marking unreachable records free"))?;
            }
            let state = self.states[file_id as usize];
            if matches!(state, RecoveryState::Connected | RecoveryState::Botched) {
                continue;
            }
            let file = FileId(file_id);
            let current_flags = self
                .new_records
                .record(file)
                .map(|view| view.flags)
                .unwrap_or(0);
            match self.new_records.set_flags(file, current_flags | flags::FREE_RECORD) {
                Ok(()) => self.states[file_id as usize] = RecoveryState::Unused,
                Err(err) => {
                    warn!(
                        target: "vfsr::recovery",
                        file = file_id,
                        %err,
                        "marking record free failed"
                    );
                    self.states[file_id as usize] = RecoveryState::Botched;
                }
            }
        }
        Ok(())
    }

    // ── Finalization ──────────────────────────────────────────────────────

    fn finalize(&mut self) -> Result<()> {
        self.progress.report(0.95, Some("finalizing the new cache"))?;

        // The creation timestamp is the VFS identity; the new cache keeps it.
        let timestamp = read_creation_timestamp(&self.old_dir.join(RECORDS_FILE)).map_err(
            |err| {
                VfsrError::RecoveryFailed(format!(
                    "source records header unreadable for timestamp carry-over: {err}"
                ))
            },
        )?;
        self.new_records.set_creation_timestamp(timestamp)?;

        self.new_records.flush()?;
        self.new_log.flush()?;

        write_swap_marker(&self.old_dir, &self.new_dir)?;
        self.progress.report(1.0, Some("recovery complete"))?;
        Ok(())
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
