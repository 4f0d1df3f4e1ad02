//! Bidirectional cursors over a [`LogStorage`].
//!
//! Unconstrained iterators track the live `[start_offset, size)` window;
//! constrained pairs capture the window once so that late appends cannot
//! shift a backward walk. Reading an `Invalid` record poisons the iterator:
//! a corrupt region is never a record boundary, so further traversal in
//! either direction would be runaway.

use vfsr_error::{Result, VfsrError};
use vfsr_types::LogPos;

use crate::codec::{OpMask, OperationReadResult};
use crate::storage::LogStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bounds {
    /// Re-read the storage's `[start_offset, size)` on every query.
    Live,
    /// Window captured at creation time.
    Fixed { begin: u64, end: u64 },
}

/// Bidirectional cursor over the operation log.
#[derive(Clone)]
pub struct LogIterator<'a> {
    storage: &'a LogStorage,
    position: u64,
    bounds: Bounds,
    poisoned: bool,
}

impl std::fmt::Debug for LogIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogIterator")
            .field("position", &self.position)
            .field("bounds", &self.bounds)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl<'a> LogIterator<'a> {
    fn begin(&self) -> u64 {
        match self.bounds {
            Bounds::Live => self.storage.start_offset().0,
            Bounds::Fixed { begin, .. } => begin,
        }
    }

    fn end(&self) -> u64 {
        match self.bounds {
            Bounds::Live => self.storage.size().0,
            Bounds::Fixed { end, .. } => end,
        }
    }

    #[must_use]
    pub fn position(&self) -> LogPos {
        LogPos(self.position)
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        !self.poisoned && self.position < self.end()
    }

    #[must_use]
    pub fn has_previous(&self) -> bool {
        !self.poisoned && self.position > self.begin()
    }

    /// An independent cursor at the same position with the same bounds.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Read the record at the cursor and advance past it.
    pub fn next(&mut self) -> Result<OperationReadResult> {
        self.next_filtered(OpMask::ALL)
    }

    /// Filtered forward step; excluded tags come back as `Incomplete` without
    /// payload deserialization.
    pub fn next_filtered(&mut self, mask: OpMask) -> Result<OperationReadResult> {
        if self.poisoned {
            return Err(VfsrError::Poisoned {
                position: self.position,
            });
        }
        if !self.has_next() {
            return Err(VfsrError::Format(format!(
                "iterator exhausted at position {}",
                self.position
            )));
        }
        let result = self
            .storage
            .read_at_filtered(LogPos(self.position), mask)?;
        match result.descriptor_len() {
            Some(len) => {
                self.position = self.position.saturating_add(len);
            }
            None => {
                self.poisoned = true;
            }
        }
        Ok(result)
    }

    /// Read the record ending at the cursor and retreat before it.
    pub fn previous(&mut self) -> Result<OperationReadResult> {
        self.previous_filtered(OpMask::ALL)
    }

    /// Filtered backward step.
    pub fn previous_filtered(&mut self, mask: OpMask) -> Result<OperationReadResult> {
        if self.poisoned {
            return Err(VfsrError::Poisoned {
                position: self.position,
            });
        }
        if !self.has_previous() {
            return Err(VfsrError::Format(format!(
                "iterator exhausted at position {}",
                self.position
            )));
        }
        let result = self
            .storage
            .read_preceding_filtered(LogPos(self.position), mask)?;
        match result.descriptor_len() {
            Some(len) => {
                self.position = self.position.saturating_sub(len);
            }
            None => {
                self.poisoned = true;
            }
        }
        Ok(result)
    }
}

impl LogStorage {
    /// Cursor at `pos` tracking the live log window.
    #[must_use]
    pub fn iterator_at(&self, pos: LogPos) -> LogIterator<'_> {
        LogIterator {
            storage: self,
            position: pos.0,
            bounds: Bounds::Live,
            poisoned: false,
        }
    }

    /// Cursor at the start offset tracking the live log window.
    #[must_use]
    pub fn iterator(&self) -> LogIterator<'_> {
        self.iterator_at(self.start_offset())
    }

    /// A `(begin, end)` pair of cursors over an atomically captured
    /// `[start_offset, size)` window. Late appends do not move either bound.
    #[must_use]
    pub fn constrained_iterators(&self) -> (LogIterator<'_>, LogIterator<'_>) {
        let begin = self.start_offset().0;
        let end = self.size().0;
        let bounds = Bounds::Fixed { begin, end };
        (
            LogIterator {
                storage: self,
                position: begin,
                bounds,
                poisoned: false,
            },
            LogIterator {
                storage: self,
                position: end,
                bounds,
                poisoned: false,
            },
        )
    }

    /// Constrained cursor pair ending at `end` instead of the live size.
    ///
    /// Recovery uses this to walk backward from a cut point while the
    /// physical log may extend further.
    pub fn constrained_iterators_until(
        &self,
        end: LogPos,
    ) -> Result<(LogIterator<'_>, LogIterator<'_>)> {
        let begin = self.start_offset().0;
        if end.0 < begin || end.0 > self.size().0 {
            return Err(VfsrError::Format(format!(
                "constrained end {} outside [{begin}, {}]",
                end.0,
                self.size().0
            )));
        }
        let bounds = Bounds::Fixed { begin, end: end.0 };
        Ok((
            LogIterator {
                storage: self,
                position: begin,
                bounds,
                poisoned: false,
            },
            LogIterator {
                storage: self,
                position: end.0,
                bounds,
                poisoned: false,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{OperationResult, VfsOperation, TAG_SET_PARENT};
    use crate::storage::{LogConfig, OpenMode, OPERATIONS_DIR};
    use std::os::unix::fs::FileExt;
    use vfsr_types::FileId;

    fn config() -> LogConfig {
        LogConfig {
            chunk_size: 256,
            write_buffer_capacity: 8,
        }
    }

    fn op(file: u32, length: u64) -> VfsOperation {
        VfsOperation::SetLength {
            file: FileId(file),
            length,
            result: OperationResult::Ok(0),
        }
    }

    fn build_log(dir: &std::path::Path, count: u32) -> LogStorage {
        let log = LogStorage::open(dir, OpenMode::Writable, config()).expect("open");
        for i in 0..count {
            log.append(&op(i + 2, u64::from(i))).expect("append");
        }
        log.flush().expect("flush");
        log
    }

    #[test]
    fn forward_then_backward_visits_same_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = build_log(dir.path(), 10);

        let mut forward = Vec::new();
        let mut iter = log.iterator();
        while iter.has_next() {
            if let OperationReadResult::Complete(op) = iter.next().expect("next") {
                forward.push(op);
            }
        }
        assert_eq!(forward.len(), 10);

        let mut backward = Vec::new();
        while iter.has_previous() {
            if let OperationReadResult::Complete(op) = iter.previous().expect("previous") {
                backward.push(op);
            }
        }
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn invalid_record_poisons_iterator() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = build_log(dir.path(), 3);
        let second = log
            .iterator()
            .position()
            .checked_add(23)
            .expect("second record position");

        // Corrupt the second record's head byte in place.
        let chunk = dir.path().join(OPERATIONS_DIR).join("0");
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(chunk)
            .expect("open chunk");
        file.write_all_at(&[0xEE], second.0).expect("stomp");
        drop(file);

        let fresh = LogStorage::open(dir.path(), OpenMode::ReadOnly, config()).expect("reopen");
        let mut iter = fresh.iterator();
        assert!(matches!(
            iter.next().expect("first"),
            OperationReadResult::Complete(_)
        ));
        assert!(matches!(
            iter.next().expect("second"),
            OperationReadResult::Invalid { .. }
        ));
        assert!(iter.is_poisoned());
        assert!(!iter.has_next());
        assert!(!iter.has_previous());
        assert!(iter.next().is_err());
    }

    #[test]
    fn constrained_pair_ignores_late_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = build_log(dir.path(), 4);
        let (begin, mut end) = log.constrained_iterators();
        let frozen_end = end.position();

        log.append(&op(99, 99)).expect("late append");
        log.flush().expect("flush");
        assert!(log.size() > frozen_end);

        assert_eq!(end.position(), frozen_end);
        let mut seen = 0;
        while end.has_previous() {
            end.previous().expect("previous");
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert_eq!(end.position(), begin.position());
    }

    #[test]
    fn torn_record_is_skippable_in_both_directions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = LogStorage::open(dir.path(), OpenMode::Writable, config()).expect("open");
        log.append(&op(2, 0)).expect("append");
        log.append_reservation(TAG_SET_PARENT).expect("reserve").fail();
        log.append(&op(3, 1)).expect("append");
        log.flush().expect("flush");

        let mut iter = log.iterator();
        let kind = |result: &OperationReadResult| match result {
            OperationReadResult::Complete(_) => "complete",
            OperationReadResult::Incomplete { .. } => "incomplete",
            OperationReadResult::Invalid { .. } => "invalid",
        };

        let mut forward = Vec::new();
        while iter.has_next() {
            forward.push(kind(&iter.next().expect("next")));
        }
        assert_eq!(forward, ["complete", "incomplete", "complete"]);

        let mut backward = Vec::new();
        while iter.has_previous() {
            backward.push(kind(&iter.previous().expect("previous")));
        }
        assert_eq!(backward, ["complete", "incomplete", "complete"]);
        assert!(!iter.is_poisoned());
    }
}
