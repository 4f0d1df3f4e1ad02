//! Safe resume points in the operation log.
//!
//! A recovery point must sit immediately after a `VFileEvent` start and be
//! preceded by a clean window: enough consecutive complete, non-exceptional
//! records that the state below the point can be trusted. The point menu
//! shown to users is thinned geometrically so restore choices spread out
//! exponentially into the past.

use serde::{Deserialize, Serialize};
use tracing::trace;
use vfsr_error::Result;
use vfsr_log::codec::{OpMask, OperationReadResult, TAG_EVENT_START};
use vfsr_log::{LogIterator, LogStorage, VfsOperation};
use vfsr_types::LogPos;

/// Spacing cap for [`thin_out`], roughly five years, so the geometric skip
/// never overflows timestamp arithmetic.
pub const MAX_SKIP_MS: u64 = 5 * 365 * 24 * 60 * 60 * 1000;

/// A usable restore point: the cut position sits immediately after an event
/// start, and the carried iterator is parked there.
pub struct RecoveryPoint<'a> {
    pub timestamp_ms: u64,
    pub iterator: LogIterator<'a>,
}

impl RecoveryPoint<'_> {
    #[must_use]
    pub fn position(&self) -> LogPos {
        self.iterator.position()
    }
}

impl std::fmt::Debug for RecoveryPoint<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryPoint")
            .field("timestamp_ms", &self.timestamp_ms)
            .field("position", &self.position().0)
            .finish()
    }
}

/// Serializable summary of a restore point for host-side listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPointInfo {
    pub timestamp_ms: u64,
    pub position: u64,
}

impl From<&RecoveryPoint<'_>> for RecoveryPointInfo {
    fn from(point: &RecoveryPoint<'_>) -> Self {
        Self {
            timestamp_ms: point.timestamp_ms,
            position: point.position().0,
        }
    }
}

/// Find the closest position at or before `point` whose `min_clean_window`
/// preceding records are all complete with non-exceptional results.
///
/// Any incomplete or exceptional record inside the window resets the
/// candidate to just before the offending record and restarts the count.
/// `None` when the log starts (or corrupts) before such a window exists.
pub fn find_closest_preceding_clean_point(
    log: &LogStorage,
    point: LogPos,
    min_clean_window: u32,
) -> Result<Option<LogPos>> {
    let mut iter = log.iterator_at(point);
    let mut candidate = point;
    let mut clean_run = 0_u32;

    loop {
        if clean_run >= min_clean_window {
            return Ok(Some(candidate));
        }
        if !iter.has_previous() {
            // Poisoned or at the log start: the window cannot be established.
            return Ok(None);
        }
        match iter.previous()? {
            OperationReadResult::Complete(op)
                if op.result().map_or(true, |result| result.is_ok()) =>
            {
                clean_run += 1;
            }
            OperationReadResult::Complete(_) | OperationReadResult::Incomplete { .. } => {
                candidate = iter.position();
                clean_run = 0;
                trace!(
                    target: "vfsr::points",
                    candidate = candidate.0,
                    "offending record reset the clean-window scan"
                );
            }
            OperationReadResult::Invalid { .. } => return Ok(None),
        }
    }
}

/// Lazy backward sequence of recovery points prior to a position.
pub struct RecoveryPoints<'a> {
    iter: LogIterator<'a>,
    done: bool,
}

/// Every event-start record encountered while walking backward from `point`
/// becomes a recovery point, newest first.
#[must_use]
pub fn generate_recovery_points_prior_to(log: &LogStorage, point: LogPos) -> RecoveryPoints<'_> {
    RecoveryPoints {
        iter: log.iterator_at(point),
        done: false,
    }
}

impl<'a> Iterator for RecoveryPoints<'a> {
    type Item = Result<RecoveryPoint<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mask = OpMask::of(&[TAG_EVENT_START]);
        while self.iter.has_previous() {
            // The cut point sits immediately after the event-start
            // descriptor, which is exactly where the cursor stands before
            // stepping over it.
            let after_event = self.iter.copy();
            match self.iter.previous_filtered(mask) {
                Ok(OperationReadResult::Complete(VfsOperation::EventStart { timestamp_ms })) => {
                    return Some(Ok(RecoveryPoint {
                        timestamp_ms,
                        iterator: after_event,
                    }));
                }
                Ok(OperationReadResult::Complete(_) | OperationReadResult::Incomplete { .. }) => {}
                Ok(OperationReadResult::Invalid { .. }) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        self.done = true;
        None
    }
}

/// Geometrically rate-limit a backward point sequence.
///
/// The first point always passes; afterwards a point passes only when its
/// timestamp is at least `skip` earlier than the last emitted one, and
/// `skip` grows by `multiplier` after each emission, capped at
/// [`MAX_SKIP_MS`].
pub fn thin_out<'a, I>(points: I, initial_skip_ms: u64, multiplier: f64) -> ThinnedPoints<'a, I>
where
    I: Iterator<Item = Result<RecoveryPoint<'a>>>,
{
    ThinnedPoints {
        inner: points,
        skip_ms: initial_skip_ms.min(MAX_SKIP_MS),
        multiplier: multiplier.max(1.0),
        last_emitted_ms: None,
    }
}

/// Iterator adapter produced by [`thin_out`].
pub struct ThinnedPoints<'a, I>
where
    I: Iterator<Item = Result<RecoveryPoint<'a>>>,
{
    inner: I,
    skip_ms: u64,
    multiplier: f64,
    last_emitted_ms: Option<u64>,
}

impl<'a, I> ThinnedPoints<'a, I>
where
    I: Iterator<Item = Result<RecoveryPoint<'a>>>,
{
    fn grow_skip(&mut self) {
        let grown = (self.skip_ms as f64 * self.multiplier).min(MAX_SKIP_MS as f64);
        self.skip_ms = grown as u64;
    }
}

impl<'a, I> Iterator for ThinnedPoints<'a, I>
where
    I: Iterator<Item = Result<RecoveryPoint<'a>>>,
{
    type Item = Result<RecoveryPoint<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let point = match self.inner.next()? {
                Ok(point) => point,
                Err(err) => return Some(Err(err)),
            };
            let passes = match self.last_emitted_ms {
                None => true,
                Some(last) => last
                    .checked_sub(point.timestamp_ms)
                    .map_or(false, |gap| gap >= self.skip_ms),
            };
            if passes {
                self.last_emitted_ms = Some(point.timestamp_ms);
                self.grow_skip();
                return Some(Ok(point));
            }
        }
    }
}
