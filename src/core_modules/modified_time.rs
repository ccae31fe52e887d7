// THEORY:
// `ModifiedTime` is the staleness token shared by every stage of the pipeline.
// Rather than comparing wall-clock timestamps, every "something changed" event
// draws a fresh value from one process-wide monotonic counter. Any two events,
// on any thread, are therefore strictly ordered, and "is my output older than my
// inputs?" becomes a single integer comparison.
//
// Key architectural principles:
// 1.  **Monotonic**: `now()` never returns the same value twice.
// 2.  **Opaque**: callers only compare tokens; the integer is not a time unit.
// 3.  **Origin**: `ORIGIN` predates every event, so a collaborator that never
//     changes its configuration can simply report it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static GLOBAL_CLOCK: AtomicU64 = AtomicU64::new(1);

/// A point on the process-wide modification clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ModifiedTime(u64);

impl ModifiedTime {
    /// Earlier than any value returned by [`ModifiedTime::now`].
    pub const ORIGIN: ModifiedTime = ModifiedTime(0);

    /// Draws the next value from the clock.
    pub fn now() -> Self {
        ModifiedTime(GLOBAL_CLOCK.fetch_add(1, Ordering::Relaxed))
    }

    /// True if `self` was recorded after `other`.
    pub fn is_newer_than(&self, other: ModifiedTime) -> bool {
        self.0 > other.0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModifiedTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}
