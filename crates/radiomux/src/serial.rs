//! # Serial Allocation
//!
//! Correlation identifiers for outstanding requests. Serials increase
//! monotonically for the lifetime of one subsystem instance and restart
//! only on a full restart, which also advances the allocator epoch so
//! timers armed before the restart can recognise themselves as stale.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Correlation identifier for one outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Serial(pub u32);

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const COUNTER_MASK: u64 = 0xFFFF_FFFF;

/// Thread-safe monotonic serial source. The first serial issued is 1.
///
/// The epoch lives in the high half of the same word as the counter, so a
/// serial and the epoch it was issued under are read in one step.
#[derive(Debug, Default)]
pub struct SerialAllocator {
    state: AtomicU64,
}

impl SerialAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next serial.
    pub fn next(&self) -> Serial {
        self.allocate().0
    }

    /// Issues the next serial together with the epoch it belongs to.
    pub fn allocate(&self) -> (Serial, u64) {
        let step = |s: u64| (s & !COUNTER_MASK) | u64::from((s as u32).wrapping_add(1));
        let prev = match self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(step(s)))
        {
            Ok(prev) | Err(prev) => prev,
        };
        let issued = step(prev);
        (Serial(issued as u32), issued >> 32)
    }

    /// Restarts numbering from 1 and advances the epoch.
    ///
    /// Only a full subsystem restart calls this; single-domain resets keep
    /// the sequence running.
    pub fn reset(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some(((s >> 32).wrapping_add(1) & COUNTER_MASK) << 32)
            });
    }

    /// Number of resets performed so far.
    pub fn epoch(&self) -> u64 {
        self.state.load(Ordering::Acquire) >> 32
    }
}
