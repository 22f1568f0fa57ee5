//! Kernel time: monotonic tick counters and wrap-safe comparison.
use crate::error::{Error, Result};
use crate::utils::Init;

/// A point in kernel time, in ticks. Wraps around.
pub type Tick = u32;

/// Passed as a timeout to block without a deadline.
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Largest admissible relative timeout. Anything at or above this (other
/// than [`WAIT_FOREVER`]) cannot be ordered reliably under wrap-around and
/// is rejected with [`Error::OutOfRange`].
pub const TIMEOUT_MAX: u32 = u32::MAX / 2;

/// `true` iff `now` has reached or passed `target`, under wrap-around.
///
/// Valid as long as the two points are less than half the counter range
/// apart, which [`check_timeout`] guarantees for every accepted deadline.
#[inline]
pub(crate) fn reached(now: Tick, target: Tick) -> bool {
    now.wrapping_sub(target) as i32 >= 0
}

/// Validate a user-supplied relative timeout.
pub(crate) fn check_timeout(timeout: u32) -> Result {
    if timeout == WAIT_FOREVER || timeout < TIMEOUT_MAX {
        Ok(())
    } else {
        Err(Error::OutOfRange)
    }
}

/// The kernel's two tick counters.
///
/// `current` orders wake-up deadlines; `total_run` feeds the run-time
/// statistics. Both advance together from the tick handler while the
/// scheduler is not suspended.
pub(crate) struct Clock {
    pub(crate) current: Tick,
    pub(crate) total_run: Tick,
}

impl Init for Clock {
    const INIT: Self = Self {
        current: 0,
        total_run: 0,
    };
}
