//! Hybrid logical clock
//!
//! Change records are ordered for conflict resolution by an HLC stamp
//! rather than raw wall time, so modest clock skew between peers cannot
//! reorder causally related writes. The stamp is a wall-clock millisecond
//! component plus a logical counter that increments whenever the wall
//! clock stalls or runs behind something already observed.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// A single clock reading. Ordering is physical milliseconds first, then
/// the logical counter; the origin server id breaks full ties at the
/// comparison site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HlcStamp {
    /// Milliseconds since the UNIX epoch
    pub physical_ms: i64,
    /// Tie-break counter within one millisecond
    pub logical: u32,
}

impl HlcStamp {
    pub fn new(physical_ms: i64, logical: u32) -> Self {
        Self { physical_ms, logical }
    }
}

/// Per-node clock. `tick` stamps local captures; `observe` absorbs stamps
/// seen on remote records so later local writes sort after everything this
/// node has already applied.
pub struct HlcClock {
    last: Mutex<HlcStamp>,
}

impl HlcClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(HlcStamp::new(0, 0)),
        }
    }

    /// Produce a stamp strictly greater than every stamp this clock has
    /// issued or observed.
    pub fn tick(&self) -> HlcStamp {
        let now = now_ms();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let next = if now > last.physical_ms {
            HlcStamp::new(now, 0)
        } else {
            HlcStamp::new(last.physical_ms, last.logical + 1)
        };
        *last = next;
        next
    }

    /// Merge a remote stamp into the clock. No stamp is issued; the next
    /// `tick` is guaranteed to sort above `remote`.
    pub fn observe(&self, remote: HlcStamp) {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if remote > *last {
            *last = remote;
        }
    }

    /// Current clock position without advancing it.
    pub fn peek(&self) -> HlcStamp {
        match self.last.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Default for HlcClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall clock in milliseconds since the UNIX epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_ordering() {
        let a = HlcStamp::new(1000, 0);
        let b = HlcStamp::new(1000, 1);
        let c = HlcStamp::new(1001, 0);

        assert!(b > a);
        assert!(c > b);
        assert!(c > a);
    }

    #[test]
    fn test_tick_monotonic() {
        let clock = HlcClock::new();
        let mut last = clock.tick();
        for _ in 0..1000 {
            let current = clock.tick();
            assert!(current > last);
            last = current;
        }
    }

    #[test]
    fn test_observe_pushes_clock_forward() {
        let clock = HlcClock::new();
        let local = clock.tick();

        // A remote stamp far in the future must not be sorted above
        // subsequent local writes.
        let remote = HlcStamp::new(local.physical_ms + 60_000, 7);
        clock.observe(remote);

        let next = clock.tick();
        assert!(next > remote);
        assert!(next > local);
    }

    #[test]
    fn test_observe_ignores_stale_stamp() {
        let clock = HlcClock::new();
        let before = clock.tick();
        clock.observe(HlcStamp::new(1, 0));
        assert_eq!(clock.peek(), before);
    }
}
