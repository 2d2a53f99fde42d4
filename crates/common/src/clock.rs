//! Monotonic tick clock
//!
//! Due times are expressed as opaque [`Tick`] counts. One tick is one
//! millisecond of monotonic time since the clock's origin.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Ticks per second for every clock in this crate
pub const TICKS_PER_SEC: u64 = 1000;

/// Opaque monotonic tick count
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tick(pub u64);

impl Tick {
    /// Tick `delta` ticks after this one (saturating)
    pub fn after(self, delta: u64) -> Tick {
        Tick(self.0.saturating_add(delta))
    }

    /// Number of ticks covering `duration`, rounded up so a non-zero
    /// duration never maps to zero ticks
    pub fn ticks_in(duration: Duration) -> u64 {
        let millis = duration.as_millis();
        let rounded = if duration.subsec_nanos() % 1_000_000 != 0 {
            millis + 1
        } else {
            millis
        };
        u64::try_from(rounded).unwrap_or(u64::MAX)
    }

    /// Wall time remaining from `now` until this tick (zero if already due)
    pub fn duration_since(self, now: Tick) -> Duration {
        Duration::from_millis(self.0.saturating_sub(now.0))
    }
}

/// Source of monotonic ticks
pub trait Clock: Send + Sync + 'static {
    /// Current tick
    fn now(&self) -> Tick;
}

/// Real monotonic clock backed by [`Instant`]
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Tick {
        Tick(u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX))
    }
}

/// Manually advanced clock for deterministic tests and simulation
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Tick) -> Self {
        Self {
            now: AtomicU64::new(start.0),
        }
    }

    /// Advance the clock by `ticks` and return the new time
    pub fn advance(&self, ticks: u64) -> Tick {
        Tick(self.now.fetch_add(ticks, Ordering::SeqCst).saturating_add(ticks))
    }

    /// Jump the clock to `tick`; moving backwards is ignored
    pub fn set(&self, tick: Tick) {
        self.now.fetch_max(tick.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        Tick(self.now.load(Ordering::SeqCst))
    }
}
