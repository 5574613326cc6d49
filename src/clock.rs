//! Time sources for expiry evaluation.
//!
//! All timestamps are microseconds since the Unix epoch, the same unit
//! stored in `Value::Timestamp`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

pub const MICROS_PER_SEC: i64 = 1_000_000;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_micros(&self) -> i64;
}

/// Wall clock that never goes backwards.
///
/// Expiry must be monotonic: once a row is hidden it stays hidden. If the
/// host clock steps back, the last observed instant is returned until the
/// host catches up again.
#[derive(Debug, Default)]
pub struct SystemClock {
    high_water: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        let wall = wall_clock_micros();
        let prev = self.high_water.fetch_max(wall, Ordering::AcqRel);
        if wall < prev {
            warn!(
                step_back_micros = prev - wall,
                "wall clock moved backwards; holding last observed instant"
            );
            return prev;
        }
        wall
    }
}

/// Manually driven clock for deterministic tests and tooling.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_micros: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_micros)),
        }
    }

    /// Starts at the current wall-clock instant.
    pub fn starting_now() -> Self {
        Self::new(wall_clock_micros())
    }

    pub fn advance(&self, by: Duration) {
        let micros = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.now.fetch_add(micros, Ordering::AcqRel);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.now
            .fetch_add(secs.saturating_mul(MICROS_PER_SEC), Ordering::AcqRel);
    }

    pub fn set(&self, micros: i64) {
        self.now.store(micros, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}

pub fn wall_clock_micros() -> i64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros();
    i64::try_from(micros).unwrap_or(i64::MAX)
}

pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::{Clock, MICROS_PER_SEC, ManualClock, SystemClock};
    use std::time::Duration;

    #[test]
    fn manual_clock_advances_and_clones_share_state() {
        let clock = ManualClock::new(10 * MICROS_PER_SEC);
        let other = clock.clone();
        clock.advance_secs(5);
        assert_eq!(other.now_micros(), 15 * MICROS_PER_SEC);
        other.advance(Duration::from_millis(1));
        assert_eq!(clock.now_micros(), 15 * MICROS_PER_SEC + 1_000);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let mut last = clock.now_micros();
        for _ in 0..1_000 {
            let now = clock.now_micros();
            assert!(now >= last);
            last = now;
        }
    }
}
