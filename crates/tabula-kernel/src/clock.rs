//! Time sources.
//!
//! Everything that stamps a row takes a [`Clock`] so tests can pin time.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

/// Unix-millisecond wall clock.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        tabula_types::now_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Hands out strictly increasing stamps, even if the clock stalls or steps
/// backwards.
#[derive(Debug, Default)]
pub struct MonotonicStamps {
    last: Mutex<i64>,
}

impl MonotonicStamps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, clock: &dyn Clock) -> i64 {
        let mut last = self.last.lock();
        let stamp = clock.now_millis().max(*last + 1);
        *last = stamp;
        stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamps_increase_when_clock_is_frozen() {
        let clock = ManualClock::new(1_000);
        let stamps = MonotonicStamps::new();
        let a = stamps.next(&clock);
        let b = stamps.next(&clock);
        let c = stamps.next(&clock);
        assert_eq!((a, b, c), (1_000, 1_001, 1_002));
    }

    #[test]
    fn test_stamps_survive_clock_going_backwards() {
        let clock = ManualClock::new(5_000);
        let stamps = MonotonicStamps::new();
        assert_eq!(stamps.next(&clock), 5_000);
        clock.set(10);
        assert_eq!(stamps.next(&clock), 5_001);
        clock.advance(10_000);
        assert_eq!(stamps.next(&clock), 10_010);
    }
}
