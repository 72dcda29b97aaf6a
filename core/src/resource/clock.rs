//! Time source for chunk time-of-arrival stamps

use std::sync::atomic::{AtomicI64, Ordering};

use crate::data::current_millis;

/// Millisecond wall clock
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        current_millis()
    }
}

/// Clock that only moves when told to
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

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Next time of arrival after `last`
///
/// Never returns a value `<= last`, so stamps stay strictly increasing even
/// when several chunks land in the same millisecond.
pub fn next_toa(last: &mut i64, now: i64) -> i64 {
    let toa = if now > *last { now } else { *last + 1 };
    *last = toa;
    toa
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_toa_same_millisecond() {
        let mut last = 0;
        let stamps: Vec<i64> = (0..5).map(|_| next_toa(&mut last, 1000)).collect();
        assert_eq!(stamps, vec![1000, 1001, 1002, 1003, 1004]);
    }

    #[test]
    fn test_next_toa_clock_behind() {
        let mut last = 5000;
        assert_eq!(next_toa(&mut last, 10), 5001);
        assert_eq!(next_toa(&mut last, 9000), 9000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_millis(), 100);
        clock.advance(5);
        assert_eq!(clock.now_millis(), 105);
    }
}
