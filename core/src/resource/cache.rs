//! In-memory cache accounting
//!
//! Every resource reports the bytes it holds in memory here. Crossing the
//! limit wakes the eviction loop; nothing is ever refused.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

/// Running total of cached bytes across the resources of one task
#[derive(Debug)]
pub struct CacheAccounting {
    total: AtomicU64,
    max_bytes: u64,
    pressure: Notify,
}

impl CacheAccounting {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            total: AtomicU64::new(0),
            max_bytes,
            pressure: Notify::new(),
        }
    }

    /// Record newly cached bytes. Returns true when the limit is exceeded.
    pub fn add(&self, bytes: u64) -> bool {
        let total = self.total.fetch_add(bytes, Ordering::SeqCst) + bytes;
        let over = total > self.max_bytes;
        if over {
            self.pressure.notify_one();
        }
        over
    }

    /// Record released bytes (saturates at zero)
    pub fn subtract(&self, bytes: u64) {
        let _ = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| Some(t.saturating_sub(bytes)));
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn is_over(&self) -> bool {
        self.total() > self.max_bytes
    }

    /// Wait until some `add` crosses the limit
    pub async fn pressure(&self) {
        self.pressure.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_add_and_subtract() {
        let cache = CacheAccounting::new(100);
        assert!(!cache.add(60));
        assert!(cache.add(60));
        assert_eq!(cache.total(), 120);
        assert!(cache.is_over());

        cache.subtract(60);
        assert_eq!(cache.total(), 60);
        assert!(!cache.is_over());
    }

    #[test]
    fn test_subtract_saturates() {
        let cache = CacheAccounting::new(100);
        cache.add(10);
        cache.subtract(50);
        assert_eq!(cache.total(), 0);
    }

    #[tokio::test]
    async fn test_pressure_signal() {
        let cache = Arc::new(CacheAccounting::new(10));
        // notify_one stores a permit, so the waiter sees it even if it
        // starts after the add
        cache.add(20);
        tokio::time::timeout(Duration::from_secs(1), cache.pressure())
            .await
            .expect("pressure should be signalled");
    }
}
