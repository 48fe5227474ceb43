//! Monotonic counter set shared by topics and the bus

use std::sync::atomic::{AtomicU64, Ordering};

/// Four monotonic counters tracked per-topic and globally.
///
/// Each field is updated with a single atomic increment; reads produce
/// an instantaneous snapshot per field, with no cross-field consistency
/// guarantee (matching `examples/original_source/stats.go`'s
/// `atomicCounters`).
#[derive(Debug, Default)]
pub struct CounterSet {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time snapshot of a [`CounterSet`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl CounterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Counters {
        Counters {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let c = CounterSet::new();
        assert_eq!(c.snapshot(), Counters::default());
    }

    #[test]
    fn each_counter_increments_independently() {
        let c = CounterSet::new();
        c.inc_published();
        c.inc_published();
        c.inc_delivered();
        c.inc_dropped();
        c.inc_dropped();
        c.inc_dropped();

        let snap = c.snapshot();
        assert_eq!(snap.published, 2);
        assert_eq!(snap.delivered, 1);
        assert_eq!(snap.dropped, 3);
        assert_eq!(snap.failed, 0);
    }
}
