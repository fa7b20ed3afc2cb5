//! Optimistic-restart accounting.
//!
//! Insert, find, and remove restart their root-to-leaf walk whenever a
//! concurrent structural change invalidates what they observed: a cleared
//! child slot mid-walk, or a father/grandfather link that no longer holds
//! after locking. A caller that wants to watch contention passes a
//! [`RetryCounter`] and reads it afterwards.
//!
//! The counter is strictly observational. No operation caps its retries:
//! a cap would turn contention into a visible error.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter of optimistic-restart events.
///
/// One counter may be shared by any number of threads and operations; each
/// restart adds one. Reads and writes are relaxed: the count is a
/// diagnostic tally, not a synchronization point.
///
/// # Example
///
/// ```rust
/// use critbit::{CritbitTree, RetryCounter};
///
/// let tree: CritbitTree<u32> = CritbitTree::new();
/// let retries = RetryCounter::new();
/// let guard = tree.guard();
///
/// tree.insert_with_guard(&[9; 32], 1, Some(&retries), &guard).unwrap();
/// // Uncontended operations never restart.
/// assert_eq!(retries.count(), 0);
/// ```
#[derive(Debug)]
pub struct RetryCounter {
    restarts: AtomicU64,
}

impl RetryCounter {
    /// A counter starting at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            restarts: AtomicU64::new(0),
        }
    }

    /// Restarts recorded so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Reset to zero, e.g. between workload phases.
    pub fn reset(&self) {
        self.restarts.store(0, Ordering::Relaxed);
    }

    /// Record one restart.
    pub(crate) fn record(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for RetryCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_at_zero() {
        assert_eq!(RetryCounter::new().count(), 0);
        assert_eq!(RetryCounter::default().count(), 0);
    }

    #[test]
    fn record_and_reset() {
        let counter = RetryCounter::new();
        counter.record();
        counter.record();
        assert_eq!(counter.count(), 2);
        counter.reset();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn shared_across_threads() {
        const THREADS: u64 = 4;
        const PER_THREAD: u64 = 1_000;

        let counter = Arc::new(RetryCounter::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        counter.record();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.count(), THREADS * PER_THREAD);
    }
}
