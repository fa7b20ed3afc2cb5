//! Per-branch spin lock with an RAII guard.
//!
//! Only the mutation path takes locks: insert and remove hold at most two
//! of these at a time (grandfather, then father), and release them before
//! returning or retrying. Lookups never touch the lock. Critical sections
//! are a handful of pointer stores, so the lock spins rather than parking.
//!
//! # Type-State Pattern
//!
//! [`BranchGuard`] is proof that the lock is held. It cannot be constructed
//! except by [`BranchLock::lock()`], and it releases the lock when dropped,
//! even during unwinding.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lock bit: the branch's child slots are being modified.
const LOCK_BIT: u32 = 1;

/// A spin lock guarding one branch node's child slots.
///
/// Created together with its branch and lives exactly as long as it; there
/// is no separate lock registry.
#[derive(Debug)]
pub(crate) struct BranchLock {
    state: AtomicU32,
}

/// Proof that a [`BranchLock`] is held.
///
/// The lock is released when the guard drops. Guards are `!Send + !Sync`
/// via `PhantomData<*mut ()>`: a lock acquired on one thread must be
/// released on that thread.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the lock"]
pub(crate) struct BranchGuard<'a> {
    lock: &'a BranchLock,
    _marker: PhantomData<*mut ()>,
}

impl BranchLock {
    /// New, unlocked.
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Acquire the lock, spinning until it is free.
    ///
    /// Re-acquiring on the same thread while a guard is live deadlocks;
    /// the two-level coupling protocol never does so because the father
    /// and grandfather of a leaf are distinct branches.
    pub(crate) fn lock(&self) -> BranchGuard<'_> {
        loop {
            if self
                .state
                .compare_exchange_weak(0, LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return BranchGuard {
                    lock: self,
                    _marker: PhantomData,
                };
            }

            // Read-only spin until the holder releases, then race again.
            while self.state.load(Ordering::Relaxed) & LOCK_BIT != 0 {
                std::hint::spin_loop();
            }
        }
    }

    /// Whether the lock is currently held by some thread.
    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOCK_BIT != 0
    }
}

impl Drop for BranchGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
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
    fn new_lock_is_unlocked() {
        let lock = BranchLock::new();
        assert!(!lock.is_locked());
    }

    #[test]
    fn guard_holds_and_releases() {
        let lock = BranchLock::new();
        {
            let _guard = lock.lock();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn sequential_reacquire() {
        let lock = BranchLock::new();
        for _ in 0..100 {
            let _guard = lock.lock();
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn guard_released_on_panic() {
        let lock = Arc::new(BranchLock::new());
        let inner = Arc::clone(&lock);
        let result = thread::spawn(move || {
            let _guard = inner.lock();
            panic!("poisoned on purpose");
        })
        .join();
        assert!(result.is_err());
        // The unwinding thread's guard dropped; the lock must be free.
        assert!(!lock.is_locked());
        let _guard = lock.lock();
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        const THREADS: usize = 8;
        const ITERS: usize = 1_000;

        let lock = Arc::new(BranchLock::new());
        // Depth of the critical section: must never exceed 1.
        let depth = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let depth = Arc::clone(&depth);
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        let _guard = lock.lock();
                        let d = depth.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(d, 0, "two threads inside the critical section");
                        depth.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!lock.is_locked());
    }
}

// ============================================================================
//  Loom Tests
// ============================================================================

/// Loom explores all interleavings of the lock protocol.
///
/// Run with: `RUSTFLAGS="--cfg loom" cargo test --lib lock::loom_tests`
///
/// Loom tests use loom's own atomic types, so the lock is mirrored here
/// with the same CAS protocol; the spin waits become explicit yields so the
/// model checker can make progress.
#[cfg(all(loom, test))]
mod loom_tests {
    use loom::sync::Arc;
    use loom::sync::atomic::{AtomicU32, Ordering};
    use loom::thread;

    const LOCK_BIT: u32 = 1;

    struct LoomBranchLock {
        state: AtomicU32,
    }

    struct LoomBranchGuard<'a> {
        lock: &'a LoomBranchLock,
    }

    impl LoomBranchLock {
        fn new() -> Self {
            Self {
                state: AtomicU32::new(0),
            }
        }

        fn lock(&self) -> LoomBranchGuard<'_> {
            loop {
                if self
                    .state
                    .compare_exchange_weak(0, LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return LoomBranchGuard { lock: self };
                }
                thread::yield_now();
            }
        }
    }

    impl Drop for LoomBranchGuard<'_> {
        fn drop(&mut self) {
            self.lock.state.store(0, Ordering::Release);
        }
    }

    #[test]
    fn loom_mutual_exclusion() {
        loom::model(|| {
            let lock = Arc::new(LoomBranchLock::new());
            let depth = Arc::new(AtomicU32::new(0));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let lock = Arc::clone(&lock);
                    let depth = Arc::clone(&depth);
                    thread::spawn(move || {
                        let _guard = lock.lock();
                        let d = depth.fetch_add(1, Ordering::Relaxed);
                        assert_eq!(d, 0);
                        depth.fetch_sub(1, Ordering::Relaxed);
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
        });
    }

    #[test]
    fn loom_unlocked_writes_are_ordered() {
        // A non-atomic-style read-modify-write performed under the lock
        // must never lose an update.
        loom::model(|| {
            let lock = Arc::new(LoomBranchLock::new());
            let counter = Arc::new(AtomicU32::new(0));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let lock = Arc::clone(&lock);
                    let counter = Arc::clone(&counter);
                    thread::spawn(move || {
                        let _guard = lock.lock();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(counter.load(Ordering::Relaxed), 2);
        });
    }
}
