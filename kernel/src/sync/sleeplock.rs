// =============================================================================
// EmberOS — Sleep Lock
// =============================================================================
//
// Long-term mutual exclusion for a block buffer's payload. Unlike a
// SpinLock, the holder of a SleepLock is allowed to block — the buffer
// cache holds one across a synchronous disk read or write.
//
// WHY A SEPARATE TYPE?
//   Spinlocks protect metadata for a handful of instructions. The payload
//   of a cached disk block is held for the full duration of an I/O, which
//   can be milliseconds. Folding both into one lock type would invite
//   holding a spinlock across a blocking operation, which the lock
//   ordering rules (see sync/mod.rs) forbid.
//
// WAITING:
//   Waiters spin with a PAUSE hint. This core has no scheduler to park a
//   thread on; when the kernel grows sleep queues, the wait loop is the
//   single place to swap in a real sleep/wakeup.
//
// HOLD DISCIPLINE:
//   Acquire/release pairing is enforced by the caller's RAII guard
//   (`fs::bcache::BlockGuard` is the only user). A SleepLock is never
//   acquired while any spinlock is held.
//
// =============================================================================

use core::sync::atomic::{AtomicBool, Ordering};

/// A mutual-exclusion lock that may be held across blocking operations.
///
/// This is the raw primitive: `acquire`/`release` must be paired by the
/// caller. The buffer cache wraps it in an RAII guard so the pairing is
/// checked by the compiler rather than at runtime.
pub struct SleepLock {
    /// Whether the lock is currently held.
    locked: AtomicBool,
}

impl SleepLock {
    /// Creates a new, unlocked SleepLock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, waiting as long as necessary.
    pub fn acquire(&self) {
        // Acquire ordering on success: we must see every write the
        // previous holder made to the protected payload.
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Releases the lock.
    ///
    /// Must only be called by the holder that `acquire`d it.
    pub fn release(&self) {
        // Release ordering: our payload writes become visible to the
        // next acquirer.
        self.locked.store(false, Ordering::Release);
    }

    /// Whether the lock is currently held (by anyone).
    ///
    /// Diagnostic only — the answer can be stale by the time it is read.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for SleepLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn acquire_release() {
        let lock = SleepLock::new();
        assert!(!lock.is_locked());
        lock.acquire();
        assert!(lock.is_locked());
        lock.release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn mutual_exclusion() {
        // Each thread bumps a non-atomic-looking counter emulated with
        // load+store under the lock; any overlap would lose increments.
        let lock = Arc::new(SleepLock::new());
        let value = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let value = Arc::clone(&value);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1_000 {
                    lock.acquire();
                    let v = value.load(Ordering::Relaxed);
                    std::thread::yield_now();
                    value.store(v + 1, Ordering::Relaxed);
                    lock.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(value.load(Ordering::Relaxed), 4_000);
    }
}
