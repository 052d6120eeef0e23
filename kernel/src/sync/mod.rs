// =============================================================================
// EmberOS — Kernel Synchronization Primitives
// =============================================================================
//
// This module provides synchronization primitives for the kernel core.
// In a kernel, we can't use std::sync (there is no std). We need our own
// primitives that work in a bare-metal, multi-core environment.
//
// Two kinds of lock live here:
//   SpinLock  — short critical sections only; the holder never blocks.
//   SleepLock — serializes access to a block buffer's payload; the holder
//               may block on device I/O while holding it.
//
// IMPORTANT: Lock ordering rules for the core:
//   Buffer cache:
//     - Fast path: one bucket lock, nothing else.
//     - Miss path: cache-wide lock → target bucket lock → (at most one)
//       victim bucket lock. Never take the cache-wide lock while holding
//       a bucket lock — release the bucket lock first.
//     - A SleepLock is only ever acquired with no spinlock held.
//   Page allocator:
//     - A core's own list lock before any foreign list lock; at most one
//       foreign list lock at a time.
//     - The refcount-table lock is never held together with a list lock.
//
// NEVER hold a SpinLock across a blocking operation. Violating either
// rule WILL cause deadlocks on multi-core.
// =============================================================================

pub mod sleeplock;
pub mod spinlock;

pub use sleeplock::SleepLock;
pub use spinlock::{SpinLock, SpinLockGuard};
