// =============================================================================
// EmberOS — Kernel Core
// =============================================================================
//
// The kernel's two lowest-level shared-resource managers:
//
//   memory::pmm      — physical page allocator: one free list per core,
//                      cross-core stealing under load imbalance, and a
//                      global copy-on-write reference-count table.
//   fs::bcache       — buffer cache: fixed pool of block descriptors in
//                      hash buckets, per-bucket locking with a two-phase
//                      miss path and timestamp-LRU eviction.
//
// Both are touched by every core simultaneously. The locking rules that
// keep them deadlock-free are documented in `sync` and must be read
// before changing anything here.
//
// The crate builds `no_std` for the kernel proper. Under `cargo test` it
// builds hosted, so the test modules can exercise the same code paths
// with `std` threads standing in for cores.
// =============================================================================

#![cfg_attr(not(test), no_std)]

pub mod fs;
pub mod memory;
pub mod sync;
