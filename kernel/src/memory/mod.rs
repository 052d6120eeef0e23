//! Physical memory management.
//!
//! Three pieces, leaves first:
//!   - [`address`]  — the `PhysAddr` newtype.
//!   - [`refcount`] — per-frame mapping counters for copy-on-write.
//!   - [`pmm`]      — the per-core frame allocator built on both.
//!
//! Page tables and virtual addresses are deliberately absent: the VM
//! layer above this core owns them and only talks to us through
//! `alloc_frame` / `free_frame` / the refcount operations.

pub mod address;
pub mod pmm;
pub mod refcount;

pub use address::PhysAddr;
pub use pmm::{FrameAllocator, FRAME_SIZE, MAX_CORES};
pub use refcount::RefCountTable;
