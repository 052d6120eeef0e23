//! Block storage layer.
//!
//! The buffer cache ([`bcache`]) sits between the filesystem code above
//! and the block device driver below. The driver boundary is the
//! [`BlockDevice`] trait; [`ramdisk`] is the memory-backed device used
//! for the boot ramdisk and by the tests.

pub mod bcache;
pub mod ramdisk;

pub use bcache::{BlockGuard, BufCache, PinnedBlock, NBUCKETS, NBUF};

/// Size of one cached disk block in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// A synchronous block device.
///
/// The driver contract the buffer cache is written against:
/// - transfers always cover the full `BLOCK_SIZE` payload,
/// - calls complete synchronously from the cache's point of view (the
///   driver may block on hardware completion internally),
/// - retry policy lives in the driver — from here the operations are
///   infallible, and an out-of-range block number is a caller bug the
///   device is free to panic on.
pub trait BlockDevice: Send + Sync {
    /// Read block `blockno` of device `dev` into `data`.
    fn read_block(&self, dev: u32, blockno: u32, data: &mut [u8; BLOCK_SIZE]);

    /// Write `data` to block `blockno` of device `dev`.
    fn write_block(&self, dev: u32, blockno: u32, data: &[u8; BLOCK_SIZE]);
}
