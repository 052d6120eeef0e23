//! RAMDisk block device driver.
//!
//! Wraps a contiguous region of memory and exposes it as a read/write
//! block device with [`BLOCK_SIZE`]-byte blocks. The boot ramdisk is one
//! of these over the module the bootloader loaded; the tests build them
//! over leaked buffers.

use crate::fs::{BlockDevice, BLOCK_SIZE};

/// A RAMDisk backed by a contiguous memory region.
pub struct RamDisk {
	base: *mut u8,
	size: usize,
}

// SAFETY: the region pointer is stable for the lifetime of the object,
// and concurrent access to one block is serialized by the buffer cache's
// per-descriptor sleep lock. Distinct blocks never overlap.
unsafe impl Send for RamDisk {}
unsafe impl Sync for RamDisk {}

impl RamDisk {
	/// Create a new `RamDisk` from a raw pointer and length.
	///
	/// # Safety
	/// `base` must point to a valid, readable and writable memory region
	/// of at least `size` bytes that remains valid for the lifetime of
	/// this object and is not accessed by anything else.
	pub const unsafe fn new(base: *mut u8, size: usize) -> Self {
		Self { base, size }
	}

	/// Total size of the ramdisk in bytes.
	#[inline]
	pub const fn size(&self) -> usize {
		self.size
	}

	/// Number of complete blocks in the ramdisk.
	#[inline]
	pub const fn block_count(&self) -> usize {
		self.size / BLOCK_SIZE
	}

	/// Byte offset of `blockno`, bounds-checked.
	///
	/// An out-of-range block number is a caller bug (see the
	/// [`BlockDevice`] contract), so it halts rather than propagating.
	fn offset(&self, blockno: u32) -> usize {
		let offset = blockno as usize * BLOCK_SIZE;
		assert!(
			offset + BLOCK_SIZE <= self.size,
			"ramdisk: block {} out of range ({} blocks)",
			blockno,
			self.block_count()
		);
		offset
	}
}

impl BlockDevice for RamDisk {
	// A RamDisk is a single-unit device; `dev` selects among devices in
	// the driver registry above this layer.
	fn read_block(&self, _dev: u32, blockno: u32, data: &mut [u8; BLOCK_SIZE]) {
		let offset = self.offset(blockno);
		// SAFETY: bounds checked; the cache serializes access per block.
		unsafe {
			core::ptr::copy_nonoverlapping(self.base.add(offset), data.as_mut_ptr(), BLOCK_SIZE);
		}
	}

	fn write_block(&self, _dev: u32, blockno: u32, data: &[u8; BLOCK_SIZE]) {
		let offset = self.offset(blockno);
		// SAFETY: bounds checked; the cache serializes access per block.
		unsafe {
			core::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), BLOCK_SIZE);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn disk(blocks: usize) -> RamDisk {
		let backing = Box::leak(vec![0u8; blocks * BLOCK_SIZE].into_boxed_slice());
		// SAFETY: leaked region outlives the disk.
		unsafe { RamDisk::new(backing.as_mut_ptr(), backing.len()) }
	}

	#[test]
	fn write_then_read_round_trips() {
		let d = disk(4);
		let mut block = [0u8; BLOCK_SIZE];
		block[0] = 0xAB;
		block[BLOCK_SIZE - 1] = 0xCD;
		d.write_block(0, 2, &block);

		let mut readback = [0u8; BLOCK_SIZE];
		d.read_block(0, 2, &mut readback);
		assert_eq!(readback, block);

		// Neighbours untouched.
		d.read_block(0, 1, &mut readback);
		assert_eq!(readback, [0u8; BLOCK_SIZE]);
		d.read_block(0, 3, &mut readback);
		assert_eq!(readback, [0u8; BLOCK_SIZE]);
	}

	#[test]
	#[should_panic(expected = "out of range")]
	fn out_of_range_block_is_fatal() {
		let d = disk(4);
		let mut buf = [0u8; BLOCK_SIZE];
		d.read_block(0, 4, &mut buf);
	}
}
