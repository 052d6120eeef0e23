//! Copy-on-write reference-count table.
//!
//! One `u32` counter per physical page frame, tracking how many virtual
//! mappings alias that frame. The table is the single source of truth
//! for "is this frame shared": a frame with count > 1 must never be
//! written in place — the writer takes a private copy first (see
//! `pmm::FrameAllocator::copy_on_write`).
//!
//! The backing storage is carved from the front of the managed physical
//! region by the PMM, the same way the PMM's own free-list links are.
//! All access goes through one table-wide lock; counter updates are a
//! handful of instructions, so a finer grain has never been worth it.

use crate::sync::SpinLock;

/// The counters. Kept behind the table lock; `base` points into the
/// managed region and is only dereferenced while the lock is held.
struct Table {
	base: *mut u32,
	len: usize,
}

// SAFETY: the raw pointer is only accessed under the table lock.
unsafe impl Send for Table {}

/// Per-frame mapping counts, indexed by frame number.
pub struct RefCountTable {
	inner: SpinLock<Table>,
}

impl RefCountTable {
	/// Create a table over `len` counters at `base`, all initialized to 0.
	///
	/// # Safety
	/// `base` must point to `len * 4` bytes of memory that is valid for
	/// the lifetime of the table and used by nothing else.
	pub unsafe fn new(base: *mut u32, len: usize) -> Self {
		unsafe {
			core::ptr::write_bytes(base, 0, len);
		}
		Self {
			inner: SpinLock::new(Table { base, len }),
		}
	}

	/// Number of frames the table covers.
	pub fn len(&self) -> usize {
		self.inner.lock().len
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Current count for `frame`.
	pub fn get(&self, frame: usize) -> u32 {
		let table = self.inner.lock();
		assert!(frame < table.len, "refcount: frame {} out of range", frame);
		// SAFETY: bounds checked above; table lock held.
		unsafe { *table.base.add(frame) }
	}

	/// Overwrite the count for `frame`. Only the PMM uses this, when a
	/// frame leaves a free list (count 0 → 1).
	pub(crate) fn set(&self, frame: usize, count: u32) {
		let table = self.inner.lock();
		assert!(frame < table.len, "refcount: frame {} out of range", frame);
		// SAFETY: bounds checked above; table lock held.
		unsafe {
			*table.base.add(frame) = count;
		}
	}

	/// Add one mapping to `frame` (fork-style sharing).
	pub fn increment(&self, frame: usize) {
		let table = self.inner.lock();
		assert!(frame < table.len, "refcount: frame {} out of range", frame);
		// SAFETY: bounds checked above; table lock held.
		unsafe {
			let p = table.base.add(frame);
			*p += 1;
		}
	}

	/// Remove one mapping from `frame`.
	///
	/// Returns the remaining count, or `None` — without touching the
	/// counter — if it was already 0. Silent underflow would corrupt
	/// shared state, so the failure is reported to the caller instead.
	pub fn decrement(&self, frame: usize) -> Option<u32> {
		let table = self.inner.lock();
		assert!(frame < table.len, "refcount: frame {} out of range", frame);
		// SAFETY: bounds checked above; table lock held.
		unsafe {
			let p = table.base.add(frame);
			if *p == 0 {
				return None;
			}
			*p -= 1;
			Some(*p)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn table(len: usize) -> (RefCountTable, Vec<u32>) {
		let mut backing = vec![0xFFFF_FFFFu32; len];
		// SAFETY: the backing Vec outlives the table in every test.
		let t = unsafe { RefCountTable::new(backing.as_mut_ptr(), len) };
		(t, backing)
	}

	#[test]
	fn starts_at_zero() {
		let (t, _b) = table(8);
		for i in 0..8 {
			assert_eq!(t.get(i), 0);
		}
	}

	#[test]
	fn increment_decrement() {
		let (t, _b) = table(4);
		t.increment(2);
		t.increment(2);
		assert_eq!(t.get(2), 2);
		assert_eq!(t.decrement(2), Some(1));
		assert_eq!(t.decrement(2), Some(0));
		assert_eq!(t.get(2), 0);
	}

	#[test]
	fn decrement_at_zero_reports_failure() {
		let (t, _b) = table(4);
		assert_eq!(t.decrement(1), None);
		// And the counter was not disturbed.
		assert_eq!(t.get(1), 0);
	}

	#[test]
	#[should_panic(expected = "out of range")]
	fn out_of_range_is_fatal() {
		let (t, _b) = table(4);
		t.get(4);
	}
}
