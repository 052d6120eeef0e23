//! Physical Memory Manager (PMM) with per-core free lists.
//!
//! Tracks 4 KiB page frames with one free list per core, so the common
//! allocate/free path touches only the calling core's lock. When a core's
//! list runs dry it **steals** from a sibling's list, which bounds
//! worst-case memory pressure without a global rebalance pass.
//!
//! Every frame has a fixed *home* core, chosen by which contiguous slice
//! of the frame range it falls in. Frees always return a frame to its
//! home list, no matter which core frees it — each list only ever grows
//! from its own partition, while allocation may borrow from anywhere.
//!
//! The side tables (copy-on-write reference counts and the free-list
//! links) are carved from the first pages of the managed region itself,
//! so the allocator needs no heap.

use crate::memory::address::PhysAddr;
use crate::memory::refcount::RefCountTable;
use crate::sync::SpinLock;

use spin::Once;

/// Size of a single page frame.
pub const FRAME_SIZE: usize = 4096;

/// Maximum number of cores supported.
pub const MAX_CORES: usize = 4;

/// Junk byte written over a frame when it is handed out. Non-zero, so
/// stale or uninitialized data can't masquerade as valid zeroed memory.
pub const ALLOC_FILL: u8 = 0xA5;

/// Canary byte written over a frame when its last reference is freed.
/// A use-after-free reads this instead of the old contents.
pub const FREE_FILL: u8 = 0x5F;

/// Sentinel link value: end of a free list.
const FRAME_NONE: u32 = u32::MAX;

// ── Per-Core Free List ──────────────────────────────────────────

/// One core's free list: a singly linked chain of frame indices.
///
/// The chain itself lives in the `links` side table; the list head and
/// the link words of every frame on the list are guarded by this list's
/// lock.
struct FreeList {
	head: u32,
	len: usize,
}

// ── Frame Allocator ─────────────────────────────────────────────

/// The physical frame allocator.
///
/// Owns a caller-supplied region of physical memory and hands out
/// `FRAME_SIZE` frames from it. Thread-safe: every operation takes the
/// locks it needs internally, so a single instance is shared by all
/// cores (see the module-level [`init`]/[`alloc_frame`] facade).
///
/// Lock order (see `sync`): a core's own list lock before any foreign
/// list lock, at most one foreign lock at a time, and the refcount-table
/// lock never held together with a list lock.
pub struct FrameAllocator {
	/// Aligned base of the managed region (side tables start here).
	region: *mut u8,
	/// Address of the first allocatable frame (after the side tables).
	frames_base: u64,
	/// One past the last managed byte.
	end: u64,
	/// Number of allocatable frames.
	nframes: usize,
	/// Free-list link per frame. A frame's link word is only accessed
	/// while holding its home list's lock.
	links: *mut u32,
	/// Per-core free lists.
	lists: [SpinLock<FreeList>; MAX_CORES],
	/// Copy-on-write mapping counts, one per frame.
	refs: RefCountTable,
}

// SAFETY: the raw pointers are only dereferenced under the documented
// lock protocol — `links[i]` under frame i's home list lock, and frame
// payload bytes only while the frame is owned exclusively (just popped
// from a list, or refcount-0 during free).
unsafe impl Send for FrameAllocator {}
unsafe impl Sync for FrameAllocator {}

impl FrameAllocator {
	/// Build an allocator over the physical region `[base, base + size)`.
	///
	/// The region's first pages are claimed for the refcount and link
	/// side tables; the rest is split into frames and pushed through the
	/// normal `free_frame` path, so the whole region starts canary-filled.
	///
	/// # Panics
	/// Panics if the region is too small to hold the side tables plus at
	/// least one frame.
	///
	/// # Safety
	/// `base` must point to `size` bytes of memory that is valid for the
	/// lifetime of the allocator and used by nothing else. Frame
	/// addresses handed out are addresses inside this region.
	pub unsafe fn new(base: *mut u8, size: usize) -> Self {
		// ── 1. Align the region to frame boundaries ──
		let start = PhysAddr::new(base as u64).page_align_up();
		let end = PhysAddr::new(base as u64 + size as u64).page_align_down();
		assert!(
			end.as_u64() > start.as_u64(),
			"pmm: region too small to align"
		);
		let region = unsafe { base.add((start.as_u64() - base as u64) as usize) };
		let total_frames = ((end - start) / FRAME_SIZE as u64) as usize;

		// ── 2. Carve the side tables from the region front ──
		//	8 bytes per potential frame: 4 for the refcount, 4 for the link.
		let table_bytes = (total_frames * 8).div_ceil(FRAME_SIZE) * FRAME_SIZE;
		let frames_base = start.as_u64() + table_bytes as u64;
		assert!(frames_base < end.as_u64(), "pmm: region too small for side tables");
		let nframes = ((end.as_u64() - frames_base) / FRAME_SIZE as u64) as usize;

		let counts = region as *mut u32;
		// SAFETY: counts and links partition the carved table area, which
		// the caller guarantees is exclusively ours.
		let links = unsafe { region.add(total_frames * 4) as *mut u32 };
		let refs = unsafe { RefCountTable::new(counts, nframes) };

		const EMPTY_LIST: SpinLock<FreeList> = SpinLock::new(FreeList {
			head: FRAME_NONE,
			len: 0,
		});
		let allocator = Self {
			region,
			frames_base,
			end: end.as_u64(),
			nframes,
			links,
			lists: [EMPTY_LIST; MAX_CORES],
			refs,
		};

		// ── 3. Free every frame into its home list ──
		//	Seeding the count to 1 lets the normal free path run, which
		//	also lays down the use-after-free canary everywhere.
		for idx in 0..nframes {
			allocator.refs.set(idx, 1);
			allocator.free_frame(allocator.frame_addr(idx));
		}

		klog::info!(
			"PMM initialised: {} frames tracked ({} KiB side tables), {} KiB usable, {} per-core lists",
			nframes,
			table_bytes / 1024,
			nframes * FRAME_SIZE / 1024,
			MAX_CORES,
		);

		allocator
	}

	// ── Allocation / Free ───────────────────────────────────────

	/// Allocate a single 4 KiB physical frame.
	///
	/// Pops from `core`'s own list; on local exhaustion tries every
	/// sibling's list in turn and takes the first available frame.
	/// Returns `None` only when no core has a free frame — out of
	/// memory is the caller's call to make, not a panic.
	///
	/// The returned frame has reference count 1 and is filled with
	/// [`ALLOC_FILL`].
	pub fn alloc_frame(&self, core: usize) -> Option<PhysAddr> {
		assert!(core < MAX_CORES, "alloc_frame: core {} out of range", core);

		let mut taken = None;
		for i in 0..MAX_CORES {
			// Own list first, then steal round-robin. Only one list
			// lock is ever held at a time.
			let c = (core + i) % MAX_CORES;
			let mut list = self.lists[c].lock();
			if list.head != FRAME_NONE {
				let idx = list.head as usize;
				// SAFETY: idx heads list c and we hold that list's lock.
				list.head = unsafe { *self.links.add(idx) };
				list.len -= 1;
				taken = Some(idx);
				break;
			}
		}

		let idx = match taken {
			Some(idx) => idx,
			None => {
				klog::warn!("PMM: out of physical frames");
				return None;
			}
		};

		// Between the list pop above and the count write here the frame
		// is unreachable: on no list, count 0. Nobody can race us.
		self.refs.set(idx, 1);
		// SAFETY: we own the frame exclusively (just popped).
		unsafe {
			core::ptr::write_bytes(self.frame_ptr(idx), ALLOC_FILL, FRAME_SIZE);
		}
		Some(self.frame_addr(idx))
	}

	/// Drop one reference to `pa`, freeing the frame when the last
	/// reference goes away.
	///
	/// If other mappings still alias the frame, only the count drops.
	/// When the count reaches 0 the frame is canary-filled and pushed
	/// onto its **home** core's list — not necessarily the caller's.
	///
	/// # Panics
	/// Panics on a misaligned or out-of-range address, and on double
	/// free. Both indicate a kernel bug, not a runtime condition.
	pub fn free_frame(&self, pa: PhysAddr) {
		let idx = self.frame_index(pa);

		match self.refs.decrement(idx) {
			None => panic!("free_frame: double free of frame {}", idx),
			Some(0) => {}
			// Still aliased elsewhere — the frame stays allocated.
			Some(_) => return,
		}

		// SAFETY: count just hit 0, so no mapping references the frame;
		// it is ours until it reappears on a list below.
		unsafe {
			core::ptr::write_bytes(self.frame_ptr(idx), FREE_FILL, FRAME_SIZE);
		}

		let home = self.home_core(idx);
		let mut list = self.lists[home].lock();
		// SAFETY: idx is joining this list and we hold its lock.
		unsafe {
			*self.links.add(idx) = list.head;
		}
		list.head = idx as u32;
		list.len += 1;
	}

	// ── Copy-on-Write ───────────────────────────────────────────

	/// Produce a frame this holder may write to.
	///
	/// If `pa`'s reference count is ≤ 1 the holder is the sole owner and
	/// the same frame comes back unchanged — calling this twice on a
	/// private frame is free. Otherwise a fresh frame is allocated (on
	/// `core`) and the page contents copied into it.
	///
	/// The caller must repoint its mapping at the returned frame *and
	/// then* `decref` the original; the repoint has to happen first so
	/// that every live mapping stays counted. Returns `None` when a copy
	/// is needed but no frame is available.
	pub fn copy_on_write(&self, core: usize, pa: PhysAddr) -> Option<PhysAddr> {
		let idx = self.frame_index(pa);

		// The sharedness check is serialized against increment/decrement
		// by the table lock inside `get`.
		if self.refs.get(idx) <= 1 {
			return Some(pa);
		}

		let copy = self.alloc_frame(core)?;
		let copy_idx = self.frame_index(copy);
		// The source stays mapped read-only by every sharer while we
		// copy; a racing decref at worst makes this copy unnecessary,
		// never wrong.
		// SAFETY: source frame is live (count > 1 a moment ago), copy
		// frame is exclusively ours; the two never overlap.
		unsafe {
			core::ptr::copy_nonoverlapping(
				self.frame_ptr(idx) as *const u8,
				self.frame_ptr(copy_idx),
				FRAME_SIZE,
			);
		}
		Some(copy)
	}

	/// Add one mapping reference to `pa` (fork-style sharing of a page
	/// without copying it).
	///
	/// # Panics
	/// Panics on a misaligned or out-of-range address.
	pub fn incref(&self, pa: PhysAddr) {
		let idx = self.frame_index(pa);
		self.refs.increment(idx);
	}

	/// Remove one mapping reference from `pa` without freeing (partial
	/// unmap). Returns `false` — and changes nothing — if the count was
	/// already 0.
	pub fn decref(&self, pa: PhysAddr) -> bool {
		let idx = self.frame_index(pa);
		self.refs.decrement(idx).is_some()
	}

	/// Current reference count of `pa`. Diagnostic.
	pub fn refcount(&self, pa: PhysAddr) -> u32 {
		self.refs.get(self.frame_index(pa))
	}

	// ── Accounting ──────────────────────────────────────────────

	/// Number of allocatable frames in the managed region.
	pub fn nframes(&self) -> usize {
		self.nframes
	}

	/// Free frames per core list.
	pub fn free_counts(&self) -> [usize; MAX_CORES] {
		let mut counts = [0usize; MAX_CORES];
		for (core, count) in counts.iter_mut().enumerate() {
			*count = self.lists[core].lock().len;
		}
		counts
	}

	/// Total free frames across all lists. Approximate under concurrent
	/// traffic — each list is sampled under its own lock in turn.
	pub fn free_frame_count(&self) -> usize {
		self.free_counts().iter().sum()
	}

	// ── Internal helpers ────────────────────────────────────────

	/// Map a frame address to its index.
	///
	/// # Panics
	/// Panics if `pa` is not frame-aligned or lies outside the
	/// allocatable range (the side-table pages are outside it too).
	fn frame_index(&self, pa: PhysAddr) -> usize {
		assert!(pa.is_page_aligned(), "pmm: {} not frame-aligned", pa);
		let addr = pa.as_u64();
		assert!(
			addr >= self.frames_base && addr < self.end,
			"pmm: {} outside managed range",
			pa
		);
		((addr - self.frames_base) / FRAME_SIZE as u64) as usize
	}

	/// Address of frame `idx`.
	fn frame_addr(&self, idx: usize) -> PhysAddr {
		PhysAddr::new(self.frames_base + (idx * FRAME_SIZE) as u64)
	}

	/// Pointer to frame `idx`'s first byte.
	fn frame_ptr(&self, idx: usize) -> *mut u8 {
		let offset = self.frames_base - self.region as u64 + (idx * FRAME_SIZE) as u64;
		// SAFETY: idx < nframes, so the offset stays inside the region.
		unsafe { self.region.add(offset as usize) }
	}

	/// The home core of frame `idx`: which contiguous slice of the frame
	/// range it falls in.
	fn home_core(&self, idx: usize) -> usize {
		idx * MAX_CORES / self.nframes
	}
}

// ── Global facade ───────────────────────────────────────────────

/// Global PMM instance, initialised once at boot.
static PMM: Once<FrameAllocator> = Once::new();

/// Initialise the global physical memory manager.
///
/// A second call is ignored (the first region wins).
///
/// # Safety
/// See [`FrameAllocator::new`]; additionally, must be called before any
/// of the other module-level functions.
pub unsafe fn init(base: *mut u8, size: usize) {
	PMM.call_once(|| unsafe { FrameAllocator::new(base, size) });
}

fn pmm() -> &'static FrameAllocator {
	PMM.get().expect("PMM not initialised")
}

/// Allocate a frame from the calling core's list (stealing if needed).
pub fn alloc_frame(core: usize) -> Option<PhysAddr> {
	pmm().alloc_frame(core)
}

/// Drop one reference to a frame, freeing it on the last one.
pub fn free_frame(pa: PhysAddr) {
	pmm().free_frame(pa)
}

/// See [`FrameAllocator::copy_on_write`].
pub fn copy_on_write(core: usize, pa: PhysAddr) -> Option<PhysAddr> {
	pmm().copy_on_write(core, pa)
}

/// See [`FrameAllocator::incref`].
pub fn incref(pa: PhysAddr) {
	pmm().incref(pa)
}

/// See [`FrameAllocator::decref`].
pub fn decref(pa: PhysAddr) -> bool {
	pmm().decref(pa)
}

/// Total free frames across all per-core lists.
pub fn free_frame_count() -> usize {
	pmm().free_frame_count()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;
	use std::sync::Arc;

	/// Leak a region big enough for roughly `frames` allocatable frames
	/// (side tables and alignment slack included).
	fn region(frames: usize) -> (*mut u8, usize) {
		let size = (frames + 3) * FRAME_SIZE;
		let backing = Box::leak(vec![0u8; size].into_boxed_slice());
		(backing.as_mut_ptr(), size)
	}

	fn allocator(frames: usize) -> FrameAllocator {
		let (base, size) = region(frames);
		// SAFETY: the region is leaked, so it outlives the allocator.
		unsafe { FrameAllocator::new(base, size) }
	}

	fn frame_bytes(pa: PhysAddr) -> &'static [u8] {
		// SAFETY: test frames live in leaked regions.
		unsafe { core::slice::from_raw_parts(pa.as_u64() as *const u8, FRAME_SIZE) }
	}

	#[test]
	fn init_frees_whole_region() {
		let a = allocator(16);
		assert!(a.nframes() >= 16);
		assert_eq!(a.free_frame_count(), a.nframes());
	}

	#[test]
	fn alloc_fills_junk_and_counts_one() {
		let a = allocator(8);
		let pa = a.alloc_frame(0).expect("frame");
		assert_eq!(a.refcount(pa), 1);
		assert!(frame_bytes(pa).iter().all(|&b| b == ALLOC_FILL));
	}

	#[test]
	fn free_lays_canary() {
		let a = allocator(8);
		let pa = a.alloc_frame(0).expect("frame");
		a.free_frame(pa);
		assert_eq!(a.refcount(pa), 0);
		assert!(frame_bytes(pa).iter().all(|&b| b == FREE_FILL));
	}

	#[test]
	fn no_double_issue_and_exhaustion_is_recoverable() {
		let a = allocator(16);
		let total = a.nframes();

		let mut seen = HashSet::new();
		let mut frames = Vec::new();
		// Core 2 drains its own partition first, then steals the rest.
		while let Some(pa) = a.alloc_frame(2) {
			assert!(seen.insert(pa.as_u64()), "frame {} issued twice", pa);
			frames.push(pa);
		}
		assert_eq!(frames.len(), total);
		assert_eq!(a.free_frame_count(), 0);
		assert_eq!(a.alloc_frame(2), None);

		for pa in frames {
			a.free_frame(pa);
		}
		assert_eq!(a.free_frame_count(), total);
	}

	#[test]
	fn free_returns_to_home_partition() {
		let a = allocator(16);
		let before = a.free_counts();

		// A frame popped from core 0's list has home 0; freeing it from
		// "anywhere" must restore core 0's count, nobody else's.
		let pa = a.alloc_frame(0).expect("frame");
		let during = a.free_counts();
		assert_eq!(during[0], before[0] - 1);
		assert_eq!(&during[1..], &before[1..]);

		a.free_frame(pa);
		assert_eq!(a.free_counts(), before);
	}

	#[test]
	#[should_panic(expected = "double free")]
	fn double_free_is_fatal() {
		let a = allocator(8);
		let pa = a.alloc_frame(0).expect("frame");
		a.free_frame(pa);
		a.free_frame(pa);
	}

	#[test]
	#[should_panic(expected = "not frame-aligned")]
	fn misaligned_free_is_fatal() {
		let a = allocator(8);
		let pa = a.alloc_frame(0).expect("frame");
		a.free_frame(PhysAddr::new(pa.as_u64() + 8));
	}

	#[test]
	#[should_panic(expected = "outside managed range")]
	fn out_of_range_free_is_fatal() {
		let a = allocator(8);
		a.free_frame(PhysAddr::new(0x1000));
	}

	#[test]
	fn cow_shares_until_written() {
		let a = allocator(8);
		let pa = a.alloc_frame(0).expect("frame");

		// Scribble something recognizable into the page.
		// SAFETY: we own the frame.
		unsafe {
			core::ptr::write_bytes(pa.as_u64() as *mut u8, 0x42, FRAME_SIZE);
		}

		// Fork: share the page.
		a.incref(pa);
		assert_eq!(a.refcount(pa), 2);

		// Child write-faults: gets a private copy with identical bytes.
		let copy = a.copy_on_write(1, pa).expect("copy");
		assert_ne!(copy, pa);
		assert_eq!(a.refcount(copy), 1);
		assert!(frame_bytes(copy).iter().all(|&b| b == 0x42));

		// Child repoints its mapping, then drops the original reference.
		assert!(a.decref(pa));
		assert_eq!(a.refcount(pa), 1);

		// Sole owner now: copy_on_write is idempotent, no copy is made.
		assert_eq!(a.copy_on_write(0, pa), Some(pa));
		assert_eq!(a.copy_on_write(0, pa), Some(pa));
		assert_eq!(a.copy_on_write(1, copy), Some(copy));
	}

	#[test]
	fn decref_at_zero_reports_failure() {
		let a = allocator(8);
		let pa = a.alloc_frame(0).expect("frame");
		a.free_frame(pa);
		assert!(!a.decref(pa));
		assert_eq!(a.refcount(pa), 0);
	}

	#[test]
	fn concurrent_alloc_free_conserves_frames() {
		let a = Arc::new(allocator(64));
		let total = a.nframes();

		let mut handles = Vec::new();
		for core in 0..MAX_CORES {
			let a = Arc::clone(&a);
			handles.push(std::thread::spawn(move || {
				let mut held: Vec<PhysAddr> = Vec::new();
				for round in 0..2_000usize {
					if round % 3 == 2 {
						if let Some(pa) = held.pop() {
							a.free_frame(pa);
						}
					} else if let Some(pa) = a.alloc_frame(core) {
						// Touch the frame to shake out double-issue:
						// two owners would race on these bytes.
						// SAFETY: we own the frame until we free it.
						unsafe {
							core::ptr::write_bytes(
								pa.as_u64() as *mut u8,
								core as u8,
								FRAME_SIZE,
							);
						}
						held.push(pa);
					}
				}
				held
			}));
		}

		let mut outstanding = Vec::new();
		for h in handles {
			outstanding.extend(h.join().unwrap());
		}

		// Conservation: every frame is free or held exactly once.
		let unique: HashSet<u64> = outstanding.iter().map(|pa| pa.as_u64()).collect();
		assert_eq!(unique.len(), outstanding.len(), "frame issued to two holders");
		assert_eq!(a.free_frame_count() + outstanding.len(), total);

		for pa in outstanding {
			a.free_frame(pa);
		}
		assert_eq!(a.free_frame_count(), total);
	}

	#[test]
	fn global_facade_round_trip() {
		let (base, size) = region(16);
		// SAFETY: leaked region, called once.
		unsafe { init(base, size) };
		let pa = alloc_frame(0).expect("frame");
		incref(pa);
		assert!(decref(pa));
		free_frame(pa);
		assert!(free_frame_count() > 0);
	}
}
