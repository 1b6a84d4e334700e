//! Allocation front-end and the process-global heap context.
//!
//! The context owns the free list and the statistics counters behind
//! the heap lock; the bump pool and the region registry carry their
//! own locks. Lock order, innermost first: region < heap < pool, and
//! every lock is released before another component's lock is taken,
//! so at most one is held at any instant.

use lazy_static::lazy_static;
use std::cmp;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::block::{self, BlockStatus, Header, ALIGNMENT, HEADER_SIZE, MIN_PAYLOAD};
use crate::cache;
use crate::error::{self, Error, LOCK_POISONED};
use crate::freelist::FreeList;
use crate::os;
use crate::region::{self, Origin, Region};
use crate::Result;

/// Heap bookkeeping, all behind the heap lock.
struct HeapState {
  free: FreeList,
  total_allocated: usize,
  total_free: usize,
  allocation_count: usize,
  /// Informational bounds of the break-extended area.
  break_start: usize,
  break_end: usize,
}

impl HeapState {
  const fn new() -> Self {
    HeapState {
      free: FreeList::new(),
      total_allocated: 0,
      total_free: 0,
      allocation_count: 0,
      break_start: 0,
      break_end: 0,
    }
  }

  /// Inserts a free block, keeping `total_free` in step.
  unsafe fn insert_free(&mut self, block: *mut Header) {
    self.free.push(block);
    self.total_free += (*block).size;
  }

  /// Unlinks a free block, keeping `total_free` in step.
  unsafe fn remove_free(&mut self, block: *mut Header) {
    self.total_free -= (*block).size;
    self.free.unlink(block);
  }

  /// Share of tracked memory currently sitting on the free list.
  fn fragmentation(&self) -> f64 {
    let tracked = self.total_allocated + self.total_free;
    if tracked == 0 {
      0.0
    } else {
      self.total_free as f64 / tracked as f64
    }
  }
}

lazy_static! {
  static ref HEAP: Mutex<HeapState> = Mutex::new(HeapState::new());
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Point-in-time snapshot of allocator state.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
  /// Bytes in allocated blocks.
  pub total_allocated: usize,
  /// Bytes in free-list blocks.
  pub total_free: usize,
  /// Number of live allocations.
  pub allocation_count: usize,
  /// Bounds of the break-extended area; zero where the break is unused.
  pub break_start: usize,
  pub break_end: usize,
  /// `total_free / (total_allocated + total_free)`.
  pub fragmentation: f64,
  pub break_failures: u32,
  pub map_failures: u32,
  pub emergency_mode: bool,
}

impl fmt::Display for Stats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "=== Memory Allocator Statistics ===")?;
    writeln!(f, "Total allocated: {} bytes", self.total_allocated)?;
    writeln!(f, "Total free: {} bytes", self.total_free)?;
    writeln!(f, "Active allocations: {}", self.allocation_count)?;
    writeln!(f, "Break range: {:#x}..{:#x}", self.break_start, self.break_end)?;
    writeln!(f, "Fragmentation: {:.2}%", self.fragmentation * 100.0)?;
    writeln!(f, "Break failures: {}", self.break_failures)?;
    writeln!(f, "Map failures: {}", self.map_failures)?;
    write!(
      f,
      "Emergency mode: {}",
      if self.emergency_mode { "yes" } else { "no" }
    )
  }
}

/// Prepares the allocator for use.
///
/// The first allocation calls this lazily; calling it again is a
/// no-op. Fails only when the initial program break cannot be read.
pub fn initialize() -> Result<()> {
  if INITIALIZED.load(Ordering::Acquire) {
    return Ok(());
  }
  let break_now = os::current_break();
  if os::has_program_break() && break_now == 0 {
    error::record(Error::OutOfMemory);
    return Err(Error::OutOfMemory);
  }
  {
    let mut state = HEAP.lock().expect(LOCK_POISONED);
    if state.break_start == 0 {
      state.break_start = break_now;
      state.break_end = break_now;
    }
  }
  INITIALIZED.store(true, Ordering::Release);
  Ok(())
}

/// Forgets all tracking state and returns the allocator to its
/// pristine state.
///
/// Outstanding allocations must not be released afterwards; the spans
/// backing them stay with the process.
pub fn cleanup() {
  if !INITIALIZED.swap(false, Ordering::AcqRel) {
    return;
  }
  *HEAP.lock().expect(LOCK_POISONED) = HeapState::new();
  os::reset();
  region::clear();
}

/// Allocates `size` writable bytes.
///
/// Returns a 16-byte aligned pointer to at least `size` bytes, or null
/// on a zero request or failure (the cause is readable through
/// [`crate::last_error`]).
///
/// # Examples
///
/// ```
/// let ptr = hmalloc::allocate(64);
/// assert!(!ptr.is_null());
/// assert_eq!(ptr as usize % 16, 0);
/// unsafe { hmalloc::release(ptr) };
/// ```
pub fn allocate(size: usize) -> *mut u8 {
  if initialize().is_err() {
    return ptr::null_mut();
  }
  if size == 0 {
    return ptr::null_mut();
  }
  let aligned = match block::align_size(cmp::max(size, MIN_PAYLOAD)) {
    Some(aligned) => aligned,
    None => {
      error::record(Error::InvalidSize);
      return ptr::null_mut();
    }
  };

  // Per-thread fast path; recycled blocks never touch the shared state.
  if let Some(recycled) = cache::take(aligned) {
    return recycled.as_ptr();
  }

  let fragmented;
  {
    let mut state = HEAP.lock().expect(LOCK_POISONED);
    let found = unsafe { state.free.find(aligned) };
    if !found.is_null() {
      unsafe {
        state.remove_free(found);
        if block::can_split(found, aligned) {
          let carved = block::split(found, aligned);
          state.insert_free(carved);
        }
        // An unsplittable tail stays part of the payload, so physical
        // adjacency over the region is preserved.
        let granted = (*found).size;
        block::init_allocated(found, granted);
        state.total_allocated += granted;
        state.allocation_count += 1;
        return block::user_ptr(found);
      }
    }
    fragmented = state.fragmentation() > os::FRAGMENTATION_LIMIT;
  }

  // Nothing fits; source fresh memory, header included.
  let total = match HEADER_SIZE.checked_add(aligned) {
    Some(total) => total,
    None => {
      error::record(Error::InvalidSize);
      return ptr::null_mut();
    }
  };
  let span = match os::acquire(total, fragmented) {
    Some(span) => span,
    None => return ptr::null_mut(),
  };

  let header = span.base as *mut Header;
  let payload = span.len - HEADER_SIZE;
  unsafe { block::init_allocated(header, payload) };

  let mut state = HEAP.lock().expect(LOCK_POISONED);
  state.total_allocated += payload;
  state.allocation_count += 1;
  if span.origin == Origin::ProgramBreak {
    let end = span.region_base + span.region_len;
    if state.break_start == 0 || span.region_base < state.break_start {
      state.break_start = span.region_base;
    }
    if end > state.break_end {
      state.break_end = end;
    }
  }
  drop(state);
  unsafe { block::user_ptr(header) }
}

/// Allocates a zero-filled array of `count` elements of `elem_size`
/// bytes. Returns null when the total size overflows.
pub fn allocate_zeroed(count: usize, elem_size: usize) -> *mut u8 {
  let total = match count.checked_mul(elem_size) {
    Some(total) => total,
    None => {
      error::record(Error::InvalidSize);
      return ptr::null_mut();
    }
  };
  let allocated = allocate(total);
  if !allocated.is_null() {
    unsafe { ptr::write_bytes(allocated, 0, total) };
  }
  allocated
}

/// Allocates `size` bytes at an address that is a multiple of
/// `alignment`.
///
/// `alignment` must be a power of two and a multiple of the default
/// 16-byte alignment; anything else is refused with
/// [`Error::InvalidSize`].
pub fn allocate_aligned(alignment: usize, size: usize) -> *mut u8 {
  if alignment == 0 || !alignment.is_power_of_two() || alignment % ALIGNMENT != 0 {
    error::record(Error::InvalidSize);
    return ptr::null_mut();
  }
  if alignment == ALIGNMENT {
    return allocate(size);
  }

  // Over-allocate, then split the block in two: a free lead returned
  // to the list and an allocated remainder whose relocated header sits
  // directly below the first suitably aligned address.
  let padded = match size.checked_add(alignment + HEADER_SIZE + MIN_PAYLOAD) {
    Some(padded) => padded,
    None => {
      error::record(Error::InvalidSize);
      return ptr::null_mut();
    }
  };
  let raw = allocate(padded);
  if raw.is_null() {
    return raw;
  }
  let addr = raw as usize;
  if addr % alignment == 0 {
    return raw;
  }

  unsafe {
    let header = block::from_user_ptr(raw);
    let granted = (*header).size;
    // The lead must hold a whole free block, so the aligned address is
    // searched from one header plus one minimum payload in.
    let aligned_addr =
      (addr + HEADER_SIZE + MIN_PAYLOAD + alignment - 1) & !(alignment - 1);
    let lead = aligned_addr - addr;

    let relocated = (aligned_addr - HEADER_SIZE) as *mut Header;
    block::init_allocated(relocated, granted - lead);
    block::init_free(header, lead - HEADER_SIZE);

    let mut state = HEAP.lock().expect(LOCK_POISONED);
    state.total_allocated -= lead;
    state.insert_free(header);
    aligned_addr as *mut u8
  }
}

/// Releases an allocation. Null is a no-op.
///
/// A double free or a corrupted header is diagnosed on standard error
/// and terminates the process; lesser defects set the last-error value
/// and leave the heap untouched.
///
/// # Safety
///
/// `ptr` must be null or a pointer obtained from this allocator that
/// has not been released since.
pub unsafe fn release(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  let header = block::from_user_ptr(ptr);
  match block::verify_integrity(header) {
    BlockStatus::Valid => {}
    BlockStatus::CorruptMagic => {
      error::fatal(
        Error::Corruption,
        format_args!("heap corruption detected: invalid magic at {:p}", ptr),
      );
    }
    BlockStatus::InvalidFreeState => {
      error::fatal(
        Error::Corruption,
        format_args!("heap corruption detected: invalid free state at {:p}", ptr),
      );
    }
    BlockStatus::Misaligned => {
      error::record(Error::Misaligned);
      return;
    }
    BlockStatus::InvalidSize => {
      error::record(Error::Corruption);
      return;
    }
    BlockStatus::OutOfBounds => {
      error::record(Error::InvalidPointer);
      return;
    }
  }
  if (*header).is_free == 1 {
    error::fatal(
      Error::DoubleFree,
      format_args!("double free detected at {:p}", ptr),
    );
  }

  // Classify before taking the heap lock; coalescing must not cross
  // the region boundary.
  let within = match region::find(header as usize) {
    Some(within) => within,
    None => {
      error::record(Error::InvalidPointer);
      return;
    }
  };

  // Per-thread fast path; an accepted block stays allocated.
  if cache::put(ptr, (*header).size) {
    return;
  }

  let mut state = HEAP.lock().expect(LOCK_POISONED);
  state.total_allocated -= (*header).size;
  state.allocation_count -= 1;
  block::init_free(header, (*header).size);
  let merged = coalesce(&mut state, header, &within);
  state.insert_free(merged);
}

/// Merges `block` with free neighbours on both physical sides, never
/// crossing the region boundary. Returns the merged block, unlinked.
///
/// The backward probe scans the free list for a member ending exactly
/// at `block`; the forward probe inspects the header one past the
/// payload, which is a real header only at a tiling position.
unsafe fn coalesce(state: &mut HeapState, block: *mut Header, within: &Region) -> *mut Header {
  let mut block = block;

  let previous = state.free.predecessor_of(block);
  if !previous.is_null() && within.contains(previous as usize) {
    state.remove_free(previous);
    (*previous).size += HEADER_SIZE + (*block).size;
    block = previous;
  }

  let next = block::next_block(block);
  if within.contains_range(next as usize, HEADER_SIZE)
    && block::verify_integrity(next) == BlockStatus::Valid
    && (*next).is_free == 1
    && state.free.contains(next)
  {
    state.remove_free(next);
    (*block).size += HEADER_SIZE + (*next).size;
  }

  block
}

/// Resizes an allocation, preserving its contents.
///
/// Null grows from nothing; zero releases and returns null. When the
/// existing payload already covers the request the pointer is returned
/// unchanged; otherwise the contents move to a fresh block and the old
/// one is released.
///
/// # Safety
///
/// `ptr` must be null or a pointer obtained from this allocator that
/// has not been released since.
pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return allocate(size);
  }
  if size == 0 {
    release(ptr);
    return ptr::null_mut();
  }
  let header = block::from_user_ptr(ptr);
  if block::verify_integrity(header) != BlockStatus::Valid {
    error::record(Error::Corruption);
    return ptr::null_mut();
  }
  let current = (*header).size;
  let aligned = match block::align_size(cmp::max(size, MIN_PAYLOAD)) {
    Some(aligned) => aligned,
    None => {
      error::record(Error::InvalidSize);
      return ptr::null_mut();
    }
  };
  if aligned <= current {
    return ptr;
  }

  let fresh = allocate(size);
  if fresh.is_null() {
    return ptr::null_mut();
  }
  // The whole recorded payload moves; that may exceed what the caller
  // originally asked for, but the storage is allocator-owned either way.
  ptr::copy_nonoverlapping(ptr, fresh, current);
  release(ptr);
  fresh
}

/// The header `size` of a valid allocated pointer, zero otherwise.
///
/// # Safety
///
/// `ptr` must be null or a pointer obtained from this allocator that
/// has not been released since.
pub unsafe fn usable_size(ptr: *const u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  let header = block::from_user_ptr(ptr as *mut u8);
  if block::verify_integrity(header) == BlockStatus::Valid && (*header).is_free == 0 {
    (*header).size
  } else {
    0
  }
}

/// Classifies the header behind a user address.
///
/// # Safety
///
/// `ptr` must be null or a user address with [`HEADER_SIZE`] readable
/// bytes below it.
pub unsafe fn verify_block(ptr: *const u8) -> BlockStatus {
  if ptr.is_null() {
    return BlockStatus::OutOfBounds;
  }
  block::verify_integrity(block::from_user_ptr(ptr as *mut u8))
}

/// Returns a snapshot of the allocator state.
pub fn statistics() -> Stats {
  let (break_failures, map_failures, emergency_mode) = os::failure_stats();
  let state = HEAP.lock().expect(LOCK_POISONED);
  Stats {
    total_allocated: state.total_allocated,
    total_free: state.total_free,
    allocation_count: state.allocation_count,
    break_start: state.break_start,
    break_end: state.break_end,
    fragmentation: state.fragmentation(),
    break_failures,
    map_failures,
    emergency_mode,
  }
}

/// Walks the free list and the region registry, checking every
/// invariant that can be audited without touching client-owned memory.
///
/// Allocated blocks belong to their clients (the link words are user
/// data), so the walk covers the free list exhaustively instead:
/// integrity, the free tag, link symmetry, region containment, and the
/// `total_free` sum. Safe to call whenever no mutating operation is in
/// flight.
pub fn verify_heap() -> Result<()> {
  // Region bounds are snapshotted up front so the walk never holds
  // the heap and registry locks together.
  let regions = region::snapshot();
  let result = {
    let state = HEAP.lock().expect(LOCK_POISONED);
    unsafe { walk_free_list(&state, &regions) }
  };
  // Recorded only after the heap lock is gone; the error handler is
  // client code.
  if let Err(error) = result {
    error::record(error);
  }
  result
}

unsafe fn walk_free_list(state: &HeapState, regions: &[Region]) -> Result<()> {
  let mut listed_free = 0usize;
  let mut previous: *mut Header = ptr::null_mut();
  let mut current = state.free.head();
  while !current.is_null() {
    if block::verify_integrity(current) != BlockStatus::Valid {
      return Err(Error::Corruption);
    }
    if (*current).is_free != 1 || (*current).size < MIN_PAYLOAD {
      return Err(Error::Corruption);
    }
    if (*current).prev_free != previous {
      return Err(Error::Corruption);
    }
    let span = HEADER_SIZE + (*current).size;
    let contained = regions
      .iter()
      .any(|region| region.contains_range(current as usize, span));
    if !contained {
      return Err(Error::InvalidPointer);
    }
    listed_free += (*current).size;
    previous = current;
    current = (*current).next_free;
  }
  if listed_free != state.total_free {
    return Err(Error::Corruption);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ThreadCache;
  use crate::test_util;
  use std::ptr::NonNull;

  #[test]
  fn round_trip_restores_counters() {
    let _guard = test_util::lock();
    let before = statistics();
    let ptr = allocate(64);
    assert!(!ptr.is_null());

    let during = statistics();
    assert_eq!(during.allocation_count, before.allocation_count + 1);
    assert!(during.total_allocated >= before.total_allocated + 64);

    unsafe { release(ptr) };
    let after = statistics();
    assert_eq!(after.allocation_count, before.allocation_count);
    assert_eq!(after.total_allocated, before.total_allocated);
    verify_heap().expect("heap inconsistent after round trip");
  }

  #[test]
  fn freed_block_is_reused_first() {
    let _guard = test_util::lock();
    cleanup();
    let first = allocate(64);
    assert!(!first.is_null());
    unsafe { release(first) };
    let second = allocate(64);
    assert_eq!(first, second);
    unsafe { release(second) };
  }

  #[test]
  fn usable_size_reports_the_granted_payload() {
    let _guard = test_util::lock();
    let ptr = allocate(40);
    assert!(!ptr.is_null());
    unsafe {
      let usable = usable_size(ptr);
      assert!(usable >= 40);
      assert_eq!(usable % ALIGNMENT, 0);
      release(ptr);
    }
    assert_eq!(unsafe { usable_size(ptr::null()) }, 0);
  }

  #[test]
  fn aligned_allocation_lands_on_the_boundary() {
    let _guard = test_util::lock();
    for &alignment in &[32usize, 64, 128, 256, 4096] {
      let ptr = allocate_aligned(alignment, 100);
      assert!(!ptr.is_null(), "alignment {} failed", alignment);
      assert_eq!(ptr as usize % alignment, 0);
      unsafe {
        ptr.write_bytes(0xEE, 100);
        release(ptr);
      }
    }
    verify_heap().expect("heap inconsistent after aligned allocations");
  }

  #[test]
  fn aligned_allocation_refuses_bad_alignments() {
    let _guard = test_util::lock();
    assert!(allocate_aligned(0, 64).is_null());
    assert!(allocate_aligned(24, 64).is_null());
    assert!(allocate_aligned(8, 64).is_null());
    assert_eq!(crate::last_error(), Some(Error::InvalidSize));
  }

  #[test]
  fn statistics_snapshot_is_coherent() {
    let _guard = test_util::lock();
    let ptr = allocate(128);
    let stats = statistics();
    assert!(stats.fragmentation >= 0.0 && stats.fragmentation <= 1.0);
    assert!(stats.allocation_count >= 1);
    let rendered = stats.to_string();
    assert!(rendered.contains("Total allocated"));
    unsafe { release(ptr) };
  }

  /// One-slot recycling cache for exercising the cooperation hooks.
  struct OneSlot {
    slot: Option<(NonNull<u8>, usize)>,
  }

  impl ThreadCache for OneSlot {
    fn take(&mut self, size: usize) -> Option<NonNull<u8>> {
      match self.slot {
        Some((ptr, cached)) if cached >= size => {
          self.slot = None;
          Some(ptr)
        }
        _ => None,
      }
    }

    fn put(&mut self, ptr: NonNull<u8>, size: usize) -> bool {
      if self.slot.is_none() && size <= 1024 {
        self.slot = Some((ptr, size));
        true
      } else {
        false
      }
    }
  }

  #[test]
  fn thread_cache_recycles_without_touching_the_heap() {
    let _guard = test_util::lock();
    cache::install(Box::new(OneSlot { slot: None }));

    let first = allocate(64);
    assert!(!first.is_null());
    let counted = statistics().allocation_count;

    // The release parks the block in the cache: it stays allocated.
    unsafe { release(first) };
    assert_eq!(statistics().allocation_count, counted);

    let second = allocate(64);
    assert_eq!(first, second);

    cache::remove();
    unsafe { release(second) };
    assert_eq!(statistics().allocation_count, counted - 1);
    verify_heap().expect("heap inconsistent after cache exercise");
  }
}
