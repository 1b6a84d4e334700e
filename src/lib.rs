//! Thread-safe hybrid heap allocator.
//!
//! This crate implements a general-purpose allocator that can stand in
//! for the platform allocation routines. Raw memory is sourced from
//! the operating system along two paths: small requests extend the
//! program break and are carved out of a 64 KiB bump pool, while large
//! (≥ 128 KiB) or fragmentation-pressured requests receive private
//! anonymous mappings of their own. Every chunk is prefixed by a
//! magic-tagged header, released chunks are recycled through an
//! unordered first-fit free list with immediate coalescing of
//! physically adjacent neighbours, and every user address carries
//! 16-byte alignment.
//!
//! # Usage
//!
//! Through the explicit API:
//!
//! ```
//! let ptr = hmalloc::allocate(256);
//! assert!(!ptr.is_null());
//! assert_eq!(ptr as usize % hmalloc::ALIGNMENT, 0);
//! unsafe { hmalloc::release(ptr) };
//! ```
//!
//! Or installed as Rust's global allocator:
//!
//! ```no_run
//! #[global_allocator]
//! static GLOBAL: hmalloc::Hmalloc = hmalloc::Hmalloc;
//! ```
//!
//! # Misuse detection
//!
//! The allocator refuses to paper over client bugs. A double free or a
//! header whose magic sentinel has been overwritten is diagnosed on
//! standard error and terminates the process; once metadata is corrupt
//! no further operation can be trusted. Recoverable failures (OS
//! refusal, overflowing sizes, foreign pointers) set a process-global
//! last-error value readable through [`last_error`] and, optionally,
//! reach a handler registered with [`set_error_handler`].
//!
//! # Threading
//!
//! All operations are safe to call from any number of threads. Three
//! internal mutexes cover the free list and counters, the bump pool,
//! and the region registry; an optional per-thread cache installed
//! through [`cache::install`] recycles blocks without taking any of
//! them.

mod block;
pub mod cache;
mod error;
mod freelist;
mod heap;
mod os;
pub mod page;
mod region;

pub use crate::block::{align_size, BlockStatus, ALIGNMENT, HEADER_SIZE, MAGIC, MIN_PAYLOAD};
pub use crate::cache::ThreadCache;
pub use crate::error::{
  clear_last_error, last_error, set_error_handler, Error, ErrorHandler, Result,
};
pub use crate::heap::{
  allocate, allocate_aligned, allocate_zeroed, cleanup, initialize, reallocate, release,
  statistics, usable_size, verify_block, verify_heap, Stats,
};
pub use crate::os::{release_mapped, Protection, MMAP_THRESHOLD};
pub use crate::region::{is_heap_pointer, Origin, Region};

use std::alloc::{GlobalAlloc, Layout};
use std::cmp;
use std::ptr;

/// Zero-sized handle installing this crate as Rust's global allocator.
///
/// ```no_run
/// #[global_allocator]
/// static GLOBAL: hmalloc::Hmalloc = hmalloc::Hmalloc;
/// ```
///
/// Layouts aligned up to 16 bytes map directly onto [`allocate`];
/// larger alignments go through [`allocate_aligned`].
pub struct Hmalloc;

unsafe impl GlobalAlloc for Hmalloc {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      allocate(layout.size())
    } else {
      allocate_aligned(layout.align(), layout.size())
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    release(ptr);
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      allocate_zeroed(layout.size(), 1)
    } else {
      let fresh = allocate_aligned(layout.align(), layout.size());
      if !fresh.is_null() {
        fresh.write_bytes(0, layout.size());
      }
      fresh
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      return reallocate(ptr, new_size);
    }
    // The caller's alignment has to survive the move, so the default
    // grow-in-place shortcut cannot be reused here.
    let fresh = self.alloc(Layout::from_size_align_unchecked(new_size, layout.align()));
    if !fresh.is_null() && !ptr.is_null() {
      ptr::copy_nonoverlapping(ptr, fresh, cmp::min(layout.size(), new_size));
      release(ptr);
    }
    fresh
  }
}

#[cfg(test)]
pub(crate) mod test_util {
  use lazy_static::lazy_static;
  use std::sync::{Mutex, MutexGuard};

  lazy_static! {
    static ref LOCK: Mutex<()> = Mutex::new(());
  }

  /// Serializes tests that touch the process-global allocator state.
  pub fn lock() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_util;

  #[test]
  fn global_alloc_respects_layout_alignment() {
    let _guard = test_util::lock();
    let handle = Hmalloc;
    unsafe {
      for &align in &[1usize, 8, 16, 32, 64] {
        let layout = Layout::from_size_align(48, align).unwrap();
        let ptr = handle.alloc(layout);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % align, 0);
        handle.dealloc(ptr, layout);
      }
    }
  }

  #[test]
  fn global_alloc_zeroed_is_zero() {
    let _guard = test_util::lock();
    let handle = Hmalloc;
    unsafe {
      let layout = Layout::from_size_align(96, 32).unwrap();
      let ptr = handle.alloc_zeroed(layout);
      assert!(!ptr.is_null());
      assert!(std::slice::from_raw_parts(ptr, 96).iter().all(|&b| b == 0));
      handle.dealloc(ptr, layout);
    }
  }

  #[test]
  fn global_realloc_preserves_contents() {
    let _guard = test_util::lock();
    let handle = Hmalloc;
    unsafe {
      let layout = Layout::from_size_align(64, 32).unwrap();
      let ptr = handle.alloc(layout);
      assert!(!ptr.is_null());
      ptr.write_bytes(0x5A, 64);

      let grown = handle.realloc(ptr, layout, 256);
      assert!(!grown.is_null());
      assert_eq!(grown as usize % 32, 0);
      assert!(std::slice::from_raw_parts(grown, 64).iter().all(|&b| b == 0x5A));
      handle.dealloc(grown, Layout::from_size_align(256, 32).unwrap());
    }
  }
}
