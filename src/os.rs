//! OS memory sourcing.
//!
//! Two acquisition strategies feed the allocator: extending the
//! program break, served through a bump pool so that a single kernel
//! call covers the next few requests, and private anonymous mappings
//! for large or fragmentation-pressured requests. Only mapped spans
//! can ever be handed back to the kernel.

use lazy_static::lazy_static;
use std::cmp;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::block;
use crate::error::{self, Error, LOCK_POISONED};
use crate::page;
use crate::region::{self, Origin, NODE_SIZE};

bitflags::bitflags! {
  /// Access protection applied to anonymous mappings.
  pub struct Protection: libc::c_int {
    const NONE = libc::PROT_NONE;
    const READ = libc::PROT_READ;
    const WRITE = libc::PROT_WRITE;
    const READ_WRITE = Self::READ.bits | Self::WRITE.bits;
  }
}

/// Requests at or above this size go straight to the mapping path.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

/// Smallest program-break extension requested from the kernel.
const EXTENSION_MIN: usize = 64 * 1024;

/// Free-space share beyond which small requests are mapped instead of
/// extending the break.
pub(crate) const FRAGMENTATION_LIMIT: f64 = 0.30;

/// Combined sourcing failures tolerated before emergency mode.
const FAILURE_LIMIT: u32 = 10;

/// One span of raw memory handed to the front-end: the usable bytes
/// past the registry node, plus the bounds of the region they live in.
pub(crate) struct Span {
  pub base: *mut u8,
  pub len: usize,
  pub origin: Origin,
  pub region_base: usize,
  pub region_len: usize,
}

/// Bump cursor into the most recent break extension.
struct Pool {
  cursor: *mut u8,
  remaining: usize,
}

// The cursor is only dereferenced by the thread holding the pool lock.
unsafe impl Send for Pool {}

lazy_static! {
  static ref POOL: Mutex<Pool> = Mutex::new(Pool {
    cursor: ptr::null_mut(),
    remaining: 0,
  });
}

static BREAK_FAILURES: AtomicU32 = AtomicU32::new(0);
static MAP_FAILURES: AtomicU32 = AtomicU32::new(0);
static EMERGENCY: AtomicBool = AtomicBool::new(false);

/// Whether this target supports extending the program break.
#[inline]
pub(crate) const fn has_program_break() -> bool {
  cfg!(not(target_os = "macos"))
}

/// Current program break, or zero where the break is not usable.
pub(crate) fn current_break() -> usize {
  #[cfg(not(target_os = "macos"))]
  {
    let raw = unsafe { libc::sbrk(0) };
    if raw as usize == usize::MAX {
      0
    } else {
      raw as usize
    }
  }
  #[cfg(target_os = "macos")]
  {
    0
  }
}

/// `(break_failures, map_failures, emergency_mode)` so far.
pub(crate) fn failure_stats() -> (u32, u32, bool) {
  (
    BREAK_FAILURES.load(Ordering::Relaxed),
    MAP_FAILURES.load(Ordering::Relaxed),
    EMERGENCY.load(Ordering::Relaxed),
  )
}

/// Forgets the pool and the failure history. Break memory already
/// obtained stays with the process.
pub(crate) fn reset() {
  let mut pool = POOL.lock().expect(LOCK_POISONED);
  pool.cursor = ptr::null_mut();
  pool.remaining = 0;
  BREAK_FAILURES.store(0, Ordering::Relaxed);
  MAP_FAILURES.store(0, Ordering::Relaxed);
  EMERGENCY.store(false, Ordering::Relaxed);
}

fn note_failure(counter: &AtomicU32) {
  counter.fetch_add(1, Ordering::Relaxed);
  let combined =
    BREAK_FAILURES.load(Ordering::Relaxed) + MAP_FAILURES.load(Ordering::Relaxed);
  if combined > FAILURE_LIMIT && !EMERGENCY.swap(true, Ordering::Relaxed) {
    // Reserved: no cleanup strategy is wired up yet.
    log::warn!(
      "memory sourcing entered emergency mode after {} failures",
      combined
    );
  }
}

/// Acquires at least `size` usable bytes from the operating system.
///
/// Large requests and requests arriving while the heap is fragmented
/// are mapped; everything else extends the program break. `fragmented`
/// is the front-end's verdict on the current free-space share.
pub(crate) fn acquire(size: usize, fragmented: bool) -> Option<Span> {
  if size == 0 {
    error::record(Error::InvalidSize);
    return None;
  }
  let aligned = match block::align_size(size) {
    Some(aligned) => aligned,
    None => {
      error::record(Error::InvalidSize);
      return None;
    }
  };
  if !has_program_break() || aligned >= MMAP_THRESHOLD || fragmented {
    return acquire_mapped(aligned);
  }
  acquire_break(aligned)
}

/// Serves `aligned` bytes from the bump pool, extending the program
/// break when the pool runs dry.
///
/// The pool lock is released before any other component is entered;
/// at most one allocator lock is held at any instant.
fn acquire_break(aligned: usize) -> Option<Span> {
  {
    let mut pool = POOL.lock().expect(LOCK_POISONED);
    if !pool.cursor.is_null() && pool.remaining >= aligned {
      let base = pool.cursor;
      pool.cursor = unsafe { pool.cursor.add(aligned) };
      pool.remaining -= aligned;
      return Some(Span {
        base,
        len: aligned,
        origin: Origin::ProgramBreak,
        region_base: base as usize,
        region_len: aligned,
      });
    }
  }

  // Pool exhausted. Extend the break with no lock held; concurrent
  // extenders each obtain a distinct span from the kernel. The fresh
  // span starts with its registry node, so ask for that much more.
  let extension = cmp::max(aligned + NODE_SIZE, EXTENSION_MIN);
  let raw = match extend_break(extension) {
    Some(raw) => raw,
    None => {
      error::record(Error::OutOfMemory);
      note_failure(&BREAK_FAILURES);
      return None;
    }
  };

  // Registered before the span can escape through the pool or the
  // returned pointer, so a block carved here is classifiable the
  // moment another thread sees its address.
  unsafe { region::register(raw, extension, Origin::ProgramBreak) };

  // Install the remainder as the new pool. If another thread extended
  // concurrently, the later install wins and the loser's tail is
  // stranded inside its registered region.
  let usable = unsafe { raw.add(NODE_SIZE) };
  let mut pool = POOL.lock().expect(LOCK_POISONED);
  pool.cursor = unsafe { usable.add(aligned) };
  pool.remaining = extension - NODE_SIZE - aligned;
  Some(Span {
    base: usable,
    len: aligned,
    origin: Origin::ProgramBreak,
    region_base: raw as usize,
    region_len: extension,
  })
}

#[cfg(not(target_os = "macos"))]
fn extend_break(len: usize) -> Option<*mut u8> {
  let raw = unsafe { libc::sbrk(len as libc::intptr_t) };
  if raw as usize == usize::MAX {
    None
  } else {
    Some(raw as *mut u8)
  }
}

#[cfg(target_os = "macos")]
fn extend_break(_len: usize) -> Option<*mut u8> {
  None
}

/// Maps a fresh anonymous region of at least `aligned + NODE_SIZE`
/// bytes, rounded up to the page size, and hands back everything past
/// the registry node.
fn acquire_mapped(aligned: usize) -> Option<Span> {
  let wanted = match aligned.checked_add(NODE_SIZE) {
    Some(total) if total <= usize::MAX - page::size() => page::ceil(total),
    _ => {
      error::record(Error::InvalidSize);
      note_failure(&MAP_FAILURES);
      return None;
    }
  };
  let base = map_anonymous(wanted, Protection::READ_WRITE)?;
  unsafe { region::register(base, wanted, Origin::Mapped) };
  Some(Span {
    base: unsafe { base.add(NODE_SIZE) },
    len: wanted - NODE_SIZE,
    origin: Origin::Mapped,
    region_base: base as usize,
    region_len: wanted,
  })
}

/// Creates a private anonymous mapping of `len` bytes.
fn map_anonymous(len: usize, protection: Protection) -> Option<*mut u8> {
  let base = unsafe {
    libc::mmap(
      ptr::null_mut(),
      len,
      protection.bits(),
      libc::MAP_PRIVATE | libc::MAP_ANON,
      -1,
      0,
    )
  };
  if base == libc::MAP_FAILED {
    let error = match io::Error::last_os_error().raw_os_error() {
      Some(libc::EINVAL) => Error::InvalidSize,
      _ => Error::OutOfMemory,
    };
    error::record(error);
    note_failure(&MAP_FAILURES);
    return None;
  }
  Some(base as *mut u8)
}

/// Returns a mapped region to the operating system.
///
/// Refuses with [`Error::InvalidPointer`] when `ptr` lies in no
/// registered region or in one obtained by break extension; break
/// memory is never returnable.
///
/// # Safety
///
/// No block inside the region may be reachable afterwards: the caller
/// must own every allocation in it, and none of its blocks may sit on
/// the free list.
pub unsafe fn release_mapped(ptr: *mut u8) -> crate::Result<()> {
  let found = match region::find(ptr as usize) {
    Some(found) if found.origin() == Origin::Mapped => found,
    _ => {
      error::record(Error::InvalidPointer);
      return Err(Error::InvalidPointer);
    }
  };
  // The registry node lives inside the span, so it has to be spliced
  // out while the memory is still mapped.
  region::unregister(found.base());
  if libc::munmap(found.base() as *mut libc::c_void, found.len()) != 0 {
    error::record(Error::InvalidPointer);
    return Err(Error::InvalidPointer);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_util;

  #[test]
  fn protection_maps_to_native_bits() {
    assert_eq!(Protection::READ.bits(), libc::PROT_READ);
    assert_eq!(
      Protection::READ_WRITE.bits(),
      libc::PROT_READ | libc::PROT_WRITE
    );
  }

  #[test]
  fn mapped_round_trip() {
    let _guard = test_util::lock();
    let span = acquire_mapped(4096).expect("anonymous mapping failed");
    assert_eq!(span.origin, Origin::Mapped);
    assert!(span.len >= 4096);
    assert_eq!(span.region_len % page::size(), 0);
    assert!(region::find(span.base as usize).is_some());

    // The span is writable end to end.
    unsafe {
      span.base.write_bytes(0xA5, span.len);
      assert_eq!(*span.base, 0xA5);
      assert_eq!(*span.base.add(span.len - 1), 0xA5);
    }

    unsafe { release_mapped(span.base).expect("release of mapped span failed") };
    assert!(region::find(span.region_base).is_none());
  }

  #[test]
  fn release_refuses_foreign_pointers() {
    let _guard = test_util::lock();
    let local = 0u64;
    let result = unsafe { release_mapped(&local as *const u64 as *mut u8) };
    assert_eq!(result, Err(Error::InvalidPointer));
  }

  #[test]
  fn selection_prefers_mapping_for_large_requests() {
    let _guard = test_util::lock();
    let span = acquire(MMAP_THRESHOLD, false).expect("large acquisition failed");
    assert_eq!(span.origin, Origin::Mapped);
    unsafe { release_mapped(span.base).expect("release of mapped span failed") };
  }
}
