//! Per-thread fast-path cache interface.
//!
//! The core defines only the contract and the hook points; size
//! classes and eviction policy belong to whichever cache an embedder
//! installs. A block handed to a cache stays *allocated*: it keeps its
//! header and its statistics entry, and it never touches the shared
//! free list, so a cache hit costs no lock at all.

use std::cell::RefCell;
use std::ptr::NonNull;

/// Recycling policy consulted by the allocation front-end.
pub trait ThreadCache {
  /// Offers a previously released user address whose payload is at
  /// least `size` bytes. Returning `None` sends the request to the
  /// shared free list.
  fn take(&mut self, size: usize) -> Option<NonNull<u8>>;

  /// Offers a block being released, `size` bytes of payload behind
  /// `ptr`. Returning `true` keeps the block; a refused block goes
  /// through the normal release path.
  fn put(&mut self, ptr: NonNull<u8>, size: usize) -> bool;
}

thread_local! {
  static CACHE: RefCell<Option<Box<dyn ThreadCache>>> = RefCell::new(None);
}

/// Installs `cache` for the calling thread, returning the previous
/// one. Cached blocks survive the swap; the old cache's owner is
/// responsible for draining it.
pub fn install(cache: Box<dyn ThreadCache>) -> Option<Box<dyn ThreadCache>> {
  CACHE.with(|slot| slot.borrow_mut().replace(cache))
}

/// Removes the calling thread's cache, if any.
pub fn remove() -> Option<Box<dyn ThreadCache>> {
  CACHE.with(|slot| slot.borrow_mut().take())
}

pub(crate) fn take(size: usize) -> Option<NonNull<u8>> {
  CACHE
    .try_with(|slot| {
      let mut slot = slot.try_borrow_mut().ok()?;
      slot.as_mut()?.take(size)
    })
    .ok()
    .flatten()
}

pub(crate) fn put(ptr: *mut u8, size: usize) -> bool {
  let ptr = match NonNull::new(ptr) {
    Some(ptr) => ptr,
    None => return false,
  };
  CACHE
    .try_with(|slot| match slot.try_borrow_mut() {
      Ok(mut slot) => slot.as_mut().map_or(false, |cache| cache.put(ptr, size)),
      Err(_) => false,
    })
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Sticky {
    held: Vec<(NonNull<u8>, usize)>,
    limit: usize,
  }

  impl ThreadCache for Sticky {
    fn take(&mut self, size: usize) -> Option<NonNull<u8>> {
      let position = self.held.iter().position(|&(_, held)| held >= size)?;
      Some(self.held.swap_remove(position).0)
    }

    fn put(&mut self, ptr: NonNull<u8>, size: usize) -> bool {
      if self.held.len() < self.limit {
        self.held.push((ptr, size));
        true
      } else {
        false
      }
    }
  }

  #[test]
  fn hooks_are_inert_without_a_cache() {
    remove();
    assert!(take(64).is_none());
    assert!(!put(16 as *mut u8, 64));
  }

  #[test]
  fn installed_cache_sees_the_traffic() {
    install(Box::new(Sticky {
      held: Vec::new(),
      limit: 1,
    }));

    let fake = 0x40 as *mut u8;
    assert!(put(fake, 128));
    // Full; a second offer is refused.
    assert!(!put(0x80 as *mut u8, 64));
    // Too big to satisfy; stays cached.
    assert!(take(256).is_none());
    assert_eq!(take(64), NonNull::new(fake));

    remove();
  }

  #[test]
  fn null_is_never_offered() {
    assert!(!put(std::ptr::null_mut(), 64));
  }
}
