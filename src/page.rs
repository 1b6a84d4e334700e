//! Page size queries and rounding.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Fallback when the page size cannot be queried at runtime.
const DEFAULT_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the operating system's page size.
///
/// The value is queried once through `sysconf` and cached.
#[inline]
pub fn size() -> usize {
  match PAGE_SIZE.load(Ordering::Relaxed) {
    0 => {
      let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
      let size = if queried > 0 {
        queried as usize
      } else {
        DEFAULT_PAGE_SIZE
      };
      PAGE_SIZE.store(size, Ordering::Relaxed);
      size
    }
    cached => cached,
  }
}

/// Rounds `length` up to the closest page boundary.
#[inline]
pub fn ceil(length: usize) -> usize {
  let page = size();
  match length % page {
    0 => length,
    remainder => length - remainder + page,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn size_is_a_power_of_two() {
    let size = size();
    assert!(size > 0);
    assert_eq!(size & (size - 1), 0);
  }

  #[test]
  fn ceil_rounds_up() {
    let page = size();
    assert_eq!(ceil(0), 0);
    assert_eq!(ceil(1), page);
    assert_eq!(ceil(page), page);
    assert_eq!(ceil(page + 1), 2 * page);
  }
}
