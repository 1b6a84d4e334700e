//! Error types and the process-global last-error cell.

use lazy_static::lazy_static;
use std::error::Error as StdError;
use std::fmt;
use std::process;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

/// The result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Callback invoked with every recorded failure.
pub type ErrorHandler = fn(Error, &str);

/// Message used when an internal mutex has been poisoned by a panic.
pub(crate) const LOCK_POISONED: &str = "allocator mutex poisoned";

/// A classifiable allocator failure.
///
/// The most recent failure is also kept in a process-global cell and
/// can be read back through [`last_error`] immediately after a failing
/// call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
  /// The operating system refused to provide more memory.
  OutOfMemory,
  /// A requested size was zero where forbidden, overflowed, or cannot
  /// be represented.
  InvalidSize,
  /// A pointer was released twice.
  DoubleFree,
  /// Block metadata failed its integrity check.
  Corruption,
  /// A pointer does not carry the required alignment.
  Misaligned,
  /// A pointer does not belong to this allocator.
  InvalidPointer,
}

impl Error {
  /// Stable human-readable phrase for this error.
  pub fn as_str(self) -> &'static str {
    match self {
      Error::OutOfMemory => "Out of memory",
      Error::InvalidSize => "Invalid size",
      Error::DoubleFree => "Double free detected",
      Error::Corruption => "Heap corruption detected",
      Error::Misaligned => "Misaligned pointer",
      Error::InvalidPointer => "Invalid pointer",
    }
  }

  fn code(self) -> u8 {
    match self {
      Error::OutOfMemory => 1,
      Error::InvalidSize => 2,
      Error::DoubleFree => 3,
      Error::Corruption => 4,
      Error::Misaligned => 5,
      Error::InvalidPointer => 6,
    }
  }

  fn from_code(code: u8) -> Option<Error> {
    match code {
      1 => Some(Error::OutOfMemory),
      2 => Some(Error::InvalidSize),
      3 => Some(Error::DoubleFree),
      4 => Some(Error::Corruption),
      5 => Some(Error::Misaligned),
      6 => Some(Error::InvalidPointer),
      _ => None,
    }
  }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl StdError for Error {}

/// Most recent failure; zero means none. Overwritten on each failure,
/// never queued.
static LAST_ERROR: AtomicU8 = AtomicU8::new(0);

lazy_static! {
  static ref HANDLER: Mutex<Option<ErrorHandler>> = Mutex::new(None);
}

/// Returns the most recent classifiable failure, or `None` when no
/// operation has failed since the last [`clear_last_error`].
pub fn last_error() -> Option<Error> {
  Error::from_code(LAST_ERROR.load(Ordering::Relaxed))
}

/// Resets the last-error cell.
pub fn clear_last_error() {
  LAST_ERROR.store(0, Ordering::Relaxed);
}

/// Registers a callback invoked with the error and its message before
/// a failing operation returns or aborts. Passing `None` removes the
/// current handler; the previous one is returned.
pub fn set_error_handler(handler: Option<ErrorHandler>) -> Option<ErrorHandler> {
  let mut slot = HANDLER.lock().expect(LOCK_POISONED);
  std::mem::replace(&mut *slot, handler)
}

fn invoke_handler(error: Error) {
  let handler = match HANDLER.lock() {
    Ok(slot) => *slot,
    Err(_) => None,
  };
  if let Some(handler) = handler {
    handler(error, error.as_str());
  }
}

/// Records a recoverable failure.
pub(crate) fn record(error: Error) {
  LAST_ERROR.store(error.code(), Ordering::Relaxed);
  invoke_handler(error);
}

/// Reports an unrecoverable client bug and terminates the process.
///
/// Once heap metadata is corrupt, or a pointer has been freed twice,
/// subsequent operations cannot be trusted; silent recovery would only
/// mask the bug.
pub(crate) fn fatal(error: Error, diagnostic: fmt::Arguments<'_>) -> ! {
  LAST_ERROR.store(error.code(), Ordering::Relaxed);
  eprintln!("{}", diagnostic);
  invoke_handler(error);
  process::abort();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn display_phrases_are_stable() {
    assert_eq!(Error::OutOfMemory.to_string(), "Out of memory");
    assert_eq!(Error::InvalidSize.to_string(), "Invalid size");
    assert_eq!(Error::DoubleFree.to_string(), "Double free detected");
    assert_eq!(Error::Corruption.to_string(), "Heap corruption detected");
    assert_eq!(Error::Misaligned.to_string(), "Misaligned pointer");
    assert_eq!(Error::InvalidPointer.to_string(), "Invalid pointer");
  }

  #[test]
  fn codes_round_trip() {
    for error in [
      Error::OutOfMemory,
      Error::InvalidSize,
      Error::DoubleFree,
      Error::Corruption,
      Error::Misaligned,
      Error::InvalidPointer,
    ]
    .iter()
    {
      assert_eq!(Error::from_code(error.code()), Some(*error));
    }
    assert_eq!(Error::from_code(0), None);
  }

  #[test]
  fn last_error_overwrites() {
    let _guard = crate::test_util::lock();
    record(Error::OutOfMemory);
    record(Error::DoubleFree);
    assert_eq!(last_error(), Some(Error::DoubleFree));
    clear_last_error();
    assert_eq!(last_error(), None);
  }
}
