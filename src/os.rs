//! OS primitive adapter.
//!
//! Everything this allocator knows about the operating system is confined to
//! four operations: read/extend the program break, map and unmap an
//! anonymous region, and query the page size. Every other module treats
//! memory as if it always comes from here.

use std::ptr;
use std::sync::OnceLock;

use libc::{c_void, intptr_t};

/// The OS refused the request (break extension or mapping). Recoverable —
/// callers turn this into a `None` return.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OomError;

/// Extends the program break by exactly `delta` bytes and returns the break
/// address *before* the extension — i.e. the start of the newly acquired
/// region.
pub(crate) fn extend_break(delta: usize) -> Result<*mut u8, OomError> {
  unsafe {
    let previous = libc::sbrk(delta as intptr_t);
    if previous == usize::MAX as *mut c_void {
      return Err(OomError);
    }
    Ok(previous as *mut u8)
  }
}

/// Maps a zero-initialised, page-aligned anonymous region of `len` bytes.
pub(crate) fn map(len: usize) -> Result<*mut u8, OomError> {
  unsafe {
    let addr = libc::mmap(
      ptr::null_mut(),
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    );
    if addr == libc::MAP_FAILED {
      return Err(OomError);
    }
    Ok(addr as *mut u8)
  }
}

/// Releases a region previously obtained from [`map`]. `len` must match the
/// original mapping exactly — a mismatch indicates registry corruption, so a
/// failure here is fatal rather than recoverable.
pub(crate) fn unmap(addr: *mut u8, len: usize) {
  let result = unsafe { libc::munmap(addr as *mut c_void, len) };
  if result != 0 {
    fatal("munmap failed releasing a mapped block");
  }
}

/// OS page size, queried once and cached for the life of the process.
pub(crate) fn page_size() -> usize {
  static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
  *PAGE_SIZE.get_or_init(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
  })
}

/// Aborts the process. Reserved for the handful of failures the spec treats
/// as non-recoverable: a failed `unmap`, or a failed break extension during
/// heap preallocation.
pub(crate) fn fatal(message: &str) -> ! {
  log::error!("{message}, aborting");
  std::process::abort();
}
