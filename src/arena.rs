//! Heap arena manager: preallocation, best-fit search, split, coalesce and
//! tail expansion over the heap-backed portion of the registry.
//!
//! ```text
//!   first heap request
//!          │
//!          ▼
//!     preallocate()            one FREE block, size = HEAP_THRESHOLD - H
//!          │
//!          ▼
//!     every later heap request
//!          │
//!          ▼
//!     allocate()
//!       1. coalesce_sweep    — fold adjacent FREE blocks (deferred from free())
//!       2. select_best_fit   — smallest FREE block that still fits
//!       3. place / fallback  — split, expand the tail, or grow the break
//! ```

use std::ptr;

use crate::align::WORD;
use crate::block::{self, BlockHeader, Status, HEADER_SIZE};
use crate::os;
use crate::registry::Registry;

/// Boundary between heap-backed and mapping-backed requests: 128 KiB. Chosen
/// to amortise `sbrk` calls for the overwhelming majority of allocations
/// while keeping single large requests off the heap entirely.
pub(crate) const HEAP_THRESHOLD: usize = 128 * 1024;

/// Tracks whether the heap has been preallocated yet, and where it started
/// (used only to state the byte-accounting invariant in tests — no
/// allocation decision depends on it).
pub(crate) struct HeapArena {
  initialised: bool,
  initial_break: usize,
}

impl HeapArena {
  pub(crate) fn new() -> Self {
    Self { initialised: false, initial_break: 0 }
  }

  pub(crate) fn is_initialised(&self) -> bool {
    self.initialised
  }

  pub(crate) fn initial_break(&self) -> usize {
    self.initial_break
  }

  /// Grabs one `HEAP_THRESHOLD`-byte region from the OS and records it as a
  /// single free block. Run exactly once, on the first heap-class request.
  ///
  /// A failed break extension here is fatal: there is no fallback for an
  /// allocator that can't even start.
  ///
  /// # Safety
  /// Must only be called while `!self.is_initialised()`.
  pub(crate) unsafe fn preallocate(&mut self, registry: &mut Registry) -> *mut BlockHeader {
    unsafe {
      let prev_break =
        os::extend_break(HEAP_THRESHOLD).unwrap_or_else(|_| os::fatal("sbrk failed during heap preallocation"));
      self.initial_break = prev_break as usize;

      let block = prev_break as *mut BlockHeader;
      (*block).size = HEAP_THRESHOLD - HEADER_SIZE;
      (*block).status = Status::Free;
      (*block).next = ptr::null_mut();

      registry.append_tail(block);
      self.initialised = true;
      block
    }
  }

  /// The three-phase best-fit procedure: coalesce, select, then place or
  /// fall back to expanding the break.
  ///
  /// # Safety
  /// `self.is_initialised()` must hold, and `registry` must be the same one
  /// `preallocate` was called with.
  pub(crate) unsafe fn allocate(&mut self, registry: &mut Registry, requested: usize) -> Option<*mut u8> {
    unsafe {
      Self::coalesce_sweep(registry);

      if let Some(best) = Self::select_best_fit(registry, requested) {
        Self::place(best, requested);
        return Some(block::payload_of(best));
      }

      if let Some(last_free) = Self::expandable_tail(registry) {
        let deficit = requested - (*last_free).size;
        os::extend_break(deficit).ok()?;
        (*last_free).size = requested;
        (*last_free).status = Status::Alloc;
        return Some(block::payload_of(last_free));
      }

      let prev_break = os::extend_break(requested + HEADER_SIZE).ok()?;
      let block = prev_break as *mut BlockHeader;
      (*block).size = requested;
      (*block).status = Status::Alloc;
      (*block).next = ptr::null_mut();
      registry.append_tail(block);
      Some(block::payload_of(block))
    }
  }

  /// Single left-to-right pass folding adjacent FREE blocks into their
  /// predecessor. Runs on allocation rather than on free, so `free` stays
  /// O(1) and list maintenance is batched where a scan is already needed.
  unsafe fn coalesce_sweep(registry: &mut Registry) {
    unsafe {
      let mut prev: *mut BlockHeader = ptr::null_mut();
      let mut curr = registry.head();

      while !curr.is_null() {
        if !prev.is_null() && (*prev).status == Status::Free && (*curr).status == Status::Free {
          (*prev).size += HEADER_SIZE + (*curr).size;
          (*prev).next = (*curr).next;
          curr = (*curr).next;
        } else {
          prev = curr;
          curr = (*curr).next;
        }
      }
    }
  }

  /// Smallest FREE block whose size is at least `requested`. Ties go to the
  /// first one encountered, i.e. the lowest address.
  unsafe fn select_best_fit(registry: &Registry, requested: usize) -> Option<*mut BlockHeader> {
    unsafe {
      let mut best: Option<*mut BlockHeader> = None;
      let mut best_size = usize::MAX;

      for block in registry.iter() {
        if (*block).status == Status::Free && (*block).size >= requested && (*block).size < best_size {
          best = Some(block);
          best_size = (*block).size;
        }
      }
      best
    }
  }

  /// The last FREE block in the registry, if it is logically the heap's
  /// tail — either the registry's tail outright, or followed only by a
  /// MAPPED block (mapped blocks aren't physically adjacent on the heap, so
  /// they don't block expansion).
  unsafe fn expandable_tail(registry: &Registry) -> Option<*mut BlockHeader> {
    unsafe {
      let mut last_free: Option<*mut BlockHeader> = None;
      for block in registry.iter() {
        if (*block).status == Status::Free {
          last_free = Some(block);
        }
      }

      let last_free = last_free?;
      let next = (*last_free).next;
      if next.is_null() || (*next).status == Status::Mapped { Some(last_free) } else { None }
    }
  }

  /// Truncates `block` to `requested` and marks it allocated, splitting off
  /// a residual FREE block first if there's room for one.
  ///
  /// # Safety
  /// `block` must be a live, FREE, heap-backed block with `size >= requested`.
  pub(crate) unsafe fn place(block: *mut BlockHeader, requested: usize) {
    unsafe {
      Self::split(block, requested);
      (*block).status = Status::Alloc;
    }
  }

  /// Splits off a residual FREE block after `requested` bytes of payload,
  /// provided the residual can itself hold a header plus one aligned byte
  /// (`size >= requested + H + W`). Otherwise `block` is left untouched
  /// apart from this precondition check — no payload-less sentinel blocks
  /// are ever created.
  ///
  /// # Safety
  /// `block` must be live with `size >= requested`.
  pub(crate) unsafe fn split(block: *mut BlockHeader, requested: usize) {
    unsafe {
      let size = (*block).size;
      if size >= requested + HEADER_SIZE + WORD {
        let residual = (block as *mut u8).add(HEADER_SIZE + requested) as *mut BlockHeader;
        (*residual).size = size - requested - HEADER_SIZE;
        (*residual).status = Status::Free;
        (*residual).next = (*block).next;
        (*block).next = residual;
        (*block).size = requested;
      }
    }
  }

  /// Grows `block` in place to `new_size` by extending the break. Only
  /// valid when `block` is the heap's tail.
  ///
  /// # Safety
  /// `block` must be live and heap-backed, and must be the registry's
  /// effective heap tail (no live block after it on the heap).
  pub(crate) unsafe fn expand_in_place(block: *mut BlockHeader, new_size: usize) -> Option<()> {
    unsafe {
      let delta = new_size - (*block).size;
      os::extend_break(delta).ok()?;
      (*block).size = new_size;
      Some(())
    }
  }
}
