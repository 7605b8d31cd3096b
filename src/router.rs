//! Allocation router: the public entry points. Chooses a backing primitive
//! based on request size and dispatches to the heap arena or the mapping
//! path; also implements `resize`'s in-place / coalescing / relocate
//! decision tree.
//!
//! ```text
//!               size + H < threshold?
//!                    │         │
//!                   yes        no
//!                    │         │
//!                    ▼         ▼
//!             heap arena    new mapping
//! ```
//!
//! `threshold` is [`HEAP_THRESHOLD`] for `alloc`, and the OS page size for
//! `zeroed_alloc` — the only place that distinction shows up.

use std::cmp;
use std::ptr;

use crate::align::align_up;
use crate::arena::{HeapArena, HEAP_THRESHOLD};
use crate::block::{self, BlockHeader, Status, HEADER_SIZE};
use crate::os;
use crate::registry::Registry;

/// A general-purpose heap allocator. Owns every block it has ever handed
/// out — callers hold non-owning references into its address space.
///
/// Not thread-safe: the contract requires the caller to serialise access
/// (e.g. behind a `Mutex<Allocator>`) if it's shared across threads.
pub struct Allocator {
  registry: Registry,
  arena: HeapArena,
}

impl Default for Allocator {
  fn default() -> Self {
    Self::new()
  }
}

impl Allocator {
  pub fn new() -> Self {
    Self { registry: Registry::new(), arena: HeapArena::new() }
  }

  /// Allocates at least `size` bytes. Returns `None` on a non-positive size
  /// or OS-reported out-of-memory.
  pub fn alloc(&mut self, size: usize) -> Option<*mut u8> {
    if size == 0 {
      return None;
    }
    unsafe { self.route(size, HEAP_THRESHOLD) }
  }

  /// Allocates `count * size` zero-initialised bytes. Routes through the OS
  /// page size rather than [`HEAP_THRESHOLD`] — large calloc requests are
  /// common enough, and cheap enough to zero via a fresh mapping, that the
  /// source uses a tighter boundary here than for `alloc`.
  pub fn zeroed_alloc(&mut self, count: usize, size: usize) -> Option<*mut u8> {
    if count == 0 || size == 0 {
      return None;
    }

    let total = count.checked_mul(size)?;
    if total / count != size {
      return None;
    }

    let payload = unsafe { self.route(total, os::page_size())? };
    unsafe { ptr::write_bytes(payload, 0, total) };
    Some(payload)
  }

  /// Routes a raw, unaligned request size against `threshold`. The
  /// comparison uses `size` itself, not its word-aligned footprint — the
  /// source compares the caller's raw size plus header overhead, and
  /// aligning first would push some sizes just under the threshold across
  /// it. Alignment only matters once a backing primitive has been chosen,
  /// for placement and footprint accounting.
  unsafe fn route(&mut self, size: usize, threshold: usize) -> Option<*mut u8> {
    unsafe {
      let requested = align_up(size);

      if !self.arena.is_initialised() {
        return if size + HEADER_SIZE < threshold {
          let block = self.arena.preallocate(&mut self.registry);
          HeapArena::place(block, requested);
          Some(block::payload_of(block))
        } else {
          self.new_mapping(requested)
        };
      }

      if size + HEADER_SIZE >= threshold {
        self.new_mapping(requested)
      } else {
        self.arena.allocate(&mut self.registry, requested)
      }
    }
  }

  unsafe fn new_mapping(&mut self, requested: usize) -> Option<*mut u8> {
    unsafe {
      let footprint = requested + HEADER_SIZE;
      let addr = os::map(footprint).ok()?;

      let block = addr as *mut BlockHeader;
      (*block).size = requested;
      (*block).status = Status::Mapped;
      (*block).next = ptr::null_mut();

      self.registry.append_tail(block);
      Some(block::payload_of(block))
    }
  }

  /// Releases a pointer previously returned by this allocator. A no-op on
  /// `None`. Freeing an already-free block is undefined behaviour, per the
  /// contract this mirrors — not detected here.
  pub fn free(&mut self, ptr: Option<*mut u8>) {
    let Some(ptr) = ptr else { return };

    unsafe {
      let header = block::header_of(ptr);
      match (*header).status {
        Status::Mapped => {
          self.registry.delink(header);
          os::unmap(header as *mut u8, (*header).size + HEADER_SIZE);
        }
        Status::Alloc => {
          // Merging is deferred to the next allocation's coalesce sweep.
          (*header).status = Status::Free;
        }
        Status::Free => {}
      }
    }
  }

  /// Resizes the allocation at `ptr` to `new_size` bytes, preserving
  /// `min(old_size, new_size)` bytes of payload. `ptr = None` behaves like
  /// `alloc`; `new_size = 0` behaves like `free`.
  pub fn resize(&mut self, ptr: Option<*mut u8>, new_size: usize) -> Option<*mut u8> {
    let Some(ptr) = ptr else { return self.alloc(new_size) };

    if new_size == 0 {
      self.free(Some(ptr));
      return None;
    }

    unsafe {
      let header = block::header_of(ptr);
      match (*header).status {
        Status::Free => None,
        Status::Mapped => self.relocate(ptr, (*header).size, new_size),
        Status::Alloc => self.resize_alloc(header, ptr, new_size),
      }
    }
  }

  unsafe fn resize_alloc(&mut self, header: *mut BlockHeader, ptr: *mut u8, new_size: usize) -> Option<*mut u8> {
    unsafe {
      let requested = align_up(new_size);
      let old_size = (*header).size;

      if old_size >= requested {
        HeapArena::split(header, requested);
        return Some(ptr);
      }

      if new_size >= HEAP_THRESHOLD {
        return self.relocate(ptr, old_size, new_size);
      }

      let next = (*header).next;
      if next.is_null() || (*next).status == Status::Mapped {
        return match HeapArena::expand_in_place(header, requested) {
          Some(()) => Some(ptr),
          None => None,
        };
      }

      let mut succ = next;
      while !succ.is_null() && (*succ).status == Status::Free {
        let succ_next = (*succ).next;
        (*header).size += HEADER_SIZE + (*succ).size;
        (*header).next = succ_next;
        succ = succ_next;

        if (*header).size >= requested {
          HeapArena::split(header, requested);
          return Some(ptr);
        }
      }

      self.relocate(ptr, old_size, new_size)
    }
  }

  unsafe fn relocate(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> Option<*mut u8> {
    unsafe {
      let new_ptr = self.alloc(new_size)?;
      let copy_len = cmp::min(old_size, new_size);
      ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
      self.free(Some(ptr));
      Some(new_ptr)
    }
  }
}

#[cfg(test)]
impl Allocator {
  /// `(size, status)` for every registered block, in registry order.
  /// Test-only window into otherwise-private state.
  fn blocks(&self) -> Vec<(usize, Status)> {
    unsafe { self.registry.iter().map(|b| ((*b).size, (*b).status)).collect() }
  }

  fn current_break(&self) -> usize {
    unsafe { libc::sbrk(0) as usize }
  }

  fn initial_break(&self) -> usize {
    self.arena.initial_break()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Mutex, MutexGuard, OnceLock};

  // `sbrk` mutates real, process-wide state, and cargo runs tests on multiple
  // threads by default. Every test that touches the heap path must hold this
  // for its duration.
  fn serial() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|poison| poison.into_inner())
  }

  fn no_adjacent_free_heap_blocks(blocks: &[(usize, Status)]) -> bool {
    blocks.windows(2).all(|w| !(w[0].1 == Status::Free && w[1].1 == Status::Free))
  }

  #[test]
  fn alloc_zero_returns_none() {
    let _guard = serial();
    let mut allocator = Allocator::new();
    assert!(allocator.alloc(0).is_none());
  }

  #[test]
  fn preallocation_and_split() {
    let _guard = serial();
    let mut allocator = Allocator::new();

    let p1 = allocator.alloc(100).unwrap();
    let blocks = allocator.blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0], (align_up(100), Status::Alloc));
    assert_eq!(blocks[1].1, Status::Free);
    assert_eq!(blocks[0].0 + blocks[1].0 + 2 * HEADER_SIZE, HEAP_THRESHOLD);

    allocator.free(Some(p1));
    let p2 = allocator.alloc(200).unwrap();
    // Coalescing the freed first block with the preallocated residual
    // produces a single free block big enough to satisfy 200 via split.
    assert_eq!(p2, p1);
  }

  #[test]
  fn best_fit_picks_smallest_adequate_freed_block() {
    let _guard = serial();
    let mut allocator = Allocator::new();

    let a = allocator.alloc(64).unwrap();
    let _b = allocator.alloc(128).unwrap();
    let _c = allocator.alloc(64).unwrap();
    allocator.free(Some(_b));
    allocator.free(Some(a));

    let reused = allocator.alloc(64).unwrap();
    assert_eq!(reused, a);
    assert!(no_adjacent_free_heap_blocks(&allocator.blocks()));
  }

  #[test]
  fn tail_expansion_advances_break_by_exact_deficit() {
    let _guard = serial();
    let mut allocator = Allocator::new();

    // First split leaves a FREE tail block smaller than the next request.
    allocator.alloc(100).unwrap();
    let tail_size_before = allocator.blocks()[1].0;
    assert_eq!(allocator.blocks()[1].1, Status::Free);

    let break_before = allocator.current_break();
    let request_size = tail_size_before + 500;
    let requested_aligned = align_up(request_size);
    let deficit = requested_aligned - tail_size_before;

    allocator.alloc(request_size).unwrap();

    assert_eq!(allocator.current_break(), break_before + deficit);
    // No new block was appended — the tail grew in place.
    assert_eq!(allocator.blocks().len(), 2);
  }

  #[test]
  fn mapping_path_for_large_allocations() {
    let _guard = serial();
    let mut allocator = Allocator::new();

    let ptr = allocator.alloc(HEAP_THRESHOLD).unwrap();
    assert_eq!(allocator.blocks(), vec![(align_up(HEAP_THRESHOLD), Status::Mapped)]);

    allocator.free(Some(ptr));
    assert!(allocator.blocks().is_empty());
  }

  #[test]
  fn boundary_between_heap_and_mapping_routing() {
    let _guard = serial();
    let mut small = Allocator::new();
    let mut big = Allocator::new();

    let just_under = HEAP_THRESHOLD - HEADER_SIZE - 1;
    let at_threshold = HEAP_THRESHOLD - HEADER_SIZE;

    small.alloc(just_under).unwrap();
    assert_eq!(small.blocks()[0].1, Status::Alloc);

    big.alloc(at_threshold).unwrap();
    assert_eq!(big.blocks()[0].1, Status::Mapped);
  }

  #[test]
  fn resize_relocates_when_neighbour_is_busy() {
    let _guard = serial();
    let mut allocator = Allocator::new();

    let p = allocator.alloc(100).unwrap();
    unsafe { p.write_bytes(0x42, 100) };
    let _q = allocator.alloc(100).unwrap();

    let r = allocator.resize(Some(p), 10_000).unwrap();
    assert_ne!(r, p);
    let bytes = unsafe { std::slice::from_raw_parts(r, 100) };
    assert!(bytes.iter().all(|&b| b == 0x42));
  }

  #[test]
  fn resize_shrink_preserves_prefix() {
    let _guard = serial();
    let mut allocator = Allocator::new();

    let p = allocator.alloc(100).unwrap();
    unsafe {
      for i in 0..100u8 {
        p.add(i as usize).write(i);
      }
    }

    let p = allocator.resize(Some(p), 10).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(p, 10) };
    assert_eq!(bytes, &(0u8..10).collect::<Vec<_>>()[..]);
  }

  #[test]
  fn resize_none_pointer_behaves_like_alloc() {
    let _guard = serial();
    let mut allocator = Allocator::new();
    assert!(allocator.resize(None, 64).is_some());
  }

  #[test]
  fn resize_to_zero_frees_and_returns_none() {
    let _guard = serial();
    let mut allocator = Allocator::new();
    let p = allocator.alloc(64).unwrap();
    assert!(allocator.resize(Some(p), 0).is_none());
  }

  #[test]
  fn resize_of_free_block_is_rejected() {
    let _guard = serial();
    let mut allocator = Allocator::new();
    let p = allocator.alloc(64).unwrap();
    allocator.free(Some(p));
    assert!(allocator.resize(Some(p), 128).is_none());
  }

  #[test]
  fn calloc_zeroes_every_byte() {
    let _guard = serial();
    let mut allocator = Allocator::new();

    let ptr = allocator.zeroed_alloc(1000, 1).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(ptr, 1000) };
    assert!(bytes.iter().all(|&b| b == 0));
  }

  #[test]
  fn calloc_rejects_zero_operands() {
    let _guard = serial();
    let mut allocator = Allocator::new();
    assert!(allocator.zeroed_alloc(0, 8).is_none());
    assert!(allocator.zeroed_alloc(8, 0).is_none());
  }

  #[test]
  fn calloc_rejects_multiplication_overflow() {
    let _guard = serial();
    let mut allocator = Allocator::new();
    assert!(allocator.zeroed_alloc(usize::MAX, 2).is_none());
  }

  #[test]
  fn free_of_none_is_noop() {
    let _guard = serial();
    let mut allocator = Allocator::new();
    allocator.free(None);
  }

  #[test]
  fn repeated_free_alloc_does_not_grow_break_past_stabilisation() {
    let _guard = serial();
    let mut allocator = Allocator::new();

    allocator.alloc(64).unwrap(); // preallocate + first split
    let stable_break = allocator.current_break();

    for _ in 0..50 {
      let p = allocator.alloc(64).unwrap();
      allocator.free(Some(p));
    }

    assert_eq!(allocator.current_break(), stable_break);
  }

  #[test]
  fn heap_byte_accounting_matches_break_delta() {
    let _guard = serial();
    let mut allocator = Allocator::new();

    let a = allocator.alloc(100).unwrap();
    let b = allocator.alloc(4096).unwrap();
    allocator.free(Some(a));
    allocator.alloc(HEAP_THRESHOLD).unwrap(); // mapping-backed, excluded from the sum
    allocator.free(Some(b));

    let heap_bytes: usize = allocator
      .blocks()
      .into_iter()
      .filter(|(_, status)| *status != Status::Mapped)
      .map(|(size, _)| size + HEADER_SIZE)
      .sum();

    assert_eq!(heap_bytes, allocator.current_break() - allocator.initial_break());
  }

  #[quickcheck_macros::quickcheck]
  fn free_is_a_noop_on_the_break_for_any_heap_class_size(size: usize) -> quickcheck::TestResult {
    if size == 0 || size.saturating_add(HEADER_SIZE) >= HEAP_THRESHOLD {
      return quickcheck::TestResult::discard();
    }

    let _guard = serial();
    let mut allocator = Allocator::new();

    let p = allocator.alloc(size).unwrap();
    let break_after_alloc = allocator.current_break();
    allocator.free(Some(p));

    quickcheck::TestResult::from_bool(allocator.current_break() == break_after_alloc)
  }

  #[quickcheck_macros::quickcheck]
  fn resize_down_preserves_requested_prefix(extra: u8) -> quickcheck::TestResult {
    let n = 1 + (extra as usize % 200);

    let _guard = serial();
    let mut allocator = Allocator::new();
    let p = allocator.alloc(n + 64).unwrap();
    unsafe {
      for i in 0..n {
        p.add(i).write(i as u8);
      }
    }

    let p = allocator.resize(Some(p), n).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(p, n) };
    quickcheck::TestResult::from_bool(bytes.iter().enumerate().all(|(i, &b)| b == i as u8))
  }
}
