//! # rallocator — a best-fit heap and mapping allocator
//!
//! A drop-in replacement for the `malloc`/`calloc`/`realloc`/`free` family,
//! backed by two operating-system primitives:
//!
//! - a contiguous program break (`sbrk`), preallocated in `HEAP_THRESHOLD`
//!   chunks and managed with best-fit placement, for small requests;
//! - a dedicated anonymous mapping (`mmap`) per request, for anything at or
//!   above that threshold.
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │                          Allocator                                │
//!   │                                                                    │
//!   │   small request              large request                        │
//!   │        │                          │                                │
//!   │        ▼                          ▼                                │
//!   │  ┌────────────┐            ┌────────────┐                          │
//!   │  │ heap arena │            │   mapping  │                          │
//!   │  │ (best-fit, │            │  (one mmap │                          │
//!   │  │  sbrk)     │            │  per block)│                          │
//!   │  └─────┬──────┘            └─────┬──────┘                          │
//!   │        └───────────┬─────────────┘                                 │
//!   │                    ▼                                               │
//!   │              block registry                                       │
//!   │      (intrusive singly-linked list, address order on the heap)     │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate structure
//!
//! ```text
//!   rallocator
//!   ├── align    - fixed word-alignment helper
//!   ├── block    - block header layout and header/payload pointer arithmetic
//!   ├── os       - sbrk / mmap / munmap / page-size adapter
//!   ├── registry - the intrusive block list
//!   ├── arena    - preallocation, best-fit search, split, coalesce
//!   └── router   - alloc / zeroed_alloc / free / resize entry points
//! ```
//!
//! ## Quick start
//!
//! ```
//! use rallocator::Allocator;
//!
//! let mut allocator = Allocator::new();
//!
//! let ptr = allocator.alloc(64).expect("allocation failed");
//! unsafe {
//!     ptr.write_bytes(0xAB, 64);
//! }
//! allocator.free(Some(ptr));
//! ```
//!
//! ## Safety and concurrency
//!
//! Every allocation is a raw, non-owning pointer — the allocator itself owns
//! all backing memory for as long as a block is live. The allocator is not
//! thread-safe: callers sharing one across threads must serialise access
//! themselves (e.g. behind a `Mutex<Allocator>`).
//!
//! Double-free, use-after-free, and resizing an unrecognised pointer are
//! undefined behaviour, exactly as with the C allocator this replaces.

pub mod align;
mod arena;
mod block;
mod os;
mod registry;
mod router;

pub use router::Allocator;
