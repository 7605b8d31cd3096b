//! Walks through a handful of allocator operations while printing the
//! program break, so the preallocation / best-fit / mapping behaviour can be
//! observed directly (e.g. alongside `strace -e sbrk,mmap,munmap`).

use rallocator::Allocator;

unsafe fn print_program_break(label: &str) {
  println!("[{label}] PID = {}, program break (sbrk(0)) = {:?}", std::process::id(), unsafe { libc::sbrk(0) });
}

fn main() {
  env_logger::init();
  let mut allocator = Allocator::new();

  unsafe {
    print_program_break("start");

    // First allocation triggers preallocation of the whole HEAP_THRESHOLD
    // region; only a handful of bytes are actually used.
    println!("\n[1] alloc(100)");
    let p1 = allocator.alloc(100).expect("alloc failed");
    p1.write_bytes(0xAB, 100);
    print_program_break("after alloc(100)");

    // A second, larger allocation carves more off the same preallocated block.
    println!("\n[2] alloc(4096)");
    let p2 = allocator.alloc(4096).expect("alloc failed");
    p2.write_bytes(0xCD, 4096);
    print_program_break("after alloc(4096)");

    // Freeing p1 just marks it FREE; no coalescing happens until the next alloc.
    println!("\n[3] free(p1)");
    allocator.free(Some(p1));

    // This allocation triggers the coalesce sweep before best-fit search.
    println!("\n[4] alloc(64) — triggers coalesce + best-fit");
    let p3 = allocator.alloc(64).expect("alloc failed");
    p3.write_bytes(0xEF, 64);

    // A request at or above HEAP_THRESHOLD routes straight to mmap.
    println!("\n[5] alloc(256 KiB) — mapping-backed");
    let big = allocator.alloc(256 * 1024).expect("alloc failed");
    print_program_break("after big alloc (should be unchanged: mmap, not sbrk)");
    allocator.free(Some(big));

    // resize() grows p3 in place if it's the heap tail, else relocates.
    println!("\n[6] resize(p3, 8192)");
    let p3 = allocator.resize(Some(p3), 8192).expect("resize failed");

    allocator.free(Some(p2));
    allocator.free(Some(p3));

    println!("\nDone. The process break only grows; exit reclaims everything.");
  }
}
