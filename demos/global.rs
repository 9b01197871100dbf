//! `FitAlloc` as the global allocator: freed blocks come back at the same
//! address, a region disappears from the dump once its only block is
//! dropped, and over-aligned layouts are refused.

use std::{
    alloc::{GlobalAlloc, Layout},
    io::Write,
};

use fitalloc::{FitAlloc, HEADER_SIZE, page_size};

#[global_allocator]
static ALLOCATOR: FitAlloc = FitAlloc;

fn dump(title: &str) {
    println!("\n## {title}");
    // The dump bypasses the stdout buffer.
    let _ = std::io::stdout().flush();
    fitalloc::print_memory();
}

fn main() {
    let first = Box::new([7u8; 256]);
    let neighbour = Box::new([9u8; 16]);
    let first_at = first.as_ptr();
    drop(first);

    let second = Box::new([1u8; 200]);
    println!(
        "freed block at {:p}, next request served at {:p} ({})",
        first_at,
        second.as_ptr(),
        if first_at == second.as_ptr() { "reused" } else { "an earlier hole fit" }
    );

    // Exactly three pages with the header, so it gets a region of its own.
    let big = Vec::<u8>::with_capacity(3 * page_size() - HEADER_SIZE);
    dump("with a three page block");

    drop(big);
    dump("after dropping it");

    let over_aligned = Layout::from_size_align(64, 64).expect("valid layout");
    let ptr = unsafe { ALLOCATOR.alloc(over_aligned) };
    println!("\n64-byte alignment: {}", if ptr.is_null() { "refused" } else { "served" });

    drop(second);
    drop(neighbour);
}
