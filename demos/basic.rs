//! Walks through the first-fit scenario on the process-wide heap, printing the
//! layout after every step. Run with `ALLOCATOR_ALGORITHM=best_fit` or
//! `worst_fit` to compare.

use std::ptr::NonNull;

fn log_alloc(label: &str, addr: NonNull<u8>, size: usize) {
    println!("Requested {size} bytes for '{label}'");
    println!("Received this address: {addr:?}");
}

fn main() {
    let mut ptrs = Vec::new();

    for (i, size) in [500, 1000, 250, 294, 400].into_iter().enumerate() {
        let label = format!("ALLOCATION {i}");
        let addr = fitalloc::allocate_named(size, &label).expect("mapping a region");
        log_alloc(&label, addr, size);
        ptrs.push(addr);
    }
    fitalloc::print_memory();

    unsafe {
        fitalloc::release(ptrs[1].as_ptr());
        fitalloc::release(ptrs[3].as_ptr());
    }
    println!("Released ALLOCATION 1 and ALLOCATION 3");
    fitalloc::print_memory();

    let fifth = fitalloc::allocate_named(600, "ALLOCATION 5").expect("mapping a region");
    log_alloc("ALLOCATION 5", fifth, 600);
    fitalloc::print_memory();

    unsafe {
        for ptr in [ptrs[0], ptrs[2], ptrs[4], fifth] {
            fitalloc::release(ptr.as_ptr());
        }
    }
    println!("Released everything");
    fitalloc::print_memory();
}
