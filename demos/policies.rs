//! Same holes, three policies: shows where each one places a request.

use fitalloc::{FixedOptions, HEADER_SIZE, Heap, Policy, dump::IoSink};

fn main() {
    for policy in [Policy::FirstFit, Policy::BestFit, Policy::WorstFit] {
        let heap = Heap::with_options(FixedOptions::new(policy));

        let mut guards = Vec::new();
        let holes: Vec<_> = [120, 608, 160]
            .into_iter()
            .map(|size| {
                let hole = heap.allocate(size, Some("hole")).expect("mapping a region");
                guards.push(heap.allocate(8, Some("guard")).expect("mapping a region"));
                hole
            })
            .collect();

        // Take the rest of the region, so only the holes are left to choose from.
        let mut tail_span = 0;
        heap.for_each_block(|info| tail_span = info.capacity - info.occupied);
        guards.push(heap.allocate(tail_span - HEADER_SIZE, Some("filler")).expect("splitting the tail"));

        for hole in &holes {
            unsafe { heap.release(hole.as_ptr()) };
        }

        let served = heap.allocate(104, Some(policy.name())).expect("reusing a hole");

        println!("== {} (header is {HEADER_SIZE} bytes)", policy.name());
        let _ = heap.dump(&mut IoSink(std::io::stdout()));

        unsafe {
            heap.release(served.as_ptr());
            for guard in guards {
                heap.release(guard.as_ptr());
            }
        }
    }
}
