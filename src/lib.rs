//! fitalloc: a `malloc` replacement built straight on top of page mappings.
//!
//! Memory is requested from the kernel in page-aligned regions. Each region is
//! cut into blocks, and every block starts with a header describing it:
//!
//! ```text
//! +-------------------------------+
//! | Header   | Actual memory block |
//! +-------------------------------+
//! ```
//!
//! The returned pointer is at the start of the memory block. Freed blocks are
//! reused before any new page is mapped, with one of three search policies
//! ([`Policy`]), and a region is unmapped as soon as none of its blocks is in
//! use. [`dump()`] explains the current layout.
//!
//! The free functions of this module work on one process-wide [`Heap`]
//! configured through the `ALLOCATOR_ALGORITHM` and `ALLOCATOR_SCRIBBLE`
//! environment variables. The `interpose` feature additionally exports them
//! under their C names so the cdylib can replace the system allocator:
//!
//! ```bash,ignore
//! LD_PRELOAD=target/release/libfitalloc.so ALLOCATOR_ALGORITHM=best_fit ls
//! ```

use std::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    ptr::{self, NonNull},
};

mod block;
pub mod config;
pub mod dump;
mod error;
mod heap;
mod kernel;
mod list;
mod region;
mod search;
mod utils;

#[cfg(all(unix, feature = "interpose"))]
mod ffi;

pub use block::{HEADER_SIZE, LABEL_CAPACITY};
pub use config::{EnvOptions, FixedOptions, OptionSource, Settings};
pub use dump::BlockInfo;
pub use error::AllocError;
pub use heap::Heap;
pub use kernel::page_size;
pub use search::Policy;
pub use utils::ALIGNMENT;

/// The process-wide heap behind the free functions and [`FitAlloc`].
static HEAP: Heap = Heap::new();

/// Allocates `size` bytes from the process-wide heap.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    HEAP.allocate(size, None)
}

/// Like [`allocate`], labelling the block with `label` for [`dump`].
pub fn allocate_named(size: usize, label: &str) -> Result<NonNull<u8>, AllocError> {
    HEAP.allocate(size, Some(label))
}

/// Allocates `count * elem_size` zeroed bytes from the process-wide heap.
pub fn allocate_zeroed(count: usize, elem_size: usize) -> Result<NonNull<u8>, AllocError> {
    HEAP.allocate_zeroed(count, elem_size)
}

/// Releases memory obtained from the process-wide heap. Null is ignored.
///
/// **SAFETY**: `ptr` must be null or a live pointer from this module.
pub unsafe fn release(ptr: *mut u8) {
    unsafe { HEAP.release(ptr) }
}

/// Resizes memory obtained from the process-wide heap. See [`Heap::resize`].
///
/// **SAFETY**: `ptr` must be null or a live pointer from this module.
pub unsafe fn resize(ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
    unsafe { HEAP.resize(ptr, new_size) }
}

/// Writes the layout of the process-wide heap to `sink`.
pub fn dump(sink: &mut dyn fmt::Write) -> fmt::Result {
    HEAP.dump(sink)
}

/// Writes the layout of the process-wide heap to standard output.
pub fn print_memory() {
    #[cfg(unix)]
    let mut sink = dump::FdSink::stdout();
    #[cfg(not(unix))]
    let mut sink = dump::IoSink(std::io::stdout());

    let _ = dump(&mut sink);
}

/// [`GlobalAlloc`] over the process-wide heap.
///
/// Blocks are only guaranteed to be aligned to [`ALIGNMENT`], so layouts
/// asking for more get a null pointer.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: fitalloc::FitAlloc = fitalloc::FitAlloc;
/// ```
pub struct FitAlloc;

unsafe impl GlobalAlloc for FitAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        allocate(layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { release(ptr) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        allocate_zeroed(1, layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        match unsafe { resize(ptr, new_size) } {
            Ok(Some(moved)) => moved.as_ptr(),
            _ => ptr::null_mut(),
        }
    }
}
