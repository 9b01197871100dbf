//! C-ABI exports, so the cdylib can stand in for the system allocator.
//!
//! Gated behind `features = ["interpose"]`. Every export works on the
//! process-wide heap and turns errors into null pointers, like the functions
//! it replaces. Unit tests build them as plain Rust functions, so the test
//! binary keeps the system allocator.

use std::{
    ffi::{CStr, c_char, c_void},
    ptr::{self, NonNull},
};

use libc::{FILE, size_t};

use crate::{HEAP, block::Label, dump::FdSink};

#[inline]
fn to_c(result: Result<NonNull<u8>, crate::AllocError>) -> *mut c_void {
    result.map_or(ptr::null_mut(), |ptr| ptr.as_ptr().cast())
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    to_c(HEAP.allocate(size, None))
}

/// `malloc` that also labels the block for the memory dump. A null `name`
/// gets the default label. Names longer than the label field are truncated.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_name(size: size_t, name: *const c_char) -> *mut c_void {
    let label = if name.is_null() {
        Label::Default
    } else {
        Label::Bytes(unsafe { CStr::from_ptr(name) }.to_bytes())
    };

    to_c(HEAP.allocate_labelled(size, label))
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    unsafe { HEAP.release(ptr.cast()) }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    to_c(HEAP.allocate_zeroed(nmemb, size))
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    match unsafe { HEAP.resize(ptr.cast(), size) } {
        Ok(Some(moved)) => moved.as_ptr().cast(),
        _ => ptr::null_mut(),
    }
}

/// Writes the memory dump to `file`, or to standard output when it is null.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn save_memory(file: *mut FILE) {
    let fd = if file.is_null() {
        libc::STDOUT_FILENO
    } else {
        // Keep whatever the caller already buffered in front of the dump.
        unsafe {
            libc::fflush(file);
            libc::fileno(file)
        }
    };

    let _ = HEAP.dump(&mut FdSink(fd));
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn print_memory() {
    crate::print_memory();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label_of(ptr: *mut c_void) -> Option<String> {
        let mut label = None;
        HEAP.for_each_block(|info| {
            if info.payload_addr() == ptr as usize && !info.is_free() {
                label = Some(info.label.to_string());
            }
        });
        label
    }

    #[test]
    fn malloc_name_labels() {
        unsafe {
            let unnamed = malloc_name(24, ptr::null());
            let named = malloc_name(24, c"c buffer".as_ptr());
            let raw = malloc_name(24, c"caf\xe9".as_ptr());
            let long = malloc_name(24, c"a name that does not fit in the label field".as_ptr());

            assert!(label_of(unnamed).unwrap().starts_with("ALOCATOR "));
            assert_eq!(Some("c buffer".to_string()), label_of(named));
            assert_eq!(Some("caf\u{FFFD}".to_string()), label_of(raw));
            assert_eq!(crate::LABEL_CAPACITY - 1, label_of(long).unwrap().len());

            for ptr in [unnamed, named, raw, long] {
                free(ptr);
            }
        }
    }

    #[test]
    fn realloc_edge_cases() {
        unsafe {
            // Null allocates.
            let ptr = realloc(ptr::null_mut(), 32);
            assert!(!ptr.is_null());
            ptr.cast::<u8>().write_bytes(0x42, 32);

            // A failed resize leaves the old block alone.
            assert!(realloc(ptr, usize::MAX - 8).is_null());
            let bytes = std::slice::from_raw_parts(ptr.cast::<u8>(), 32);
            assert!(bytes.iter().all(|&b| b == 0x42));
            assert!(label_of(ptr).is_some());

            let grown = realloc(ptr, 9000);
            assert!(!grown.is_null());
            let bytes = std::slice::from_raw_parts(grown.cast::<u8>(), 32);
            assert!(bytes.iter().all(|&b| b == 0x42));

            // Zero size frees and returns null.
            assert!(realloc(grown, 0).is_null());
        }
    }

    #[test]
    fn calloc_overflow_is_null() {
        unsafe {
            assert!(calloc(usize::MAX, 16).is_null());

            let zeroed = calloc(10, 12);
            assert!(!zeroed.is_null());
            let bytes = std::slice::from_raw_parts(zeroed.cast::<u8>(), 120);
            assert!(bytes.iter().all(|&b| b == 0));
            free(zeroed);

            free(ptr::null_mut());
            let plain = malloc(0);
            assert!(!plain.is_null());
            free(plain);
        }
    }

    #[test]
    fn save_memory_to_file_and_stdout() {
        unsafe {
            let saved = malloc_name(40, c"saved".as_ptr());

            let file = libc::tmpfile();
            assert!(!file.is_null());
            save_memory(file);

            let fd = libc::fileno(file);
            assert_eq!(0, libc::lseek(fd, 0, libc::SEEK_SET));
            let mut buf = vec![0u8; 64 * 1024];
            let read = libc::read(fd, buf.as_mut_ptr().cast(), buf.len());
            assert!(read > 0);
            libc::fclose(file);

            let out = String::from_utf8_lossy(&buf[..read as usize]);
            assert!(out.starts_with("-- Current Memory State --\n"));
            assert!(out.contains("'saved' "));

            // Null means standard output.
            save_memory(ptr::null_mut());
            print_memory();

            free(saved);
        }
    }
}
