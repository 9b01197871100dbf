use std::{cell::Cell, fmt, ptr::NonNull};

use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::{
    block::{BlockRef, Label},
    config::{EnvOptions, OptionSource, SCRIBBLE_BYTE, Settings},
    dump::{self, BlockInfo},
    error::AllocError,
    kernel::page_size,
    list::BlockList,
    region::{self, Reclaim},
    search::{self, Policy, Reuse},
    utils::required_size,
};

thread_local! {
    static REPORTING: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f`, which logs, unless this thread is already inside such a call.
///
/// Must only be called with the heap lock released. A logger that allocates
/// through this heap then re-enters it normally, and the records those nested
/// calls would produce are dropped instead of recursing.
fn report(f: impl FnOnce()) {
    let _ = REPORTING.try_with(|busy| {
        if !busy.replace(true) {
            f();
            busy.set(false);
        }
    });
}

/// Where an allocation ended up, captured under the lock and logged after.
#[derive(Debug, Clone, Copy)]
enum Placement {
    Reused(Reuse),
    Mapped { base: NonNull<u8>, extent: usize },
}

/// Finds or maps a block for `required` bytes and labels it. Runs with the
/// lock held, so it must not log.
fn place(
    state: &mut State,
    required: usize,
    policy: Policy,
    label: Label<'_>,
) -> Result<(BlockRef, Placement), AllocError> {
    let (block, placement) = match search::find_reusable(state, required, policy) {
        Some((block, reuse)) => (block, Placement::Reused(reuse)),
        None => {
            let block = region::acquire_region(state, required)?;
            (block, Placement::Mapped { base: block.addr(), extent: block.region_extent() })
        }
    };

    block.write_label(label);

    Ok((block, placement))
}

/// Everything the lock protects: the block list and the id counter.
pub(crate) struct State {
    pub blocks: BlockList,
    next_id: u64,
}

// The raw links inside the list point into our own mappings, which are not
// tied to any thread. Access is serialized by the heap lock.
unsafe impl Send for State {}

impl State {
    pub const fn new() -> Self {
        Self { blocks: BlockList::new(), next_id: 0 }
    }

    /// Hands out the next block id. Ids are never reused.
    #[inline]
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// The allocator engine.
///
/// One list of blocks spread over page-aligned regions, guarded by a single
/// lock. Every allocation first looks for room in the existing blocks with the
/// configured [`crate::Policy`] and only maps a new region when nothing fits.
/// Every free checks whether the block's region became completely unused and,
/// if so, unmaps it.
///
/// Options are read from `S` on each allocation, see [`crate::config`].
pub struct Heap<S = EnvOptions> {
    state: Mutex<State>,
    options: S,
}

impl Heap<EnvOptions> {
    /// Heap configured through the process environment.
    pub const fn new() -> Self {
        Self::with_options(EnvOptions)
    }
}

impl Default for Heap<EnvOptions> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Heap<S> {
    pub const fn with_options(options: S) -> Self {
        Self { state: Mutex::new(State::new()), options }
    }
}

impl<S: OptionSource> Heap<S> {
    /// The settings the next allocation would use.
    pub fn settings(&self) -> Settings {
        Settings::resolve(&self.options)
    }

    /// Allocates `size` bytes and labels the block with `label`, or with
    /// `ALOCATOR <id>` when no label is given.
    ///
    /// The returned pointer is aligned to [`crate::ALIGNMENT`] and the block
    /// header sits right before it.
    pub fn allocate(&self, size: usize, label: Option<&str>) -> Result<NonNull<u8>, AllocError> {
        self.allocate_labelled(size, label.map_or(Label::Default, Label::Text))
    }

    pub(crate) fn allocate_labelled(&self, size: usize, label: Label<'_>) -> Result<NonNull<u8>, AllocError> {
        let settings = self.settings();
        let required = required_size(size).ok_or(AllocError::SizeOverflow)?;

        let placed = {
            let mut state = self.state.lock();
            place(&mut state, required, settings.policy, label)
                .map(|(block, placement)| (block.payload(), block.id(), placement))
        };

        let (payload, id, placement) = match placed {
            Ok(placed) => placed,
            Err(err) => {
                report(|| warn!("allocation of {size} bytes failed: {err}"));
                return Err(err);
            }
        };

        if settings.scribble {
            unsafe { payload.as_ptr().write_bytes(SCRIBBLE_BYTE, size) };
        }

        report(|| {
            let policy = settings.policy.name();
            match placement {
                Placement::Reused(Reuse::InPlace { previous }) => {
                    trace!("{policy}: reused free block {previous} in place as block {id}")
                }
                Placement::Reused(Reuse::Split { parent, offset }) => {
                    trace!("{policy}: split block {parent} at offset {offset} into block {id}")
                }
                Placement::Mapped { base, extent } => debug!(
                    "mapped region {:p} of {extent} bytes ({} pages) for block {id}",
                    base,
                    extent / page_size()
                ),
            }
            trace!("allocate({size}) -> {:p}", payload);
        });

        Ok(payload)
    }

    /// Releases the block holding `ptr`. Null pointers are ignored.
    ///
    /// When this leaves the block's region without any block in use, the
    /// whole region goes back to the kernel.
    ///
    /// **SAFETY**: `ptr` must be null or a live pointer returned by this heap.
    pub unsafe fn release(&self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };

        let reclaim = {
            let mut state = self.state.lock();
            let block = unsafe { BlockRef::from_payload(payload) };
            region::release_block(&mut state, block)
        };

        match reclaim {
            Reclaim::Retained => report(|| trace!("release({:p})", payload)),
            Reclaim::Unmapped { extent } => {
                report(|| debug!("release({:p}) unmapped its region of {extent} bytes", payload))
            }
            Reclaim::UnmapFailed { extent } => {
                report(|| error!("release({:p}) failed to unmap its region of {extent} bytes", payload));
                std::process::abort();
            }
        }
    }

    /// Allocates room for `count` elements of `elem_size` bytes, zero filled.
    pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = count.checked_mul(elem_size).ok_or(AllocError::SizeOverflow)?;
        let payload = self.allocate(size, None)?;

        // Reused blocks may hold old content.
        unsafe { payload.as_ptr().write_bytes(0, size) };

        Ok(payload)
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes.
    ///
    /// - A null `ptr` allocates.
    /// - A zero `new_size` releases `ptr` and returns `Ok(None)`.
    /// - If the block's capacity already covers the new size, only its
    ///   bookkeeping changes and the same pointer comes back.
    /// - Otherwise a new block is allocated, the old content copied over and
    ///   the old block released. If that allocation fails, `ptr` stays valid.
    ///
    /// **SAFETY**: `ptr` must be null or a live pointer returned by this heap.
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(payload) = NonNull::new(ptr) else {
            return self.allocate(new_size, None).map(Some);
        };

        if new_size == 0 {
            unsafe { self.release(ptr) };
            return Ok(None);
        }

        let required = required_size(new_size).ok_or(AllocError::SizeOverflow)?;

        let old_len = {
            let _state = self.state.lock();
            let block = unsafe { BlockRef::from_payload(payload) };

            if required <= block.capacity() {
                block.set_occupied(required);
                None
            } else {
                Some(block.payload_len())
            }
        };

        let Some(old_len) = old_len else {
            report(|| trace!("resize({:p}, {new_size}) in place", payload));
            return Ok(Some(payload));
        };

        // The copy runs without the lock. The old block stays valid until
        // it is released below.
        let moved = self.allocate(new_size, None)?;
        unsafe {
            moved.as_ptr().copy_from_nonoverlapping(payload.as_ptr(), old_len.min(new_size));
            self.release(ptr);
        }

        report(|| trace!("resize({:p}, {new_size}) moved to {:p}", payload, moved));

        Ok(Some(moved))
    }
}

impl<S> Heap<S> {
    /// Calls `f` with a description of every block, in list order, with the
    /// lock held. `f` must not allocate from this heap.
    pub fn for_each_block(&self, mut f: impl FnMut(&BlockInfo<'_>)) {
        let state = self.state.lock();

        for block in &state.blocks {
            f(&BlockInfo::of(&block));
        }
    }

    /// Writes the current region and block layout to `sink`. The lock is held
    /// for the whole walk, so `sink` must not allocate from this heap.
    pub fn dump(&self, sink: &mut dyn fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        dump::render(&state.blocks, sink)
    }

    /// Number of regions currently mapped.
    pub fn region_count(&self) -> usize {
        let state = self.state.lock();
        state.blocks.iter().filter(|block| block.region() == *block).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::HEADER_SIZE,
        config::FixedOptions,
        kernel::page_size,
        search::Policy,
        utils::ALIGNMENT,
    };

    fn heap(policy: Policy) -> Heap<FixedOptions> {
        Heap::with_options(FixedOptions::new(policy))
    }

    fn block_of(heap: &Heap<FixedOptions>, ptr: NonNull<u8>) -> (usize, usize, String) {
        let mut found = None;
        heap.for_each_block(|info| {
            if info.payload_addr() == ptr.as_ptr() as usize {
                found = Some((info.capacity, info.occupied, info.label.to_string()));
            }
        });
        found.expect("pointer belongs to the heap")
    }

    #[test]
    fn nested_reports_are_dropped() {
        let mut outer = 0;
        let mut inner = 0;

        report(|| {
            outer += 1;
            report(|| inner += 1);
        });
        report(|| outer += 1);

        assert_eq!(2, outer);
        assert_eq!(0, inner);
    }

    #[test]
    fn basic_alloc() {
        let heap = heap(Policy::FirstFit);

        unsafe {
            let block = heap.allocate(4, None).unwrap().cast::<u32>();
            block.write(23);
            assert_eq!(23, block.read());
            heap.release(block.as_ptr().cast());
        }

        assert_eq!(0, heap.region_count());
    }

    #[test]
    fn default_and_custom_labels() {
        let heap = heap(Policy::FirstFit);

        let a = heap.allocate(16, None).unwrap();
        let b = heap.allocate(16, Some("named")).unwrap();

        assert_eq!("ALOCATOR 0", block_of(&heap, a).2);
        assert_eq!("named", block_of(&heap, b).2);

        unsafe {
            heap.release(a.as_ptr());
            heap.release(b.as_ptr());
        }
    }

    #[test]
    fn space_for_free_block_is_used() {
        let heap = heap(Policy::FirstFit);

        unsafe {
            let first_block = heap.allocate(4, None).unwrap();
            let second = heap.allocate(8, None).unwrap();
            let third = heap.allocate(8, None).unwrap();

            heap.release(first_block.as_ptr());

            let again = heap.allocate(4, None).unwrap();

            assert_eq!(first_block, again);
            assert_eq!(1, heap.region_count());

            for ptr in [again, second, third] {
                heap.release(ptr.as_ptr());
            }
        }
    }

    #[test]
    fn pointers_are_aligned() {
        let heap = heap(Policy::BestFit);
        let mut ptrs = Vec::new();

        for size in 0..100 {
            let ptr = heap.allocate(size, None).unwrap();
            assert_eq!(0, ptr.as_ptr() as usize % ALIGNMENT);

            let (capacity, occupied, _) = block_of(&heap, ptr);
            assert_eq!(0, occupied % ALIGNMENT);
            assert_eq!(0, capacity % ALIGNMENT);
            assert!(occupied >= size + HEADER_SIZE);
            ptrs.push(ptr);
        }

        for ptr in ptrs {
            unsafe { heap.release(ptr.as_ptr()) };
        }
        assert_eq!(0, heap.region_count());
    }

    #[test]
    fn scribble_fills_payload() {
        let heap = Heap::with_options(FixedOptions::new(Policy::FirstFit).scribble(true));

        let ptr = heap.allocate(64, None).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == SCRIBBLE_BYTE));

        unsafe { heap.release(ptr.as_ptr()) };
    }

    #[test]
    fn allocate_zeroed_clears_reused_memory() {
        let heap = Heap::with_options(FixedOptions::new(Policy::FirstFit).scribble(true));

        let keep = heap.allocate(8, None).unwrap();
        let dirty = heap.allocate(128, None).unwrap();
        unsafe { heap.release(dirty.as_ptr()) };

        let zeroed = heap.allocate_zeroed(16, 8).unwrap();
        assert_eq!(dirty, zeroed);
        let bytes = unsafe { std::slice::from_raw_parts(zeroed.as_ptr(), 128) };
        assert!(bytes.iter().all(|&b| b == 0));

        unsafe {
            heap.release(zeroed.as_ptr());
            heap.release(keep.as_ptr());
        }
    }

    #[test]
    fn allocate_zeroed_overflow() {
        let heap = heap(Policy::FirstFit);

        assert_eq!(Err(AllocError::SizeOverflow), heap.allocate_zeroed(usize::MAX, 2));
        assert_eq!(0, heap.region_count());
    }

    #[test]
    fn oversized_request_fails_cleanly() {
        let heap = heap(Policy::FirstFit);

        assert!(heap.allocate(usize::MAX - HEADER_SIZE, None).is_err());
        assert!(heap.allocate(usize::MAX / 2, None).is_err());
        assert_eq!(0, heap.region_count());

        // The heap is still usable afterwards.
        let ptr = heap.allocate(8, None).unwrap();
        unsafe { heap.release(ptr.as_ptr()) };
    }

    #[test]
    fn release_null_is_noop() {
        let heap = heap(Policy::FirstFit);
        unsafe { heap.release(std::ptr::null_mut()) };
        assert_eq!(0, heap.region_count());
    }

    #[test]
    fn resize_null_allocates() {
        let heap = heap(Policy::FirstFit);

        let ptr = unsafe { heap.resize(std::ptr::null_mut(), 32) }.unwrap().unwrap();
        assert_eq!(HEADER_SIZE + 32, block_of(&heap, ptr).1);

        unsafe { heap.release(ptr.as_ptr()) };
    }

    #[test]
    fn resize_shrinks_in_place() {
        let heap = heap(Policy::FirstFit);

        unsafe {
            let ptr = heap.allocate(1024, None).unwrap();
            let keep = heap.allocate(8, None).unwrap();

            let shrunk = heap.resize(ptr.as_ptr(), 100).unwrap().unwrap();
            assert_eq!(ptr, shrunk);

            let (capacity, occupied, _) = block_of(&heap, shrunk);
            assert_eq!(HEADER_SIZE + 1024, capacity);
            assert_eq!(HEADER_SIZE + 104, occupied);

            // Growing back within the capacity is in place too.
            assert_eq!(Some(ptr), heap.resize(ptr.as_ptr(), 1024).unwrap());

            heap.release(ptr.as_ptr());
            heap.release(keep.as_ptr());
        }
    }

    #[test]
    fn resize_grows_by_copying() {
        let heap = heap(Policy::FirstFit);

        unsafe {
            let ptr = heap.allocate(100, None).unwrap();
            let keep = heap.allocate(8, None).unwrap();
            for i in 0..100 {
                ptr.as_ptr().add(i).write(i as u8);
            }

            let grown = heap.resize(ptr.as_ptr(), page_size() * 2).unwrap().unwrap();
            assert_ne!(ptr, grown);
            for i in 0..100 {
                assert_eq!(i as u8, grown.as_ptr().add(i).read());
            }

            // Old block is free, its region is kept alive by `keep`.
            let mut old_free = false;
            heap.for_each_block(|info| {
                if info.payload_addr() == ptr.as_ptr() as usize {
                    old_free = info.occupied == 0;
                }
            });
            assert!(old_free);
            assert_eq!(2, heap.region_count());

            heap.release(grown.as_ptr());
            heap.release(keep.as_ptr());
        }

        assert_eq!(0, heap.region_count());
    }

    #[test]
    fn resize_to_zero_releases() {
        let heap = heap(Policy::FirstFit);

        unsafe {
            let ptr = heap.allocate(64, None).unwrap();
            assert_eq!(None, heap.resize(ptr.as_ptr(), 0).unwrap());
        }

        assert_eq!(0, heap.region_count());
    }
}
