use crate::{
    block::BlockRef,
    error::AllocError,
    heap::State,
    kernel::{self, page_size},
    utils::align,
};

/// A region has no header of its own. It is the run of blocks that share the
/// same first block, which sits at the very start of the mapping:
///
/// ```text
///  region start                                              region end
///  |                                                                  |
///  +-----------------+---------------+------------------+-------------+
///  | Block (owner)   | Block         | Block (free)     | Block       |
///  +-----------------+---------------+------------------+-------------+
///  |<-- capacity --->|<- capacity -->|<--- capacity --->|<- capacity->|
///  |<--------------------------- region extent ---------------------->|
/// ```
///
/// Capacities of the blocks of a region always add up to its extent.
///
/// This function maps a new region big enough for `required` bytes (header
/// included) and appends its only block to the list. If the kernel refuses
/// the mapping, nothing is changed.
pub(crate) fn acquire_region(state: &mut State, required: usize) -> Result<BlockRef, AllocError> {
    let extent = align(required, page_size()).ok_or(AllocError::SizeOverflow)?;

    let base = unsafe { kernel::request_memory(extent) }.ok_or(AllocError::OutOfMemory { requested: extent })?;

    let block = unsafe { BlockRef::init_region(base, state.next_id(), extent, required) };
    state.blocks.push_back(block);

    Ok(block)
}

/// What happened to a region after one of its blocks was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reclaim {
    /// Some other block of the region is still in use.
    Retained,
    /// Every block was free, so the whole region went back to the kernel.
    Unmapped { extent: usize },
    /// Every block was free and the region left the list, but the kernel
    /// refused to take it back. The caller aborts once the lock is released.
    UnmapFailed { extent: usize },
}

/// Marks `block` as free and, if that leaves its region without any block in
/// use, unmaps the region and removes all of its blocks from the list.
///
/// Free blocks are never merged with their free neighbours. Their space can
/// only be reused as a whole by the search, so a region that stays partially
/// used keeps fragmenting until its last block is released.
pub(crate) fn release_block(state: &mut State, block: BlockRef) -> Reclaim {
    block.set_occupied(0);

    let owner = block.region();
    let mut cursor = Some(owner);

    while let Some(current) = cursor {
        if current.region() != owner {
            break;
        }

        if !current.is_free() {
            return Reclaim::Retained;
        }

        cursor = current.next();
    }

    // `cursor` is now the first block after the region's run, if any.
    let extent = owner.region_extent();
    let base = owner.addr();
    state.blocks.unlink_run(owner, cursor);

    if !unsafe { kernel::return_memory(base, extent) } {
        return Reclaim::UnmapFailed { extent };
    }

    Reclaim::Unmapped { extent }
}
