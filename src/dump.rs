//! Human readable report of the heap layout.
//!
//! ```text
//! -- Current Memory State --
//! [REGION] 0x7f5e2c6f0000-0x7f5e2c6f1000 4096
//! [BLOCK] 0x7f5e2c6f0000-0x7f5e2c6f0248 (0) 'ALLOCATION 0' 584 584 504
//! [BLOCK] 0x7f5e2c6f0248-0x7f5e2c6f1000 (1) 'ALLOCATION 1' 3512 1080 1000
//! ```
//!
//! Block lines read: address range, id, label, capacity, occupied bytes and
//! payload bytes (occupied minus the header, zero when the block is free).
//!
//! Rendering never allocates, so it is safe to dump from inside the allocator.

use std::fmt;

use crate::{block::BlockRef, list::BlockList};

/// Snapshot of one block, as seen by [`crate::Heap::for_each_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo<'a> {
    pub start: usize,
    pub end: usize,
    pub id: u64,
    pub label: &'a str,
    pub capacity: usize,
    pub occupied: usize,
    pub payload: usize,
    pub region_start: usize,
    pub region_extent: usize,
}

impl<'a> BlockInfo<'a> {
    pub(crate) fn of(block: &'a BlockRef) -> Self {
        let start = block.addr().as_ptr() as usize;

        Self {
            start,
            end: start + block.capacity(),
            id: block.id(),
            label: block.label(),
            capacity: block.capacity(),
            occupied: block.occupied(),
            payload: block.payload_len(),
            region_start: block.region().addr().as_ptr() as usize,
            region_extent: block.region_extent(),
        }
    }

    /// Address the block's payload starts at.
    pub fn payload_addr(&self) -> usize {
        self.start + crate::block::HEADER_SIZE
    }

    pub fn is_free(&self) -> bool {
        self.occupied == 0
    }

    /// Whether this block is the first one of its region.
    pub fn starts_region(&self) -> bool {
        self.start == self.region_start
    }
}

impl fmt::Display for BlockInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[BLOCK] {:#x}-{:#x} ({}) '{}' {} {} {}",
            self.start, self.end, self.id, self.label, self.capacity, self.occupied, self.payload
        )
    }
}

pub(crate) fn render(blocks: &BlockList, sink: &mut dyn fmt::Write) -> fmt::Result {
    sink.write_str("-- Current Memory State --\n")?;

    let mut region = None;

    for block in blocks {
        let info = BlockInfo::of(&block);

        if region != Some(info.region_start) {
            region = Some(info.region_start);
            writeln!(
                sink,
                "[REGION] {:#x}-{:#x} {}",
                info.region_start,
                info.region_start + info.region_extent,
                info.region_extent
            )?;
        }

        writeln!(sink, "{info}")?;
    }

    Ok(())
}

/// Writes straight to a file descriptor, without buffering or allocating.
#[cfg(unix)]
pub struct FdSink(pub libc::c_int);

#[cfg(unix)]
impl FdSink {
    pub fn stdout() -> Self {
        Self(libc::STDOUT_FILENO)
    }
}

#[cfg(unix)]
impl fmt::Write for FdSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();

        while !bytes.is_empty() {
            let written = unsafe { libc::write(self.0, bytes.as_ptr().cast(), bytes.len()) };

            if written < 0 {
                if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(fmt::Error);
            }

            bytes = &bytes[written as usize..];
        }

        Ok(())
    }
}

/// Adapts a [`std::io::Write`] stream to the dump. Only suitable when the
/// stream does not allocate from the heap being dumped.
pub struct IoSink<W>(pub W);

impl<W: std::io::Write> fmt::Write for IoSink<W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}
