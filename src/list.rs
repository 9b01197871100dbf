use crate::block::{BlockRef, Link};

/// Singly linked list of every block the allocator knows about, in arrival
/// order.
///
/// Blocks are never allocated by the list itself: because we are the actual
/// memory allocator, each node is the header already written at the start of
/// its block, and the list only rewires `next` links.
///
/// ```text
///   head
///    |
/// +--|---------------------------------------+      +----------------------------+
/// | +-----------+    +-----------+    +-----+ |      | +-----------+    +-------+ |
/// | | Block (R1)| -> | Block (R1)| -> | ... |-|----> | | Block (R2)| -> | Block | |
/// | +-----------+    +-----------+    +-----+ |      | +-----------+    +-------+ |
/// +-------------------------------------------+      +----------------------------+
///                 Region 1                                    Region 2
/// ```
///
/// A split always inserts the new block right after the block it came from,
/// so the blocks of one region form a contiguous run that starts with the
/// region's first block.
pub(crate) struct BlockList {
    head: Link,
}

pub(crate) struct Iter {
    current: Link,
}

impl BlockList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    #[inline]
    pub fn first(&self) -> Link {
        self.head
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Appends `block` at the tail. Walks the whole list to find it.
    pub fn push_back(&mut self, block: BlockRef) {
        block.set_next(None);

        match self.iter().last() {
            Some(tail) => tail.set_next(Some(block)),
            None => self.head = Some(block),
        }
    }

    /// Links `block` right after `anchor`.
    pub fn insert_after(&mut self, anchor: BlockRef, block: BlockRef) {
        block.set_next(anchor.next());
        anchor.set_next(Some(block));
    }

    /// Removes the run of blocks starting at `first` and ending right before
    /// `rest`. The block preceding `first` (or the head) now points at `rest`.
    pub fn unlink_run(&mut self, first: BlockRef, rest: Link) {
        if self.head == Some(first) {
            self.head = rest;
            return;
        }

        if let Some(prev) = self.iter().find(|block| block.next() == Some(first)) {
            prev.set_next(rest);
        }
    }

    pub fn iter(&self) -> Iter {
        Iter { current: self.first() }
    }
}

impl Iterator for Iter {
    type Item = BlockRef;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;
        self.current = block.next();

        Some(block)
    }
}

impl<'a> IntoIterator for &'a BlockList {
    type Item = BlockRef;
    type IntoIter = Iter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
