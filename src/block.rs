use std::{fmt, mem, ptr::NonNull};

use crate::utils::ALIGNMENT;

/// Bytes reserved for a block label, including the terminating NUL so the
/// field stays readable from C.
pub const LABEL_CAPACITY: usize = 32;

/// Header size of a block. Payload pointers are always exactly this many
/// bytes past the start of their block.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);

/// This is the structure of a block header. The fields are the block's
/// metadata and the content is placed right after it.
///
/// ```text
/// +---------------------+ <------+
/// |         id          |        |
/// +---------------------+        |
/// |      capacity       |        |
/// +---------------------+        |
/// |      occupied       |        |
/// +---------------------+        |
/// |       region        |        | -> Header
/// +---------------------+        |
/// |    region_extent    |        |
/// +---------------------+        |
/// |        next         |        |
/// +---------------------+        |
/// |     label (32b)     |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        | -> Addressable content
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
///
/// `capacity` covers header and content up to the start of the next block of
/// the same region. `occupied` is header plus the payload actually in use, or
/// zero when the block is free.
#[repr(C, align(8))]
pub(crate) struct Header {
    id: u64,
    capacity: usize,
    occupied: usize,
    /// First block of the region this block lives in.
    region: NonNull<Header>,
    region_extent: usize,
    /// Next block in arrival order.
    next: Option<NonNull<Header>>,
    label: [u8; LABEL_CAPACITY],
}

/// Non-null pointer to a block header.
pub(crate) type Link = Option<BlockRef>;

/// Handle to a block header living inside a mapped region.
///
/// All the raw pointer arithmetic of the allocator lives in this type. A
/// `BlockRef` can only be obtained through its unsafe constructors, whose
/// callers guarantee the header is initialized and stays mapped while the
/// handle is used. Every other module works through the accessors below,
/// always with the heap lock held.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRef(NonNull<Header>);

impl BlockRef {
    /// Writes the header of the first block of a fresh region at `base` and
    /// returns it. The block owns itself as region and spans `extent` bytes.
    ///
    /// **SAFETY**: `base` must be the start of a writable mapping of `extent`
    /// bytes, aligned to [`ALIGNMENT`], with `occupied <= extent`.
    pub unsafe fn init_region(base: NonNull<u8>, id: u64, extent: usize, occupied: usize) -> Self {
        let header = base.cast::<Header>();

        unsafe {
            header.as_ptr().write(Header {
                id,
                capacity: extent,
                occupied,
                region: header,
                region_extent: extent,
                next: None,
                label: [0; LABEL_CAPACITY],
            });
        }

        Self(header)
    }

    /// Carves a new block out of the unused tail of this one. The new header
    /// is written right after this block's occupied bytes, takes over the
    /// whole unused span as its capacity and joins the same region. This block
    /// shrinks to its occupied size. The caller links the result into the list.
    ///
    /// **SAFETY**: this block must be occupied and its unused span must be at
    /// least `occupied` bytes, which in turn must be at least [`HEADER_SIZE`].
    pub unsafe fn split(self, id: u64, occupied: usize) -> Self {
        let offset = self.occupied();
        let span = self.free_span();
        debug_assert!(offset != 0 && span >= occupied && occupied >= HEADER_SIZE);

        let header = unsafe { self.0.cast::<u8>().add(offset).cast::<Header>() };

        unsafe {
            header.as_ptr().write(Header {
                id,
                capacity: span,
                occupied,
                region: self.header().region,
                region_extent: self.region_extent(),
                next: None,
                label: [0; LABEL_CAPACITY],
            });
        }

        self.header_mut().capacity = offset;

        Self(header)
    }

    /// Recovers the block that owns the payload at `payload`.
    ///
    /// **SAFETY**: `payload` must have been returned by this allocator and the
    /// block must not have been released yet.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        unsafe { Self(payload.sub(HEADER_SIZE).cast()) }
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { self.0.as_ref() }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut Header {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// Pointer handed out to the user.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        unsafe { self.0.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Start address of the block.
    #[inline]
    pub fn addr(self) -> NonNull<u8> {
        self.0.cast()
    }

    #[inline]
    pub fn id(self) -> u64 {
        self.header().id
    }

    #[inline]
    pub fn set_id(self, id: u64) {
        self.header_mut().id = id;
    }

    #[inline]
    pub fn capacity(self) -> usize {
        self.header().capacity
    }

    #[inline]
    pub fn occupied(self) -> usize {
        self.header().occupied
    }

    #[inline]
    pub fn set_occupied(self, occupied: usize) {
        debug_assert!(occupied <= self.capacity() && occupied % ALIGNMENT == 0);
        self.header_mut().occupied = occupied;
    }

    #[inline]
    pub fn is_free(self) -> bool {
        self.occupied() == 0
    }

    /// Bytes at the end of the block nobody is using.
    #[inline]
    pub fn free_span(self) -> usize {
        self.capacity() - self.occupied()
    }

    /// Bytes of user content, zero for a free block.
    #[inline]
    pub fn payload_len(self) -> usize {
        self.occupied().saturating_sub(HEADER_SIZE)
    }

    /// First block of the region this block lives in.
    #[inline]
    pub fn region(self) -> BlockRef {
        Self(self.header().region)
    }

    #[inline]
    pub fn region_extent(self) -> usize {
        self.header().region_extent
    }

    #[inline]
    pub fn next(self) -> Link {
        self.header().next.map(Self)
    }

    #[inline]
    pub fn set_next(self, next: Link) {
        self.header_mut().next = next.map(|block| block.0);
    }

    /// The block label, up to the first NUL byte.
    pub fn label(&self) -> &str {
        let label = &self.header().label;
        let len = label.iter().position(|&b| b == 0).unwrap_or(LABEL_CAPACITY);

        std::str::from_utf8(&label[..len]).unwrap_or("")
    }

    /// Stores `label`, truncated on a character boundary to fit the field.
    pub fn set_label(self, label: &str) {
        let mut writer = LabelWriter::new(&mut self.header_mut().label);
        let _ = fmt::Write::write_str(&mut writer, label);
    }

    /// Like [`BlockRef::set_label`] for bytes that may not be UTF-8. Invalid
    /// sequences become U+FFFD.
    pub fn set_label_lossy(self, label: &[u8]) {
        let mut writer = LabelWriter::new(&mut self.header_mut().label);

        for chunk in label.utf8_chunks() {
            if fmt::Write::write_str(&mut writer, chunk.valid()).is_err() {
                return;
            }
            if !chunk.invalid().is_empty()
                && fmt::Write::write_char(&mut writer, char::REPLACEMENT_CHARACTER).is_err()
            {
                return;
            }
        }
    }

    /// Stores the label used when the caller gives none: `ALOCATOR <id>`.
    pub fn set_default_label(self) {
        let id = self.id();
        let mut writer = LabelWriter::new(&mut self.header_mut().label);
        let _ = fmt::Write::write_fmt(&mut writer, format_args!("ALOCATOR {id}"));
    }

    pub fn write_label(self, label: Label<'_>) {
        match label {
            Label::Default => self.set_default_label(),
            Label::Text(text) => self.set_label(text),
            Label::Bytes(bytes) => self.set_label_lossy(bytes),
        }
    }
}

/// What goes into a block's label field.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Label<'a> {
    /// `ALOCATOR <id>`.
    Default,
    Text(&'a str),
    /// Raw bytes from C, stored lossily.
    Bytes(&'a [u8]),
}

/// Formats into a fixed label field without allocating. Anything past the
/// field's capacity is dropped and the field is always NUL terminated.
struct LabelWriter<'a> {
    buf: &'a mut [u8; LABEL_CAPACITY],
    len: usize,
}

impl<'a> LabelWriter<'a> {
    fn new(buf: &'a mut [u8; LABEL_CAPACITY]) -> Self {
        buf.fill(0);
        Self { buf, len: 0 }
    }
}

impl fmt::Write for LabelWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Last byte is reserved for the NUL.
        let room = LABEL_CAPACITY - 1 - self.len;
        let mut take = s.len().min(room);

        while !s.is_char_boundary(take) {
            take -= 1;
        }

        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;

        if take < s.len() { Err(fmt::Error) } else { Ok(()) }
    }
}
