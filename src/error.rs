use std::{error::Error, fmt};

/// Why an allocation could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The kernel refused to map a new region of `requested` bytes.
    OutOfMemory { requested: usize },
    /// The requested size (plus header and rounding) does not fit in a `usize`.
    SizeOverflow,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: could not map a region of {requested} bytes")
            }
            Self::SizeOverflow => f.write_str("requested allocation size overflows"),
        }
    }
}

impl Error for AllocError {}
