//! Where the allocator reads its two knobs from.
//!
//! The search policy and the scribble toggle are plain named string options.
//! They are looked up once per allocation through an [`OptionSource`] and
//! turned into a typed [`Settings`]. Missing or garbled values are not errors:
//! they silently fall back to the defaults.

use std::ffi::{CStr, c_char};

use crate::search::Policy;

/// Name of the option selecting the [`Policy`].
pub const ALGORITHM_OPTION: &CStr = c"ALLOCATOR_ALGORITHM";

/// Name of the option enabling the diagnostic fill of new payloads.
pub const SCRIBBLE_OPTION: &CStr = c"ALLOCATOR_SCRIBBLE";

/// Byte written over every new payload when scribbling is enabled.
pub const SCRIBBLE_BYTE: u8 = 0xAA;

/// Something that can answer "what is the value of option `name`".
///
/// Implementations are called from inside the allocator, so they must not
/// allocate memory.
pub trait OptionSource {
    fn lookup(&self, name: &CStr) -> Option<&str>;
}

/// Reads options from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOptions;

impl OptionSource for EnvOptions {
    fn lookup(&self, name: &CStr) -> Option<&str> {
        // `getenv` hands back a pointer into the environment block, no copy.
        let value: *const c_char = unsafe { libc::getenv(name.as_ptr()) };

        if value.is_null() {
            return None;
        }

        unsafe { CStr::from_ptr(value) }.to_str().ok()
    }
}

/// Options fixed at construction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedOptions {
    pub policy: Policy,
    pub scribble: bool,
}

impl FixedOptions {
    pub const fn new(policy: Policy) -> Self {
        Self { policy, scribble: false }
    }

    pub const fn scribble(mut self, scribble: bool) -> Self {
        self.scribble = scribble;
        self
    }
}

impl OptionSource for FixedOptions {
    fn lookup(&self, name: &CStr) -> Option<&str> {
        if name == ALGORITHM_OPTION {
            Some(self.policy.name())
        } else if name == SCRIBBLE_OPTION {
            Some(if self.scribble { "1" } else { "0" })
        } else {
            None
        }
    }
}

/// Resolved configuration for a single allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    pub policy: Policy,
    pub scribble: bool,
}

impl Settings {
    pub fn resolve<S: OptionSource + ?Sized>(source: &S) -> Self {
        let policy = source
            .lookup(ALGORITHM_OPTION)
            .and_then(Policy::parse)
            .unwrap_or_default();

        let scribble = source
            .lookup(SCRIBBLE_OPTION)
            .is_some_and(|value| matches!(value.trim(), "1" | "true"));

        Self { policy, scribble }
    }
}
