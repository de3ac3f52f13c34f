//! Error types for peinspect.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding a PE image.
///
/// Signature and header-size errors are fatal for the whole dump. The
/// reference errors only ever abort the one decoder that hit them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid DOS signature at offset 0x{0:X}")]
    InvalidDosSignature(usize),

    #[error("invalid PE signature at offset 0x{0:X}")]
    InvalidPeSignature(usize),

    #[error("PE headers too small: expected {expected}, got {actual}")]
    HeadersTooSmall { expected: usize, actual: usize },

    #[error("can't grab {what} at RVA 0x{rva:08x} (size: {len})")]
    Unresolved {
        what: &'static str,
        rva: u32,
        len: u32,
    },

    #[error("truncated {what} at offset 0x{offset:x}")]
    Truncated { what: &'static str, offset: usize },

    #[error("malformed resource tree: {level} entry at offset 0x{offset:x} has the wrong kind")]
    MalformedResource { level: &'static str, offset: u32 },

    #[error("resource directory at offset 0x{offset:x} is referenced more than once")]
    ResourceLoop { offset: u32 },

    #[error("resource tree has more than {limit} entries, stopped walking")]
    ResourceLimit { limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error invalidates the entire image rather than one record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidDosSignature(_) | Self::InvalidPeSignature(_) | Self::HeadersTooSmall { .. }
        )
    }

    pub(crate) fn unresolved(what: &'static str, rva: u32, len: usize) -> Self {
        Self::Unresolved {
            what,
            rva,
            len: len as u32,
        }
    }
}
