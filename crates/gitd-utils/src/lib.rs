//! Foundation utilities shared by the gitd pipeline crates.

pub mod cancel;
pub mod progress;
pub mod tempfile;

// Re-export core byte-string types at crate root for convenience
pub use bstr::{BStr, BString, ByteSlice, ByteVec};

/// Errors from utility operations.
#[derive(Debug, thiserror::Error)]
pub enum UtilError {
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UtilError>;
