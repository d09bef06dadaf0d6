//! # Error
//!
//! Crate-wide error type. Lower layers keep their own small error enums and convert into
//! [`Error`] where they meet the public API.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::alloc::proximity::ProximityError;
use crate::patcher::mem::PermissionError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while locating and patching a target
#[derive(Debug, Error)]
pub enum Error {
    /// A signature had no match in the image. Fixers skip the affected sub-fix.
    #[error("pattern `{name}` not found")]
    PatternNotFound {
        /// Name of the signature that was searched for
        name: String,
    },
    /// A signature that must be unique matched more than once
    #[error("pattern `{name}` matched {count} locations, expected exactly one")]
    AmbiguousPattern {
        /// Name of the signature that was searched for
        name: String,
        /// Number of matches found
        count: usize,
    },
    /// Pattern text or mask could not be parsed
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    /// The address is not mapped, lies outside the image, or does not hold decodable code
    #[error("patch target {address:#x} is invalid")]
    PatchTargetInvalid {
        /// Offending address
        address: usize,
    },
    /// A write would run past the end of the image
    #[error("write of {len} bytes at {offset:#x} is out of bounds (image size {size:#x})")]
    OutOfBounds {
        /// Offset or address of the write
        offset: usize,
        /// Length of the write
        len: usize,
        /// Size of the image
        size: usize,
    },
    /// The OS refused to change memory protection
    #[error("memory protection change denied: {0}")]
    MemoryProtectionDenied(#[source] region::Error),
    /// The file was opened read-only or is locked by another process
    #[error("{} is not writable: {source}", path.display())]
    FileNotWritable {
        /// File that could not be written
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The module has not been loaded (yet)
    #[error("module `{0}` is not loaded")]
    ModuleNotLoaded(String),
    /// No executable memory could be found close enough to the hook site
    #[error("unable to allocate trampoline: {0}")]
    TrampolineAlloc(String),
    /// Displaced instructions could not be re-encoded in the trampoline
    #[error("unable to relocate instructions: {0}")]
    Relocation(#[from] iced_x86::IcedError),
    /// Configuration file syntax error
    #[error("config line {line}: {message}")]
    Config {
        /// One-based line number
        line: usize,
        /// What was wrong with it
        message: String,
    },
    /// Any other IO failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error only means a signature was absent from this build of the game
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PatternNotFound { .. })
    }
}

impl From<PermissionError<()>> for Error {
    fn from(e: PermissionError<()>) -> Self {
        match e {
            PermissionError::ProtectionError(e) => Error::MemoryProtectionDenied(e),
            // `BytePatcher` never fails
            PermissionError::CustomError(()) => {
                Error::MemoryProtectionDenied(region::Error::InvalidParameter("patch"))
            }
        }
    }
}

impl From<ProximityError> for Error {
    fn from(e: ProximityError) -> Self {
        Error::TrampolineAlloc(e.to_string())
    }
}
