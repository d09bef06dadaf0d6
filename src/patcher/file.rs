//! Patching binaries at rest
//!
//! The whole file is loaded for scanning; writes go straight to disk with seek + write + flush
//! and are mirrored into the loaded copy once the flush succeeds.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{read_scalar, Scalar};
use crate::code::x64::nops;
use crate::error::{Error, Result};
use crate::scan::{self, Image};

/// A game binary opened for in-place patching
#[derive(Debug)]
pub struct FileImage {
    /// Path the file was opened from
    path: PathBuf,
    /// Open read/write handle
    file: File,
    /// Current contents
    data: Vec<u8>,
}

impl FileImage {
    /// Opens `path` for reading and writing and loads its contents.
    ///
    /// Fails with [`Error::FileNotWritable`] when the file is read-only or locked by a running
    /// game, so callers can ask the user to close the game and retry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| open_error(&path, source))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        info!("opened {} ({} bytes)", path.display(), data.len());
        Ok(Self { path, file, data })
    }

    /// Path the image was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scans with a literal byte string and `x`/`?` mask, returning a file offset
    pub fn scan_masked(&self, bytes: &[u8], mask: &str) -> Result<Option<usize>> {
        scan::scan_masked(self, bytes, mask)
    }

    /// Overwrites `bytes.len()` bytes at `offset`. Nothing is written if the range is out of bounds.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if !self.contains(offset, bytes.len()) {
            return Err(Error::OutOfBounds {
                offset,
                len: bytes.len(),
                size: self.data.len(),
            });
        }
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file
            .write_all(bytes)
            .and_then(|_| self.file.flush())
            .map_err(|source| write_error(&self.path, source))?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        debug!("wrote {} bytes at {offset:#x} in {}", bytes.len(), self.path.display());
        Ok(())
    }

    /// Writes a scalar at `offset`
    pub fn write_scalar<T: Scalar>(&mut self, offset: usize, value: T) -> Result<()> {
        self.write_bytes(offset, value.to_bytes().as_ref())
    }

    /// Reads a scalar at `offset` from the loaded contents
    pub fn read_scalar<T: Scalar>(&self, offset: usize) -> Result<T> {
        read_scalar(self, offset)
    }

    /// Fills `len` bytes at `offset` with NOPs
    pub fn nop_fill(&mut self, offset: usize, len: usize) -> Result<()> {
        self.write_bytes(offset, &nops(len))
    }

    /// Syncs file contents to the storage device
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Image for FileImage {
    fn base(&self) -> usize {
        0
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Maps errors from opening a file for writing
fn open_error(path: &Path, source: io::Error) -> Error {
    match source.kind() {
        io::ErrorKind::PermissionDenied => Error::FileNotWritable {
            path: path.to_path_buf(),
            source,
        },
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION: the game is still running
        _ if cfg!(windows) && matches!(source.raw_os_error(), Some(32) | Some(33)) => {
            Error::FileNotWritable {
                path: path.to_path_buf(),
                source,
            }
        }
        _ => Error::Io(source),
    }
}

/// Maps errors from writing to an open file
fn write_error(path: &Path, source: io::Error) -> Error {
    Error::FileNotWritable {
        path: path.to_path_buf(),
        source,
    }
}
