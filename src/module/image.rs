//! A module mapped into the current process

use std::slice;

use tracing::debug;

use crate::code::x64::nops;
use crate::error::{Error, Result};
use crate::patcher::mem::{patch_memory, MemoryPatch};
use crate::patcher::{read_scalar, Scalar};
use crate::scan::Image;

/// Readable memory of a loaded module
///
/// Writes go through [`patch_memory`], so they work on read-only code pages. Each returns a
/// [`MemoryPatch`] guard: drop it to undo the write or call
/// [`PatchGuard::persist`](crate::patcher::PatchGuard::persist) to keep it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    /// Module file name
    name: String,
    /// Load address
    base: usize,
    /// Length of the readable image
    size: usize,
}

impl ModuleImage {
    /// Describes `size` bytes of mapped memory at `base`.
    ///
    /// # Safety
    ///
    /// `[base, base + size)` must stay mapped and readable for as long as the image is used
    pub unsafe fn from_raw_parts(name: impl Into<String>, base: usize, size: usize) -> Self {
        Self {
            name: name.into(),
            base,
            size,
        }
    }

    /// Module file name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fails unless `[target, target + len)` lies inside the image
    fn check_bounds(&self, target: usize, len: usize) -> Result<()> {
        if self.contains(target, len) {
            Ok(())
        } else {
            Err(Error::OutOfBounds {
                offset: target,
                len,
                size: self.size,
            })
        }
    }

    /// Overwrites `bytes.len()` bytes at `target`. Nothing is written if the range leaves the image.
    ///
    /// # Safety
    ///
    /// No other thread may execute or read the range while it is written
    pub unsafe fn write_bytes(&self, target: usize, bytes: &[u8]) -> Result<MemoryPatch> {
        self.check_bounds(target, bytes.len())?;
        let patch = patch_memory(target, bytes)?;
        debug!("patched {} bytes at {}+{:#x}", bytes.len(), self.name, target - self.base);
        Ok(patch)
    }

    /// Writes a scalar at `target`
    ///
    /// # Safety
    ///
    /// See [`ModuleImage::write_bytes`]
    pub unsafe fn write_scalar<T: Scalar>(&self, target: usize, value: T) -> Result<MemoryPatch> {
        self.write_bytes(target, value.to_bytes().as_ref())
    }

    /// Reads a scalar at `target`
    pub fn read_scalar<T: Scalar>(&self, target: usize) -> Result<T> {
        read_scalar(self, target)
    }

    /// Replaces `len` bytes at `target` with NOPs
    ///
    /// # Safety
    ///
    /// See [`ModuleImage::write_bytes`]. `len` should cover whole instructions.
    pub unsafe fn nop_fill(&self, target: usize, len: usize) -> Result<MemoryPatch> {
        self.write_bytes(target, &nops(len))
    }
}

impl Image for ModuleImage {
    fn base(&self) -> usize {
        self.base
    }

    fn bytes(&self) -> &[u8] {
        // Safety: guaranteed by the caller of `from_raw_parts`
        unsafe { slice::from_raw_parts(self.base as *const u8, self.size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patcher::PatchGuard;
    use crate::scan::{scan, Pattern};

    #[test]
    /// A float patch is unaffected by a NOP fill of a disjoint range
    fn test_scalar_and_nops() {
        let mut data = vec![0xCCu8; 32];
        let image = unsafe { ModuleImage::from_raw_parts("game.exe", data.as_mut_ptr() as usize, 32) };
        let base = image.base();

        let aspect = unsafe { image.write_scalar(base + 4, 1.3333f32) }.unwrap();
        let nops = unsafe { image.nop_fill(base + 12, 3) }.unwrap();

        assert_eq!(
            image.read_scalar::<f32>(base + 4).unwrap().to_bits(),
            1.3333f32.to_bits()
        );
        assert_eq!(image.bytes()[12..15], [0x90; 3]);
        assert_eq!(image.bytes()[15], 0xCC);

        aspect.persist();
        drop(nops);
        assert_eq!(image.bytes()[12..15], [0xCC; 3]);
        assert_eq!(image.read_scalar::<f32>(base + 4).unwrap(), 1.3333);
        drop(image);
        assert_eq!(data[4..8], 1.3333f32.to_le_bytes());
    }

    #[test]
    fn test_out_of_bounds() {
        let mut data = vec![0u8; 8];
        let image = unsafe { ModuleImage::from_raw_parts("game.exe", data.as_mut_ptr() as usize, 8) };
        let base = image.base();

        let err = unsafe { image.write_scalar(base + 6, 0u32) }.unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { len: 4, size: 8, .. }));
        assert!(unsafe { image.write_bytes(base - 1, &[0]) }.is_err());
        assert!(image.read_scalar::<u64>(base + 1).is_err());
        drop(image);
        assert_eq!(data, [0u8; 8]);
    }

    #[test]
    /// Matches are absolute addresses
    fn test_scan_module() {
        let data = [0x00u8, 0x11, 0x48, 0x8B, 0x05, 0x22];
        let image = unsafe { ModuleImage::from_raw_parts("game.exe", data.as_ptr() as usize, data.len()) };
        let pattern = Pattern::from_ida("48 8B ?? 22").unwrap();
        assert_eq!(scan(&image, &pattern), Some(data.as_ptr() as usize + 2));
    }
}
