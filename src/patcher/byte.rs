//! This module contains a byte patcher

use std::ptr;

use super::{PatchGuard, Patcher};

/// Patcher for patching memory locations with byte arrays.
/// This patcher never fails.
#[derive(Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = ();
    type Guard<'a> = BytePatchGuard;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        Ok(BytePatchGuard::patch(location, patch))
    }
}
/// Guard for byte-patches
///
/// See [`BytePatcher`].
pub struct BytePatchGuard {
    /// Original data from `location`
    original: Vec<u8>,
    /// Address of the patch
    location: usize,
    /// Cleared by [`PatchGuard::persist`]
    armed: bool,
}
impl BytePatchGuard {
    /// Patches a location, returning a guard for unpatching
    ///
    /// # Safety
    ///
    /// `location` must be valid for reads and writes of `patch.len()` bytes
    unsafe fn patch(location: *mut u8, patch: &[u8]) -> Self {
        let mut original = vec![0u8; patch.len()];

        // Safety: caller must pass in a `location` pointer that is valid for the full length of the patch
        ptr::copy(location, original.as_mut_ptr(), patch.len());

        let guard = Self {
            original,
            location: location as usize,
            armed: true,
        };

        // Safety: caller must ensure that `location` is writable
        ptr::copy(patch.as_ptr(), location, patch.len());

        guard
    }

    /// Address that was patched
    pub fn location(&self) -> usize {
        self.location
    }
}
unsafe impl PatchGuard for BytePatchGuard {
    fn persist(mut self) {
        self.armed = false;
    }

    fn original(&self) -> &[u8] {
        &self.original
    }
}
impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Safety: creator must pass in a `location` pointer that is valid and writable for the full length of the patch
        unsafe {
            ptr::copy(
                self.original.as_ptr(),
                self.location as *mut u8,
                self.original.len(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::patcher::byte::BytePatcher;
    use crate::patcher::{PatchGuard, Patcher};

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let mut data = vec![1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        // get our patcher to test
        let patcher = BytePatcher::new();

        // patch the vec's data
        let patch = unsafe { patcher.patch(ptr, &[4, 3, 2, 1]).unwrap() };

        // the guard remembers what it overwrote
        assert_eq!(patch.original(), [1, 2, 3, 4]);

        // make sure the data was actually changed
        assert_eq!(unsafe { std::slice::from_raw_parts(ptr, 4) }, [4, 3, 2, 1]);

        // restore the patch
        patch.restore();

        // make sure the patch was restored
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests a partial patch of a block to ensure we're not overwriting outside the patch area
    fn test_partial_patch() {
        let mut data = vec![1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patcher = BytePatcher::new();

        // patch the middle of the vec
        let patch = unsafe { patcher.patch(ptr.add(1), &[5, 5]).unwrap() };

        // make sure only the middle changed
        assert_eq!(unsafe { std::slice::from_raw_parts(ptr, 4) }, [1, 5, 5, 4]);

        // restore the patch
        drop(patch);

        // make sure the patch was restored
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// A persisted patch survives its guard
    fn test_persist() {
        let mut data = vec![0u8; 4];
        let ptr = data.as_mut_ptr();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr, &[0xAB, 0xCD]).unwrap() };
        patch.persist();

        assert_eq!(data, [0xAB, 0xCD, 0, 0]);
    }
}
