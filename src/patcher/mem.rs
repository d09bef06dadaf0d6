//! This module contains a patcher which adjusts memory permissions to patch read-only data

use std::fmt;

use region::Protection;
use thiserror::Error;
use tracing::error;

use super::byte::{BytePatchGuard, BytePatcher};
use super::{PatchGuard, Patcher};
use crate::error;

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0:?}")]
    CustomError(E),
}
impl From<()> for PermissionError<()> {
    fn from(e: ()) -> Self {
        Self::CustomError(e)
    }
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target memory, triggering the patch, and then reverting the permissions.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
///
/// The `*mut u8` handed to [`Patcher::patch`] **MUST** be memory not tracked by Rust, or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

/// Converts a const pointer to a mutable pointer to be passed into our [`Patcher::patch`] implementation.
///
/// # Safety
///
/// **THIS FUNCTION DOES NOT CHANGE MEMORY PERMISSIONS.**
///
/// This function should **ONLY** be called in conjunction with our [`Patcher::patch`] implementation, which properly changes the memory permissions.
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
    PermissionError<P::Error>: From<P::Error>,
{
    type Error = PermissionError<P::Error>;
    type Guard<'a> = PermissionWrapperGuard<P::Guard<'a>> where Self: 'a;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        // the previous protection comes back when `_guard` drops
        let _guard =
            region::protect_with_handle(location, patch.len(), Protection::READ_WRITE_EXECUTE)?;
        self.patcher
            .patch(location, patch)
            .map(|g| PermissionWrapperGuard::guard(g, location as usize, patch.len()))
            .map_err(Into::into)
    }
}

/// Byte patch written through a [`PermissionWrapper`]
pub type MemoryPatch = PermissionWrapperGuard<BytePatchGuard>;

/// Writes `bytes` at `target`, lifting write protection for the duration of the write.
///
/// # Safety
///
/// `target` must be mapped for `bytes.len()` bytes, and no other thread may be executing or
/// reading the range while it is written.
pub unsafe fn patch_memory(target: usize, bytes: &[u8]) -> error::Result<MemoryPatch> {
    let wrapper = PermissionWrapper::new(BytePatcher::new());
    let guard = wrapper.patch(target as *mut u8, bytes)?;
    Ok(guard)
}

/// Permission guard for the underlying patch guard
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Underlying patch guard for the wrapped patcher. `Option` so that we can drop it in our [`Drop::drop`] impl
    guard: Option<G>,
    /// Address of the patch
    location: usize,
    /// Length of the patch
    len: usize,
}
impl<G: PatchGuard> PermissionWrapperGuard<G> {
    /// Wrap a patcher's guard. When this guard is dropped, the underlying guard will also be dropped with its target location made writable
    fn guard(guard: G, location: usize, len: usize) -> Self {
        Self {
            guard: Some(guard),
            location,
            len,
        }
    }

    /// Address that was patched
    pub fn location(&self) -> usize {
        self.location
    }

    /// Length of the patch
    pub fn len(&self) -> usize {
        self.len
    }
}
impl<G: PatchGuard> fmt::Debug for PermissionWrapperGuard<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionWrapperGuard")
            .field("location", &format_args!("{:#x}", self.location))
            .field("len", &self.len)
            .field("armed", &self.guard.is_some())
            .finish()
    }
}

unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {
    fn persist(mut self) {
        if let Some(guard) = self.guard.take() {
            guard.persist();
        }
    }

    fn original(&self) -> &[u8] {
        match &self.guard {
            Some(guard) => guard.original(),
            None => &[],
        }
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let handle = unsafe {
            region::protect_with_handle(
                self.location as *const u8,
                self.len,
                Protection::READ_WRITE_EXECUTE,
            )
        };
        match handle {
            Ok(_handle) => guard.restore(),
            Err(e) => {
                // restoring without write access would fault, so the patch stays
                error!("unable to restore patch at {:#x}: {e}", self.location);
                guard.persist();
            }
        }
    }
}
