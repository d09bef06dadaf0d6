//! # Patch
//!
//! This module covers patchers, which are used to overwrite and restore locations in memory.
//!
//! A patcher writes bytes and hands back a guard. Dropping the guard puts the original bytes back;
//! [`PatchGuard::persist`] keeps the patch for the life of the process instead.
//! Files on disk are patched through [`file::FileImage`], which has no guard because a flushed
//! write is final.

pub mod byte;
pub mod file;
pub mod mem;

use crate::error::{self, Error};
use crate::scan::Image;

/// All patchers save state from where they patched and are able to revert on-command
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch` works correctly and is properly documented for avoiding undefined behavior
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use `()`.
    type Error;
    /// Guard type for the patcher. When this guard is dropped, the location should be restored.
    type Guard<'a>: PatchGuard + 'a
    where
        Self: 'a;

    /// Patches a given location.
    ///
    /// # Safety
    ///
    /// This function is intended to be used on arbitrary memory addresses, but must be valid for the supplied patcher
    unsafe fn patch<'a>(
        &'a self,
        target: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error>;
}

/// Guard for a patch
///
/// # Safety
///
/// Guard must fully unpatch the location when dropped, even if `restore` is not called,
/// unless `persist` was called
pub unsafe trait PatchGuard: Sized {
    /// Restores the original value of a patch
    fn restore(self) {
        // most implementations have their functionality in their [`Drop::drop`] implementation
    }

    /// Keeps the patch in place; the original bytes are never written back
    fn persist(self);

    /// Bytes that were at the location before the patch
    fn original(&self) -> &[u8];
}

/// Fixed-width values that can be written into an image
///
/// Encoding is little-endian, so floats round-trip bit-for-bit.
pub trait Scalar: Copy {
    /// Byte representation
    type Bytes: AsRef<[u8]> + AsMut<[u8]> + Default;

    /// Encodes the value
    fn to_bytes(self) -> Self::Bytes;
    /// Decodes the value
    fn from_bytes(bytes: Self::Bytes) -> Self;

    /// Width in bytes
    fn size() -> usize {
        Self::Bytes::default().as_ref().len()
    }
}

/// Implements [`Scalar`] for primitive numbers
macro_rules! impl_scalar {
    ($($ty:ty),*) => {$(
        impl Scalar for $ty {
            type Bytes = [u8; std::mem::size_of::<$ty>()];

            fn to_bytes(self) -> Self::Bytes {
                self.to_le_bytes()
            }

            fn from_bytes(bytes: Self::Bytes) -> Self {
                <$ty>::from_le_bytes(bytes)
            }
        }
    )*};
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Reads a scalar from any image at an absolute address
pub fn read_scalar<I: Image + ?Sized, T: Scalar>(image: &I, address: usize) -> error::Result<T> {
    let len = T::size();
    if !image.contains(address, len) {
        return Err(Error::OutOfBounds {
            offset: address,
            len,
            size: image.size(),
        });
    }
    let start = address - image.base();
    let mut bytes = T::Bytes::default();
    bytes
        .as_mut()
        .copy_from_slice(&image.bytes()[start..start + len]);
    Ok(T::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::{read_scalar, Scalar};
    use crate::error::Error;

    #[test]
    /// Check widths and bit-exact float encoding
    fn test_scalar() {
        assert_eq!(<u16 as Scalar>::size(), 2);
        assert_eq!(<f32 as Scalar>::size(), 4);
        assert_eq!(<f64 as Scalar>::size(), 8);

        let value = 1.3333f32;
        assert_eq!(value.to_bytes(), value.to_bits().to_le_bytes());
        assert_eq!(f32::from_bytes(value.to_bytes()).to_bits(), value.to_bits());

        assert_eq!(1920i32.to_bytes(), [0x80, 0x07, 0x00, 0x00]);
    }

    #[test]
    fn test_read_scalar() {
        let data = vec![0x00, 0x80, 0x07, 0x00, 0x00, 0xFF];
        assert_eq!(read_scalar::<_, i32>(&data, 1).unwrap(), 1920);
        assert_eq!(read_scalar::<_, u8>(&data, 5).unwrap(), 0xFF);

        let err = read_scalar::<_, u32>(&data, 3).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { offset: 3, len: 4, size: 6 }));
    }
}
