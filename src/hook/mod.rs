//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another.
//!
//! [`midhook::MidHook`] diverts a single instruction into a callback that can read and rewrite
//! the saved [`Registers`]; [`Detours`] keeps at most one such hook per address.

pub mod context;
pub mod manager;
pub mod midhook;

pub use context::Registers;
pub use manager::Detours;
pub use midhook::{MidHook, MidHookGuard};

/// Trait for hooks
///
/// # Safety
///
/// Hooks are inherently unsafe; it is up to the hook to document what it expects from `target`
pub unsafe trait Hook {
    /// Errors that could happen during a hook
    type Error;
    /// Hook guard to allow hooks to be automatically removed when the guard goes out of scope
    type Guard: HookGuard;

    /// Redirects execution at `target` into the hook.
    ///
    /// # Safety
    ///
    /// - `target` must be the first byte of an instruction in mapped, executable memory
    /// - no thread may be executing the bytes being replaced while the hook is written
    unsafe fn hook(&self, target: *const u8) -> Result<Self::Guard, Self::Error>;
}

/// Guard for a currently active hook
///
/// # Safety
///
/// Must ensure that the guard fully unhooks whether dropped or removed via `remove`
pub unsafe trait HookGuard: Sized {
    /// Manually removes the hook rather than letting the guard go out of scope
    fn remove(self) {
        // most guards will implement all functionality in [`Drop::drop`]
    }

    /// Hooked address
    fn address(&self) -> usize;
}
