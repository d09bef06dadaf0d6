//! # Detours
//!
//! Keeps track of the mid-hooks a fixer installed, at most one per address.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::context::Registers;
use super::midhook::{MidHook, MidHookGuard};
use super::HookGuard;
use crate::error::Result;

/// Owner of every installed hook
///
/// Installing at an address that is already hooked replaces the old hook: it is removed
/// first, so trampolines never chain and the bytes restored on removal are always the ones
/// from before the first install.
#[derive(Default)]
pub struct Detours {
    /// Installed hooks by site address
    hooks: Mutex<HashMap<usize, MidHookGuard>>,
}

impl Detours {
    /// Creates an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the hook table
    fn hooks(&self) -> MutexGuard<'_, HashMap<usize, MidHookGuard>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hooks `address` with `callback`, replacing any hook already there.
    ///
    /// On failure the address is left unhooked, even if it was hooked before.
    ///
    /// # Safety
    ///
    /// See [`MidHook::install`]. When replacing, no thread may be executing the old trampoline.
    pub unsafe fn install<F>(&self, address: usize, callback: F) -> Result<()>
    where
        F: Fn(&mut Registers) + Send + Sync + 'static,
    {
        let mut hooks = self.hooks();
        if let Some(previous) = hooks.remove(&address) {
            debug!("replacing hook at {address:#x}");
            previous.remove();
        }
        let guard = MidHook::install(address, callback)?;
        hooks.insert(address, guard);
        info!("hook installed at {address:#x}");
        Ok(())
    }

    /// Removes the hook at `address`, returning whether there was one
    pub fn remove(&self, address: usize) -> bool {
        let removed = self.hooks().remove(&address);
        match removed {
            Some(guard) => {
                guard.remove();
                info!("hook removed from {address:#x}");
                true
            }
            None => false,
        }
    }

    /// Whether `address` is currently hooked
    pub fn is_hooked(&self, address: usize) -> bool {
        self.hooks().contains_key(&address)
    }

    /// Number of installed hooks
    pub fn len(&self) -> usize {
        self.hooks().len()
    }

    /// Whether no hooks are installed
    pub fn is_empty(&self) -> bool {
        self.hooks().is_empty()
    }

    /// Removes every hook
    pub fn clear(&self) {
        let removed: Vec<_> = self.hooks().drain().map(|(_, guard)| guard).collect();
        if !removed.is_empty() {
            info!("removing {} hooks", removed.len());
        }
        removed.into_iter().for_each(HookGuard::remove);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::alloc::{allocate_executable, ExecutableMemory};

    /// `mov eax, 42; nop x5; ret` in executable memory
    fn return_42() -> ExecutableMemory {
        let code = [0xB8, 0x2A, 0, 0, 0, 0x90, 0x90, 0x90, 0x90, 0x90, 0xC3];
        let origin = return_42 as fn() -> ExecutableMemory as usize;
        let mut memory = allocate_executable(origin, 32).unwrap();
        memory.fill(0xCC);
        memory[..code.len()].copy_from_slice(&code);
        memory
    }

    /// Calls the generated code
    fn call(memory: &ExecutableMemory) -> u32 {
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(memory.as_ptr()) };
        f()
    }

    #[test]
    /// Installing twice at one address leaves only the second callback active
    fn test_install_replaces() {
        let code = return_42();
        let site = code.address() + 5;
        let original = code[..11].to_vec();
        let detours = Detours::new();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        unsafe {
            let hits = first.clone();
            detours
                .install(site, move |registers| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    registers.rax = 1;
                })
                .unwrap();

            let hits = second.clone();
            detours
                .install(site, move |registers| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    registers.rax = 2;
                })
                .unwrap();
        }
        assert_eq!(detours.len(), 1);

        assert_eq!(call(&code), 2);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        // removal restores the bytes from before the first install
        assert!(detours.remove(site));
        assert!(!detours.is_hooked(site));
        assert_eq!(code[..11], original);
        assert_eq!(call(&code), 42);

        // nothing left to remove
        assert!(!detours.remove(site));
    }

    #[test]
    fn test_clear() {
        let a = return_42();
        let b = return_42();
        let detours = Detours::new();

        unsafe {
            detours.install(a.address(), |_| {}).unwrap();
            detours.install(b.address() + 5, |r| r.rax = 7).unwrap();
        }
        assert!(detours.is_hooked(a.address()));
        assert!(detours.is_hooked(b.address() + 5));
        assert_eq!(call(&b), 7);

        detours.clear();
        assert!(detours.is_empty());
        assert_eq!(call(&a), 42);
        assert_eq!(call(&b), 42);
    }

    #[test]
    /// A failed install leaves the table unchanged
    fn test_failed_install() {
        let detours = Detours::new();
        assert!(unsafe { detours.install(0x10, |_| {}) }.is_err());
        assert!(!detours.is_hooked(0x10));
        assert!(detours.is_empty());
    }
}
