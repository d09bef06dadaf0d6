//! # Mid Hook
//!
//! Diverts execution at an arbitrary instruction into a Rust callback.
//!
//! The hook site is overwritten with a jump into a trampoline allocated within jump range. The
//! trampoline saves every register, calls the callback with the saved [`Registers`], restores
//! them (including any changes the callback made), runs the instructions that were displaced by
//! the jump and jumps back to the first untouched instruction.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use region::Protection;
use tracing::{debug, error};

use super::context::Registers;
use super::{Hook, HookGuard};
use crate::alloc::{allocate_executable, ExecutableMemory};
use crate::code::x64::{self, JMP_ABS_LEN, MAX_INSTRUCTION_LEN, NOP};
use crate::error::{Error, Result};
use crate::patcher::mem::{patch_memory, MemoryPatch};
use crate::patcher::PatchGuard;

/// Bytes reserved for each trampoline
const TRAMPOLINE_SIZE: usize = 512;

/// Callback run when a hook fires
pub type Callback = dyn Fn(&mut Registers) + Send + Sync;

/// Signature of the function the trampoline calls
type Dispatcher = unsafe extern "C" fn(*mut Registers, *const HookSlot);

/// Data the trampoline hands to [`dispatch`]. Lives on the heap so its address is stable.
struct HookSlot {
    /// Hooked address, for logging
    address: usize,
    /// User callback
    callback: Arc<Callback>,
}

/// Entered from the trampoline with rsp pointing at the saved registers
unsafe extern "C" fn dispatch(registers: *mut Registers, slot: *const HookSlot) {
    let slot = &*slot;
    let registers = &mut *registers;

    // unwinding into game code is undefined, so panics stop here
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (slot.callback)(registers))) {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic");
        error!("hook at {:#x} panicked: {message}", slot.address);
    }
}

/// A mid-function hook running `callback` before the instruction at the hooked address
#[derive(Clone)]
pub struct MidHook {
    /// Callback shared by every site hooked with this instance
    callback: Arc<Callback>,
}

impl MidHook {
    /// Creates a hook that runs `callback`
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&mut Registers) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Hooks `address` with `callback`.
    ///
    /// # Safety
    ///
    /// See [`Hook::hook`]. Additionally no jump elsewhere in the program may land inside the
    /// bytes displaced by the hook.
    pub unsafe fn install<F>(address: usize, callback: F) -> Result<MidHookGuard>
    where
        F: Fn(&mut Registers) + Send + Sync + 'static,
    {
        Self::new(callback).hook(address as *const u8)
    }
}

unsafe impl Hook for MidHook {
    type Error = Error;
    type Guard = MidHookGuard;

    unsafe fn hook(&self, target: *const u8) -> Result<MidHookGuard> {
        let address = target as usize;
        let site = site_bytes(address)?;

        let trampoline = allocate_executable(address, TRAMPOLINE_SIZE)?;
        let base = trampoline.address();
        let jump = x64::jmp(address, base);

        let slot = Box::new(HookSlot {
            address,
            callback: self.callback.clone(),
        });

        let mut code = Vec::with_capacity(TRAMPOLINE_SIZE);
        x64::save_registers(&mut code);
        x64::call_dispatcher(
            &mut code,
            &*slot as *const HookSlot as usize,
            dispatch as Dispatcher as usize,
        );
        x64::restore_registers(&mut code);
        let displaced = x64::relocate(&site, address as u64, jump.len(), (base + code.len()) as u64)?;
        code.extend_from_slice(&displaced.code);
        code.extend_from_slice(&x64::jmp_abs(address + displaced.covered));

        write_trampoline(trampoline, &code).and_then(|trampoline| {
            let mut patch = jump;
            patch.resize(displaced.covered, NOP);
            let site_patch = patch_memory(address, &patch)?;
            debug!(
                "hooked {address:#x} ({} bytes displaced) via trampoline at {base:#x}",
                displaced.covered
            );
            Ok(MidHookGuard {
                patch: site_patch,
                trampoline,
                slot,
            })
        })
    }
}

/// Copies the bytes that may be displaced by a hook at `address`
///
/// Fails with [`Error::PatchTargetInvalid`] unless `address` is readable, executable memory.
fn site_bytes(address: usize) -> Result<Vec<u8>> {
    let invalid = || Error::PatchTargetInvalid { address };
    let region = region::query(address as *const u8).map_err(|_| invalid())?;
    if !region.protection().contains(Protection::READ_EXECUTE) {
        return Err(invalid());
    }
    let available = region.as_range().end - address;
    let len = available.min(JMP_ABS_LEN + MAX_INSTRUCTION_LEN);
    // Safety: the range lies inside a readable region
    Ok(unsafe { std::slice::from_raw_parts(address as *const u8, len) }.to_vec())
}

/// Writes generated code into the trampoline
fn write_trampoline(mut trampoline: ExecutableMemory, code: &[u8]) -> Result<ExecutableMemory> {
    if code.len() > trampoline.len() {
        return Err(Error::TrampolineAlloc(format!(
            "{} bytes of code do not fit a {} byte trampoline",
            code.len(),
            trampoline.len()
        )));
    }
    trampoline[..code.len()].copy_from_slice(code);
    Ok(trampoline)
}

/// An installed [`MidHook`]. Dropping it restores the site and frees the trampoline.
pub struct MidHookGuard {
    /// Jump written over the site. Declared first so the site is restored before the trampoline is freed.
    patch: MemoryPatch,
    /// Generated code
    trampoline: ExecutableMemory,
    /// Referenced by address from the trampoline
    #[allow(dead_code)]
    slot: Box<HookSlot>,
}

impl MidHookGuard {
    /// Bytes at the site before the hook was installed
    pub fn original(&self) -> &[u8] {
        self.patch.original()
    }

    /// Address of the trampoline
    pub fn trampoline(&self) -> usize {
        self.trampoline.address()
    }
}

impl fmt::Debug for MidHookGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidHookGuard")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("trampoline", &format_args!("{:#x}", self.trampoline()))
            .finish()
    }
}

unsafe impl HookGuard for MidHookGuard {
    fn address(&self) -> usize {
        self.patch.location()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use super::*;

    /// Function type of the generated test code
    type TestFn = extern "C" fn() -> u32;

    /// Places `code` in executable memory
    fn function(code: &[u8]) -> ExecutableMemory {
        let origin = call as fn(&ExecutableMemory) -> u32 as usize;
        let mut memory = allocate_executable(origin, 64).unwrap();
        memory.fill(0xCC);
        memory[..code.len()].copy_from_slice(code);
        memory
    }

    /// Calls the generated code
    fn call(memory: &ExecutableMemory) -> u32 {
        let f: TestFn = unsafe { std::mem::transmute(memory.as_ptr()) };
        f()
    }

    // mov eax, 42; nop x5; ret
    const RETURN_42: [u8; 11] = [0xB8, 0x2A, 0, 0, 0, 0x90, 0x90, 0x90, 0x90, 0x90, 0xC3];

    #[test]
    /// A hook sees the registers at the site and its changes stick
    fn test_hook_fires() {
        let code = function(&RETURN_42);
        assert_eq!(call(&code), 42);

        let seen = Arc::new(AtomicU64::new(0));
        let hook = {
            let seen = seen.clone();
            unsafe {
                MidHook::install(code.address() + 5, move |registers| {
                    seen.store(registers.rax & 0xFFFF_FFFF, Ordering::SeqCst);
                    registers.rax = 1337;
                })
            }
            .unwrap()
        };

        assert_eq!(call(&code), 1337);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
        assert_eq!(hook.address(), code.address() + 5);
        assert_eq!(hook.original(), [0x90; 5]);

        hook.remove();
        assert_eq!(call(&code), 42);
    }

    #[test]
    /// Dropping the guard puts the displaced bytes back
    fn test_remove_restores() {
        let code = function(&RETURN_42);
        let site = code.address();

        let hook = unsafe { MidHook::install(site, |_| {}) }.unwrap();
        // the site now starts with a jump, padded to a whole instruction
        assert!(code[0] == 0xE9 || code[..2] == [0xFF, 0x25]);
        assert_eq!(hook.original(), &RETURN_42[..hook.original().len()]);

        drop(hook);
        assert_eq!(code[..RETURN_42.len()], RETURN_42);
    }

    #[test]
    /// RIP-relative loads in the displaced instructions still reach their data
    fn test_relocated_rip_relative() {
        // mov eax, [rip + 10]; ret; data at offset 16
        let mut body = vec![0x8B, 0x05, 0x0A, 0x00, 0x00, 0x00, 0xC3];
        body.resize(16, 0xCC);
        body.extend_from_slice(&1337u32.to_le_bytes());
        let code = function(&body);
        assert_eq!(call(&code), 1337);

        let hits = Arc::new(AtomicUsize::new(0));
        let hook = {
            let hits = hits.clone();
            unsafe {
                MidHook::install(code.address(), move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            }
            .unwrap()
        };

        assert_eq!(call(&code), 1337);
        assert_eq!(call(&code), 1337);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        drop(hook);
    }

    #[test]
    /// A panicking callback leaves the game running with the registers it had
    fn test_panic_is_contained() {
        let code = function(&RETURN_42);
        let hook = unsafe { MidHook::install(code.address() + 5, |_| panic!("boom")) }.unwrap();
        assert_eq!(call(&code), 42);
        drop(hook);
    }

    #[test]
    fn test_invalid_target() {
        let err = unsafe { MidHook::install(0x10, |_| {}) }.unwrap_err();
        assert!(matches!(err, Error::PatchTargetInvalid { address: 0x10 }));

        // readable but not executable
        static DATA: [u8; 32] = [0x90; 32];
        let address = std::hint::black_box(DATA.as_ptr()) as usize;
        let err = unsafe { MidHook::install(address, |_| {}) }.unwrap_err();
        assert!(matches!(err, Error::PatchTargetInvalid { .. }));
        assert_eq!(DATA, [0x90; 32]);
    }

    #[test]
    /// Undecodable bytes leave the site untouched
    fn test_undecodable_site() {
        // 0x06 (push es) is invalid in 64-bit mode
        let code = function(&[0x06, 0x06, 0x06, 0x06, 0x06, 0x06]);
        let err = unsafe { MidHook::install(code.address(), |_| {}) }.unwrap_err();
        assert!(matches!(err, Error::PatchTargetInvalid { .. }));
        assert_eq!(code[..6], [0x06; 6]);
    }

    #[test]
    /// A displaced conditional branch still follows the flags the callback leaves behind
    fn test_relocated_conditional_branch() {
        // xor eax, eax; jz +0x1C; mov eax, 1; ret; ... 0x20: mov eax, 2; ret
        let mut body = vec![0x31, 0xC0, 0x74, 0x1C, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3];
        body.resize(0x20, 0xCC);
        body.extend_from_slice(&[0xB8, 0x02, 0x00, 0x00, 0x00, 0xC3]);
        let code = function(&body);
        assert_eq!(call(&code), 2);

        // the branch is taken as before
        let hook = unsafe { MidHook::install(code.address() + 2, |_| {}) }.unwrap();
        assert_eq!(call(&code), 2);
        drop(hook);

        // clearing ZF makes it fall through
        let hook = unsafe {
            MidHook::install(code.address() + 2, |registers| registers.rflags &= !0x40)
        }
        .unwrap();
        assert_eq!(call(&code), 1);
        drop(hook);
        assert_eq!(code[..body.len()], body[..]);
    }

    #[test]
    /// Floats written into an XMM lane are live after the hook returns
    fn test_xmm_write_back() {
        // mov eax, 1.0f; movd xmm0, eax; nop x5; movd eax, xmm0; ret
        let body = [
            0xB8, 0x00, 0x00, 0x80, 0x3F, 0x66, 0x0F, 0x6E, 0xC0, 0x90, 0x90, 0x90, 0x90, 0x90,
            0x66, 0x0F, 0x7E, 0xC0, 0xC3,
        ];
        let code = function(&body);
        assert_eq!(f32::from_bits(call(&code)), 1.0);

        let seen = Arc::new(AtomicU64::new(0));
        let hook = {
            let seen = seen.clone();
            unsafe {
                MidHook::install(code.address() + 9, move |registers| {
                    seen.store(u64::from(registers.xmm_f32(0).to_bits()), Ordering::SeqCst);
                    registers.set_xmm_f32(0, 4.0 / 3.0);
                })
            }
            .unwrap()
        };

        assert_eq!(f32::from_bits(call(&code)), 4.0 / 3.0);
        assert_eq!(f32::from_bits(seen.load(Ordering::SeqCst) as u32), 1.0);
        drop(hook);
        assert_eq!(f32::from_bits(call(&code)), 1.0);
    }
}
