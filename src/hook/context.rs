//! Register state captured by a mid-hook trampoline

use std::fmt;

/// Registers at the hooked instruction, as saved by the trampoline.
///
/// The layout matches the save sequence in [`crate::code::x64`]: the XMM block sits at the
/// lowest address, followed by the general purpose registers in encoding order and RFLAGS.
/// Everything except `rsp` is written back when the trampoline resumes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Registers {
    /// XMM0 - XMM15, 16 bytes each
    pub xmm: [[u8; 16]; 16],
    /// RAX
    pub rax: u64,
    /// RCX
    pub rcx: u64,
    /// RDX
    pub rdx: u64,
    /// RBX
    pub rbx: u64,
    /// Stack pointer at the hook site. Read-only; changes are discarded.
    pub rsp: u64,
    /// RBP
    pub rbp: u64,
    /// RSI
    pub rsi: u64,
    /// RDI
    pub rdi: u64,
    /// R8
    pub r8: u64,
    /// R9
    pub r9: u64,
    /// R10
    pub r10: u64,
    /// R11
    pub r11: u64,
    /// R12
    pub r12: u64,
    /// R13
    pub r13: u64,
    /// R14
    pub r14: u64,
    /// R15
    pub r15: u64,
    /// RFLAGS, restored with `popfq`
    pub rflags: u64,
}

impl Registers {
    /// Lowest single-precision lane of `xmm{index}`
    ///
    /// # Panics
    ///
    /// If `index` is not below 16
    pub fn xmm_f32(&self, index: usize) -> f32 {
        let mut lane = [0u8; 4];
        lane.copy_from_slice(&self.xmm[index][..4]);
        f32::from_le_bytes(lane)
    }

    /// Replaces the lowest single-precision lane of `xmm{index}`, leaving the other lanes as-is
    pub fn set_xmm_f32(&mut self, index: usize, value: f32) {
        self.xmm[index][..4].copy_from_slice(&value.to_le_bytes());
    }

    /// Lowest double-precision lane of `xmm{index}`
    pub fn xmm_f64(&self, index: usize) -> f64 {
        let mut lane = [0u8; 8];
        lane.copy_from_slice(&self.xmm[index][..8]);
        f64::from_le_bytes(lane)
    }

    /// Replaces the lowest double-precision lane of `xmm{index}`
    pub fn set_xmm_f64(&mut self, index: usize, value: f64) {
        self.xmm[index][..8].copy_from_slice(&value.to_le_bytes());
    }

    /// Reads a value from the address held in a register plus `displacement`.
    ///
    /// # Safety
    ///
    /// `base + displacement` must be valid for a read of `T`
    pub unsafe fn read<T: Copy>(base: u64, displacement: isize) -> T {
        let address = (base as usize).wrapping_add_signed(displacement);
        std::ptr::read_unaligned(address as *const T)
    }

    /// Writes a value to the address held in a register plus `displacement`.
    ///
    /// # Safety
    ///
    /// `base + displacement` must be valid for a write of `T`
    pub unsafe fn write<T: Copy>(base: u64, displacement: isize, value: T) {
        let address = (base as usize).wrapping_add_signed(displacement);
        std::ptr::write_unaligned(address as *mut T, value);
    }
}

/// Low 32 bits of a general purpose register interpreted as a float (`movd`)
pub fn gpr_f32(value: u64) -> f32 {
    f32::from_bits(value as u32)
}

/// Float bits as a general purpose register value, zero-extended like a 32-bit `mov`
pub fn f32_gpr(value: f32) -> u64 {
    u64::from(value.to_bits())
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("rax", &format_args!("{:#x}", self.rax))
            .field("rcx", &format_args!("{:#x}", self.rcx))
            .field("rdx", &format_args!("{:#x}", self.rdx))
            .field("rbx", &format_args!("{:#x}", self.rbx))
            .field("rsp", &format_args!("{:#x}", self.rsp))
            .field("rbp", &format_args!("{:#x}", self.rbp))
            .field("rsi", &format_args!("{:#x}", self.rsi))
            .field("rdi", &format_args!("{:#x}", self.rdi))
            .field("r8", &format_args!("{:#x}", self.r8))
            .field("r9", &format_args!("{:#x}", self.r9))
            .field("r10", &format_args!("{:#x}", self.r10))
            .field("r11", &format_args!("{:#x}", self.r11))
            .field("r12", &format_args!("{:#x}", self.r12))
            .field("r13", &format_args!("{:#x}", self.r13))
            .field("r14", &format_args!("{:#x}", self.r14))
            .field("r15", &format_args!("{:#x}", self.r15))
            .field("rflags", &format_args!("{:#x}", self.rflags))
            .field("xmm0", &self.xmm_f32(0))
            .field("xmm1", &self.xmm_f32(1))
            .finish_non_exhaustive()
    }
}
