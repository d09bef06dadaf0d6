//! x86-64 code generation for patch sites and mid-hook trampolines
//!
//! A trampoline is laid out as
//!
//! ```text
//! lea rsp, [rsp - 128]          ; step over the SysV red zone
//! pushfq / cld
//! push r15 .. push rax          ; rsp is pushed too and fixed up to its value at the hook site
//! lea rsp, [rsp - 256]
//! movdqu [rsp + i*16], xmmi     ; xmm0 - xmm15
//! call dispatcher(rsp, slot)    ; rsp now points at a `Registers`
//! movdqu xmmi, [rsp + i*16]
//! lea rsp, [rsp + 256]
//! pop rax .. pop r15            ; the saved rsp is skipped
//! popfq
//! lea rsp, [rsp + 128]
//! <displaced instructions, relocated>
//! jmp [rip] -> hook site + displaced length
//! ```

use iced_x86::{BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, Instruction, InstructionBlock};

use crate::error::{Error, Result};

/// Single-byte no-op
pub const NOP: u8 = 0x90;
/// Length of `jmp rel32`
pub const JMP_REL32_LEN: usize = 5;
/// Length of `jmp [rip+0]` followed by the 8-byte target
pub const JMP_ABS_LEN: usize = 14;
/// Longest possible x86 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;
/// Bytes below rsp that leaf functions may use without adjusting rsp
pub const RED_ZONE: u32 = 128;
/// Size of the saved XMM area
pub const XMM_AREA: u32 = 16 * 16;
/// Number of XMM registers saved
const XMM_COUNT: u8 = 16;
/// Distance from the `push rsp` value to the stack pointer at the hook site:
/// red zone + rflags + r15..r8 + rdi + rsi + rbp
const PUSHED_BEFORE_RSP: u32 = RED_ZONE + 12 * 8;

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    // jmp qword ptr [rip + 0]
    code[..6].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&(target as u64).to_le_bytes());
    code
}

/// Generates `jmp rel32` placed at `source`, or `None` if `target` is more than ±2 GiB away
pub fn jmp_rel32(source: usize, target: usize) -> Option<[u8; JMP_REL32_LEN]> {
    let next = (source as i128) + JMP_REL32_LEN as i128;
    let disp = i32::try_from(target as i128 - next).ok()?;
    let mut code = [0u8; JMP_REL32_LEN];
    code[0] = 0xE9;
    code[1..].copy_from_slice(&disp.to_le_bytes());
    Some(code)
}

/// Shortest jump from `source` to `target`
pub fn jmp(source: usize, target: usize) -> Vec<u8> {
    match jmp_rel32(source, target) {
        Some(code) => code.to_vec(),
        None => jmp_abs(target).to_vec(),
    }
}

/// `len` single-byte NOPs
pub fn nops(len: usize) -> Vec<u8> {
    vec![NOP; len]
}

/// `push r64`
fn push(code: &mut Vec<u8>, reg: u8) {
    if reg >= 8 {
        code.push(0x41);
    }
    code.push(0x50 + (reg & 7));
}

/// `pop r64`
fn pop(code: &mut Vec<u8>, reg: u8) {
    if reg >= 8 {
        code.push(0x41);
    }
    code.push(0x58 + (reg & 7));
}

/// `lea rsp, [rsp + disp]`
fn adjust_rsp(code: &mut Vec<u8>, disp: i32) {
    if let Ok(disp) = i8::try_from(disp) {
        code.extend_from_slice(&[0x48, 0x8D, 0x64, 0x24, disp as u8]);
    } else {
        code.extend_from_slice(&[0x48, 0x8D, 0xA4, 0x24]);
        code.extend_from_slice(&disp.to_le_bytes());
    }
}

/// `movdqu [rsp + xmm*16], xmm` when `store`, otherwise the matching load
fn movdqu(code: &mut Vec<u8>, xmm: u8, store: bool) {
    code.push(0xF3);
    if xmm >= 8 {
        code.push(0x44);
    }
    code.push(0x0F);
    code.push(if store { 0x7F } else { 0x6F });
    code.push(0x84 | ((xmm & 7) << 3));
    code.push(0x24);
    code.extend_from_slice(&(u32::from(xmm) * 16).to_le_bytes());
}

/// Emits the register save sequence. Afterwards rsp points at a `Registers` block.
pub fn save_registers(code: &mut Vec<u8>) {
    adjust_rsp(code, -(RED_ZONE as i32));
    // pushfq; cld
    code.extend_from_slice(&[0x9C, 0xFC]);
    // r15 down to rax so that rax ends up at the lowest address
    for reg in (0..16).rev() {
        push(code, reg);
    }
    // add qword ptr [rsp + 4*8], PUSHED_BEFORE_RSP
    code.extend_from_slice(&[0x48, 0x81, 0x44, 0x24, 0x20]);
    code.extend_from_slice(&PUSHED_BEFORE_RSP.to_le_bytes());
    adjust_rsp(code, -(XMM_AREA as i32));
    for xmm in 0..XMM_COUNT {
        movdqu(code, xmm, true);
    }
}

/// Emits a call to `dispatcher(registers, slot)`.
///
/// Both arguments are placed in the System V (rdi, rsi) and Microsoft (rcx, rdx) argument
/// registers, so an `extern "C"` dispatcher works on either platform. The stack is aligned to
/// 16 bytes and 32 bytes of shadow space are reserved.
pub fn call_dispatcher(code: &mut Vec<u8>, slot: usize, dispatcher: usize) {
    // mov rdi, rsp; mov rcx, rsp
    code.extend_from_slice(&[0x48, 0x89, 0xE7, 0x48, 0x89, 0xE1]);
    // mov rsi, slot; mov rdx, rsi
    code.extend_from_slice(&[0x48, 0xBE]);
    code.extend_from_slice(&(slot as u64).to_le_bytes());
    code.extend_from_slice(&[0x48, 0x89, 0xF2]);
    // mov rbx, rsp; and rsp, -16; sub rsp, 32
    code.extend_from_slice(&[0x48, 0x89, 0xE3, 0x48, 0x83, 0xE4, 0xF0, 0x48, 0x83, 0xEC, 0x20]);
    // mov rax, dispatcher; call rax
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&(dispatcher as u64).to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD0]);
    // mov rsp, rbx
    code.extend_from_slice(&[0x48, 0x89, 0xDC]);
}

/// Emits the register restore sequence, undoing [`save_registers`]
pub fn restore_registers(code: &mut Vec<u8>) {
    for xmm in 0..XMM_COUNT {
        movdqu(code, xmm, false);
    }
    adjust_rsp(code, XMM_AREA as i32);
    for reg in 0..16 {
        if reg == 4 {
            // the saved rsp is informational only
            adjust_rsp(code, 8);
        } else {
            pop(code, reg);
        }
    }
    // popfq
    code.push(0x9D);
    adjust_rsp(code, RED_ZONE as i32);
}

/// Displaced instructions re-encoded for a new location
#[derive(Debug)]
pub struct Relocated {
    /// Encoded instructions
    pub code: Vec<u8>,
    /// Number of original bytes the instructions covered
    pub covered: usize,
}

/// Decodes whole instructions from `bytes` (located at `ip`) until at least `min_len` bytes are
/// covered and re-encodes them to run at `new_ip`.
///
/// RIP-relative operands and relative branches are fixed up for the new location.
pub fn relocate(bytes: &[u8], ip: u64, min_len: usize, new_ip: u64) -> Result<Relocated> {
    let invalid = || Error::PatchTargetInvalid {
        address: ip as usize,
    };
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let mut instructions: Vec<Instruction> = Vec::new();
    let mut covered = 0usize;
    while covered < min_len {
        if !decoder.can_decode() {
            return Err(invalid());
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(invalid());
        }
        covered += instruction.len();
        instructions.push(instruction);
    }
    let block = InstructionBlock::new(&instructions, new_ip);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?;
    Ok(Relocated {
        code: encoded.code_buffer,
        covered,
    })
}
