//! Synthetic call frame construction and stack-pointer measurement.
//!
//! This is the only code that touches registers directly. It aligns the stack,
//! pushes `SYNTHETIC_ARG_SLOTS` zero words, zeroes the argument registers,
//! calls the target, and reports where the stack pointer sat before the call
//! and after the return. Everything else in the crate works with `StackDepth`.

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use crate::config::SYNTHETIC_ARG_SLOTS;
#[cfg(target_arch = "x86")]
use crate::config::SYNTHETIC_FRAME_BYTES;
use crate::export::derive_arg_count;

/// Stack pointer immediately before the call and immediately after the return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackDepth {
    pub before: usize,
    pub after: usize,
}

impl StackDepth {
    /// Words the callee popped, if the delta is within the synthetic frame
    pub fn arg_count(&self) -> Option<usize> {
        derive_arg_count(self.before, self.after)
    }
}

/// Whether this target's native convention has the callee pop its arguments.
///
/// Only 32-bit x86 (`stdcall`) does; everywhere else conforming callees
/// leave the stack untouched and measure as zero arguments.
pub const CALLEE_CLEANS_NATIVE: bool = cfg!(target_arch = "x86");

/// Call `entry` with a synthetic frame of zeroed arguments.
///
/// # Safety
/// `entry` is called with no knowledge of its prototype. The callee may do
/// anything, including never returning or faulting. It must preserve the
/// callee-saved registers of the platform ABI for the measurement to hold.
#[cfg(target_arch = "x86_64")]
pub unsafe fn measure(entry: usize) -> StackDepth {
    let before: usize;
    let after: usize;
    core::arch::asm!(
        "mov r12, rsp",
        "and rsp, -16",
        ".rept {slots}",
        "push 0",
        ".endr",
        "mov r13, rsp",
        "xor ecx, ecx",
        "xor edx, edx",
        "xor r8d, r8d",
        "xor r9d, r9d",
        "xor esi, esi",
        "xor edi, edi",
        "call rax",
        "mov rax, rsp",
        "mov rsp, r12",
        slots = const SYNTHETIC_ARG_SLOTS,
        inout("rax") entry => after,
        out("r12") _,
        out("r13") before,
        out("rsi") _,
        out("rdi") _,
        clobber_abi("C"),
    );
    StackDepth { before, after }
}

/// Call `entry` with a synthetic frame of zeroed arguments.
///
/// # Safety
/// See the x86_64 variant.
#[cfg(target_arch = "x86")]
pub unsafe fn measure(entry: usize) -> StackDepth {
    let restore: usize;
    let after: usize;
    core::arch::asm!(
        "mov edi, esp",
        ".rept {slots}",
        "push 0",
        ".endr",
        "xor ecx, ecx",
        "xor edx, edx",
        "call eax",
        "mov eax, esp",
        "mov esp, edi",
        slots = const SYNTHETIC_ARG_SLOTS,
        inout("eax") entry => after,
        out("edi") restore,
        clobber_abi("C"),
    );
    StackDepth {
        before: restore - SYNTHETIC_FRAME_BYTES,
        after,
    }
}
