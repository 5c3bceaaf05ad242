//! Process-wide fault redirection.
//!
//! While installed, a hardware fault on any thread in the process is turned
//! into an orderly exit of that thread: the faulting context's instruction
//! pointer is rewritten to `kernel32!ExitThread` and execution resumes. This
//! is global state, so only one probing sweep may run at a time; a sweep
//! holds the lock inside `RecoveryGuard` for its whole duration.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, warn};
use winapi::shared::minwindef::DWORD;
use winapi::um::errhandlingapi::{AddVectoredExceptionHandler, RemoveVectoredExceptionHandler};
use winapi::um::libloaderapi::{GetModuleHandleW, GetProcAddress};
use winapi::um::winnt::{CONTEXT, EXCEPTION_POINTERS, LONG, LPCSTR, PVOID};

use crate::export::FuzzError;

const EXCEPTION_CONTINUE_EXECUTION: LONG = -1;
const EXCEPTION_CONTINUE_SEARCH: LONG = 0;

/// Exit code a redirected worker leaves behind (x86_64 only; x86 leaves the stack value)
pub const FAULT_EXIT_CODE: DWORD = 0xDEAD_F417;

const HARDWARE_FAULTS: &[DWORD] = &[
    0x8000_0002, // EXCEPTION_DATATYPE_MISALIGNMENT
    0xC000_0005, // EXCEPTION_ACCESS_VIOLATION
    0xC000_0006, // EXCEPTION_IN_PAGE_ERROR
    0xC000_001D, // EXCEPTION_ILLEGAL_INSTRUCTION
    0xC000_008C, // EXCEPTION_ARRAY_BOUNDS_EXCEEDED
    0xC000_008D, // EXCEPTION_FLT_DENORMAL_OPERAND
    0xC000_008E, // EXCEPTION_FLT_DIVIDE_BY_ZERO
    0xC000_008F, // EXCEPTION_FLT_INEXACT_RESULT
    0xC000_0090, // EXCEPTION_FLT_INVALID_OPERATION
    0xC000_0091, // EXCEPTION_FLT_OVERFLOW
    0xC000_0092, // EXCEPTION_FLT_STACK_CHECK
    0xC000_0093, // EXCEPTION_FLT_UNDERFLOW
    0xC000_0094, // EXCEPTION_INT_DIVIDE_BY_ZERO
    0xC000_0095, // EXCEPTION_INT_OVERFLOW
    0xC000_0096, // EXCEPTION_PRIV_INSTRUCTION
    0xC000_00FD, // EXCEPTION_STACK_OVERFLOW
    0xC000_0409, // STATUS_STACK_BUFFER_OVERRUN
    0x8000_0003, // EXCEPTION_BREAKPOINT
    0x8000_0004, // EXCEPTION_SINGLE_STEP
];

static HANDLER: Mutex<Option<usize>> = Mutex::new(None);
static SWEEP: Mutex<()> = Mutex::new(());

static EXIT_THREAD: AtomicUsize = AtomicUsize::new(0);
static LAST_FAULT_CODE: AtomicU32 = AtomicU32::new(0);
static LAST_FAULT_ADDRESS: AtomicUsize = AtomicUsize::new(0);

/// A fault observed by the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub code: u32,
    pub address: usize,
}

/// Register the handler. Installing twice is a no-op.
pub fn install() -> Result<(), FuzzError> {
    let mut slot = HANDLER.lock();
    if slot.is_some() {
        return Ok(());
    }

    let exit_thread = resolve_exit_thread()
        .ok_or(FuzzError::HandlerInstallFailure("kernel32!ExitThread not found"))?;
    EXIT_THREAD.store(exit_thread, Ordering::SeqCst);

    let handle = unsafe { AddVectoredExceptionHandler(1, Some(redirect_fault)) };
    if handle.is_null() {
        return Err(FuzzError::HandlerInstallFailure("AddVectoredExceptionHandler failed"));
    }
    *slot = Some(handle as usize);
    debug!("crash recovery installed at {:p}", handle);
    Ok(())
}

/// Unregister the handler. Removing it when absent is a no-op.
pub fn uninstall() -> Result<(), FuzzError> {
    let mut slot = HANDLER.lock();
    let Some(handle) = *slot else {
        return Ok(());
    };
    if unsafe { RemoveVectoredExceptionHandler(handle as PVOID) } == 0 {
        return Err(FuzzError::HandlerRemoveFailure);
    }
    *slot = None;
    debug!("crash recovery removed");
    Ok(())
}

pub fn is_installed() -> bool {
    HANDLER.lock().is_some()
}

/// Clear and return the last fault the handler redirected
pub fn take_last_fault() -> Option<FaultRecord> {
    let code = LAST_FAULT_CODE.swap(0, Ordering::SeqCst);
    let address = LAST_FAULT_ADDRESS.swap(0, Ordering::SeqCst);
    (code != 0).then_some(FaultRecord { code, address })
}

/// Holds the sweep lock and keeps the handler installed until dropped
pub struct RecoveryGuard {
    _sweep: MutexGuard<'static, ()>,
}

impl RecoveryGuard {
    /// Wait for any other sweep to finish, then install the handler
    pub fn acquire() -> Result<Self, FuzzError> {
        let sweep = SWEEP.lock();
        install()?;
        Ok(Self { _sweep: sweep })
    }
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        if let Err(e) = uninstall() {
            warn!(error = %e, "crash recovery left installed");
        }
    }
}

/// Block until no sweep is running; used by tests that inspect handler state
#[cfg(test)]
pub(crate) fn lock_sweeps() -> MutexGuard<'static, ()> {
    SWEEP.lock()
}

fn resolve_exit_thread() -> Option<usize> {
    let module: Vec<u16> = "kernel32.dll\0".encode_utf16().collect();
    unsafe {
        let kernel32 = GetModuleHandleW(module.as_ptr());
        if kernel32.is_null() {
            return None;
        }
        let proc = GetProcAddress(kernel32, b"ExitThread\0".as_ptr() as LPCSTR);
        (!proc.is_null()).then_some(proc as usize)
    }
}

// Runs on the faulting thread, possibly with locks held or the stack
// exhausted: no allocation, no logging, atomics only.
unsafe extern "system" fn redirect_fault(info: *mut EXCEPTION_POINTERS) -> LONG {
    if info.is_null() || (*info).ExceptionRecord.is_null() || (*info).ContextRecord.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    let record = &*(*info).ExceptionRecord;
    if !HARDWARE_FAULTS.contains(&record.ExceptionCode) {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    let exit_thread = EXIT_THREAD.load(Ordering::SeqCst);
    if exit_thread == 0 {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    LAST_FAULT_CODE.store(record.ExceptionCode, Ordering::SeqCst);
    LAST_FAULT_ADDRESS.store(record.ExceptionAddress as usize, Ordering::SeqCst);
    redirect(&mut *(*info).ContextRecord, exit_thread);
    EXCEPTION_CONTINUE_EXECUTION
}

#[cfg(target_arch = "x86_64")]
fn redirect(context: &mut CONTEXT, exit_thread: usize) {
    context.Rip = exit_thread as u64;
    context.Rcx = FAULT_EXIT_CODE as u64;
    // Enter ExitThread as if called: rsp is 8 mod 16 at a function's first instruction.
    context.Rsp = (context.Rsp & !0xF) - 8;
}

#[cfg(target_arch = "x86")]
fn redirect(context: &mut CONTEXT, exit_thread: usize) {
    context.Eip = exit_thread as u32;
}
