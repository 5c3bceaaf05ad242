use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use winapi::shared::minwindef::{DWORD, LPVOID, ULONG};
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::CloseHandle;
use winapi::um::processthreadsapi::{
    CreateThread, GetExitCodeThread, SetThreadStackGuarantee, TerminateThread,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0};
use winapi::um::winnt::HANDLE;

use crate::config::ProbeConfig;
use crate::export::{ExportedFunction, FuzzError, ProbeResult, ProbeSummary};
use crate::frame::{self, CALLEE_CLEANS_NATIVE};
use crate::recovery::{self, RecoveryGuard};

const TIMEOUT_EXIT_CODE: DWORD = 0xDEAD_71E0;
const TERMINATION_GRACE: DWORD = 5_000;
/// Stack kept in reserve for `ExitThread` once a callee overflows its stack
const STACK_OVERFLOW_RESERVE: ULONG = 64 * 1024;

/// State shared between the orchestrator and one worker.
///
/// A worker that faults or is terminated never drops its reference, so the
/// slot outlives it; the leak is a few words per lost probe.
struct ProbeSlot {
    entry: usize,
    before: AtomicUsize,
    after: AtomicUsize,
    returned: AtomicBool,
}

impl ProbeSlot {
    fn new(entry: usize) -> Self {
        Self {
            entry,
            before: AtomicUsize::new(0),
            after: AtomicUsize::new(0),
            returned: AtomicBool::new(false),
        }
    }
}

struct OwnedThread(HANDLE);

impl Drop for OwnedThread {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

unsafe extern "system" fn probe_worker(param: LPVOID) -> DWORD {
    let slot = Arc::from_raw(param as *const ProbeSlot);
    let mut reserve = STACK_OVERFLOW_RESERVE;
    SetThreadStackGuarantee(&mut reserve);
    let depth = frame::measure(slot.entry);
    slot.before.store(depth.before, Ordering::SeqCst);
    slot.after.store(depth.after, Ordering::SeqCst);
    slot.returned.store(true, Ordering::SeqCst);
    0
}

fn timeout_millis(timeout: Duration) -> DWORD {
    timeout.as_millis().min(u128::from(INFINITE - 1)) as DWORD
}

/// Call one export on a fresh worker thread and measure its stack delta.
///
/// The crash recovery handler must be installed, otherwise a fault in the
/// callee takes down the process. A hang is cut off after `timeout` by
/// terminating the worker.
pub fn probe_function(function: &ExportedFunction, timeout: Duration) -> Result<ProbeResult, FuzzError> {
    let slot = Arc::new(ProbeSlot::new(function.address));
    let param = Arc::into_raw(Arc::clone(&slot)) as LPVOID;
    recovery::take_last_fault();

    let mut thread_id: DWORD = 0;
    let raw = unsafe { CreateThread(ptr::null_mut(), 0, Some(probe_worker), param, 0, &mut thread_id) };
    if raw.is_null() {
        let code = unsafe { GetLastError() };
        drop(unsafe { Arc::from_raw(param as *const ProbeSlot) });
        return Err(FuzzError::WorkerSpawn {
            name: function.name.clone(),
            code,
        });
    }
    let thread = OwnedThread(raw);
    debug!(export = %function.name, thread_id, "probe worker started");

    match unsafe { WaitForSingleObject(thread.0, timeout_millis(timeout)) } {
        WAIT_OBJECT_0 => {}
        WAIT_TIMEOUT => {
            unsafe {
                TerminateThread(thread.0, TIMEOUT_EXIT_CODE);
                WaitForSingleObject(thread.0, TERMINATION_GRACE);
            }
            let e = FuzzError::ProbeTimeout {
                name: function.name.clone(),
                timeout,
            };
            warn!(error = %e, "probe worker terminated");
            return Ok(ProbeResult::timed_out());
        }
        _ => {
            let code = unsafe { GetLastError() };
            unsafe { TerminateThread(thread.0, TIMEOUT_EXIT_CODE) };
            return Err(FuzzError::WorkerWait {
                name: function.name.clone(),
                code,
            });
        }
    }

    if slot.returned.load(Ordering::SeqCst) {
        let result = ProbeResult::completed(
            slot.before.load(Ordering::SeqCst),
            slot.after.load(Ordering::SeqCst),
        );
        debug!(export = %function.name, arg_count = ?result.arg_count(), "probe completed");
        return Ok(result);
    }

    let fault = recovery::take_last_fault();
    let mut exit_code: DWORD = 0;
    unsafe { GetExitCodeThread(thread.0, &mut exit_code) };
    let e = FuzzError::ProbeFault {
        name: function.name.clone(),
        code: fault.map_or(0, |f| f.code),
    };
    warn!(
        error = %e,
        address = %format!("{:#x}", fault.map_or(0, |f| f.address)),
        exit_code,
        "probe worker faulted"
    );
    Ok(ProbeResult::faulted(fault.map(|f| f.code)))
}

/// Probe each function in order with crash recovery installed.
///
/// Per-export failures are recorded on the export and never end the sweep.
/// The handler is removed on every exit path.
pub fn sweep<'a, I>(functions: I, config: &ProbeConfig) -> Result<ProbeSummary, FuzzError>
where
    I: IntoIterator<Item = &'a mut ExportedFunction>,
{
    let _guard = RecoveryGuard::acquire()?;
    if !CALLEE_CLEANS_NATIVE {
        info!("native convention is caller-cleans; conforming exports measure as zero arguments");
    }

    let mut summary = ProbeSummary::default();
    for function in functions {
        if function.is_forwarded() || config.is_skipped(&function.name) {
            debug!(export = %function.name, "not probing");
            function.mark_skipped();
        } else {
            info!(export = %function.name, "probing parameter count");
            match probe_function(function, config.timeout) {
                Ok(result) => function.record(&result),
                Err(e) => {
                    warn!(error = %e, "probe could not run");
                    function.clear_probe();
                }
            }
        }
        summary.tally(function);
    }

    info!(
        probed = summary.probed,
        completed = summary.completed,
        timed_out = summary.timed_out,
        faulted = summary.faulted,
        "sweep finished"
    );
    Ok(summary)
}
