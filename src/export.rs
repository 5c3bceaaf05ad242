use serde::Serialize;
use std::time::Duration;

use crate::config::{SYNTHETIC_ARG_SLOTS, WORD_SIZE};

/// A function exported by name from a mapped image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedFunction {
    pub name: String,
    pub ordinal: u32,
    pub rva: u32,
    pub address: usize,
    /// Target of a forwarded export ("DLL.Function"); such entries have no code.
    pub forwarder: Option<String>,
    pub stack_before: Option<usize>,
    pub stack_after: Option<usize>,
    pub arg_count: Option<usize>,
    pub status: Option<ProbeStatus>,
}

impl ExportedFunction {
    /// Create an unprobed export record
    pub fn new(name: impl Into<String>, address: usize) -> Self {
        Self {
            name: name.into(),
            ordinal: 0,
            rva: 0,
            address,
            forwarder: None,
            stack_before: None,
            stack_after: None,
            arg_count: None,
            status: None,
        }
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarder.is_some()
    }

    /// Fold a probe result into this record.
    ///
    /// The argument count is only derived from a completed probe; every other
    /// outcome leaves it unknown, even if a snapshot was captured.
    pub fn record(&mut self, result: &ProbeResult) {
        self.stack_before = result.before;
        self.stack_after = result.after;
        self.arg_count = result.arg_count();
        self.status = Some(result.status);
    }

    /// Forget any earlier probe outcome
    pub fn clear_probe(&mut self) {
        self.stack_before = None;
        self.stack_after = None;
        self.arg_count = None;
        self.status = None;
    }

    /// Mark the export as deliberately not called
    pub fn mark_skipped(&mut self) {
        self.record(&ProbeResult::skipped());
    }
}

/// How a single probe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeStatus {
    Completed,
    TimedOut,
    Faulted { code: Option<u32> },
    Skipped,
}

/// Stack snapshots and completion status of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub before: Option<usize>,
    pub after: Option<usize>,
    pub status: ProbeStatus,
}

impl ProbeResult {
    pub fn completed(before: usize, after: usize) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
            status: ProbeStatus::Completed,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            before: None,
            after: None,
            status: ProbeStatus::TimedOut,
        }
    }

    pub fn faulted(code: Option<u32>) -> Self {
        Self {
            before: None,
            after: None,
            status: ProbeStatus::Faulted { code },
        }
    }

    pub fn skipped() -> Self {
        Self {
            before: None,
            after: None,
            status: ProbeStatus::Skipped,
        }
    }

    /// Argument count recovered from the snapshots, if the probe completed
    pub fn arg_count(&self) -> Option<usize> {
        match (self.status, self.before, self.after) {
            (ProbeStatus::Completed, Some(before), Some(after)) => derive_arg_count(before, after),
            _ => None,
        }
    }
}

/// Convert a stack-pointer delta into a word count.
///
/// The callee pops its arguments, so `after` sits above `before` by exactly
/// the bytes it consumed. Anything outside `0..=SYNTHETIC_ARG_SLOTS` words, or
/// not word aligned, did not follow that convention.
pub fn derive_arg_count(before: usize, after: usize) -> Option<usize> {
    let delta = after.checked_sub(before)?;
    if delta % WORD_SIZE != 0 {
        return None;
    }
    let count = delta / WORD_SIZE;
    (count <= SYNTHETIC_ARG_SLOTS).then_some(count)
}

/// Tally of a probing sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub probed: usize,
    pub completed: usize,
    /// Completed, but the stack delta was outside the recoverable range
    pub nonconforming: usize,
    pub timed_out: usize,
    pub faulted: usize,
    pub skipped: usize,
    /// The worker could not be started or waited on
    pub failed: usize,
}

impl ProbeSummary {
    /// Count one recorded export
    pub fn tally(&mut self, function: &ExportedFunction) {
        match function.status {
            Some(ProbeStatus::Completed) => {
                self.probed += 1;
                self.completed += 1;
                if function.arg_count.is_none() {
                    self.nonconforming += 1;
                }
            }
            Some(ProbeStatus::TimedOut) => {
                self.probed += 1;
                self.timed_out += 1;
            }
            Some(ProbeStatus::Faulted { .. }) => {
                self.probed += 1;
                self.faulted += 1;
            }
            Some(ProbeStatus::Skipped) => self.skipped += 1,
            None => self.failed += 1,
        }
    }
}

/// Errors raised while loading, walking, or probing an image
#[derive(Debug, thiserror::Error)]
pub enum FuzzError {
    #[error("Failed to load image {name} (os error {code})")]
    LoadFailure { name: String, code: u32 },

    #[error("Invalid image: {0}")]
    InvalidImage(&'static str),

    #[error("Malformed export entry {index}: {reason}")]
    MalformedExport { index: u32, reason: String },

    #[error("Probe of {name} timed out after {timeout:?}")]
    ProbeTimeout { name: String, timeout: Duration },

    #[error("Probe of {name} faulted (exception code {code:#010x})")]
    ProbeFault { name: String, code: u32 },

    #[error("Failed to install crash recovery handler: {0}")]
    HandlerInstallFailure(&'static str),

    #[error("Failed to remove crash recovery handler")]
    HandlerRemoveFailure,

    #[error("Failed to start probe worker for {name} (os error {code})")]
    WorkerSpawn { name: String, code: u32 },

    #[error("Failed to wait on probe worker for {name} (os error {code})")]
    WorkerWait { name: String, code: u32 },

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(&'static str),
}

impl FuzzError {
    /// Whether this error ends the whole session rather than one export
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            FuzzError::LoadFailure { .. }
                | FuzzError::InvalidImage(_)
                | FuzzError::HandlerInstallFailure(_)
                | FuzzError::UnsupportedPlatform(_)
        )
    }
}
