use std::time::Duration;

/// Number of zeroed machine words placed on the synthetic call frame
pub const SYNTHETIC_ARG_SLOTS: usize = 16;

/// Size in bytes of one synthetic argument slot
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Bytes reserved for the synthetic argument list
pub const SYNTHETIC_FRAME_BYTES: usize = SYNTHETIC_ARG_SLOTS * WORD_SIZE;

/// How long a single export may run before its worker is terminated
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest export name accepted from a name table, excluding the terminator
pub const MAX_EXPORT_NAME_LEN: usize = 256;

/// Exports that end the process when called; never probed unless asked for.
pub const DEFAULT_SKIPPED_EXPORTS: &[&str] = &[
    "ExitProcess",
    "FatalExit",
    "FatalAppExitA",
    "FatalAppExitW",
    "TerminateProcess",
    "RaiseFailFastException",
    "RtlExitUserProcess",
    "NtTerminateProcess",
    "ZwTerminateProcess",
    "DbgBreakPoint",
    "DbgUserBreakPoint",
    "DebugBreak",
];

/// Settings for a probing sweep
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub timeout: Duration,
    pub skip: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            skip: DEFAULT_SKIPPED_EXPORTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProbeConfig {
    /// Set the per-export timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add export names that must not be called
    pub fn with_skipped<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip.extend(names.into_iter().map(Into::into));
        self
    }

    /// Drop the built-in skip list
    pub fn without_default_skips(mut self) -> Self {
        self.skip.retain(|name| !DEFAULT_SKIPPED_EXPORTS.contains(&name.as_str()));
        self
    }

    /// Whether the export with this name is excluded from probing
    pub fn is_skipped(&self, name: &str) -> bool {
        self.skip.iter().any(|s| s == name)
    }
}
