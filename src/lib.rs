//! Argprobe Library
//!
//! Enumerates the named exports of a mapped Windows image and measures how
//! many machine-word arguments each one pops off the stack, without symbols
//! or prototypes.
//!
//! ## How it works
//!
//! - Validate the image headers and walk its export table
//! - Call each export on a fresh worker thread with sixteen zeroed arguments
//! - Compare the stack pointer before the call and after the return
//! - Redirect any fault in the callee to `ExitThread`, and terminate workers
//!   that hang, so one bad export never ends the sweep
//!
//! Recovery works for callee-cleans conventions (32-bit `stdcall`). Exports
//! that leave argument cleanup to the caller measure as zero arguments.
//!
//! ## Example
//!
//! ```no_run
//! use argprobe::ExportFuzzer;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut fuzzer = ExportFuzzer::open("user32.dll")?;
//!     let summary = fuzzer.probe_matching(|f| f.name.starts_with("GetSystem"))?;
//!
//!     for export in fuzzer.list_exports()? {
//!         println!("{}: {:?}", export.name, export.arg_count);
//!     }
//!     println!("{} exports probed", summary.probed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod export;
pub mod extractor;
pub mod frame;
pub mod fuzzer;
pub mod image;
#[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
pub mod prober;
#[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
pub mod recovery;
pub mod report;

#[cfg(test)]
mod fixture;

pub use config::{
    ProbeConfig,
    DEFAULT_PROBE_TIMEOUT,
    DEFAULT_SKIPPED_EXPORTS,
    SYNTHETIC_ARG_SLOTS,
};

pub use export::{
    derive_arg_count,
    ExportedFunction,
    FuzzError,
    ProbeResult,
    ProbeStatus,
    ProbeSummary,
};

pub use extractor::{
    get_all_export_names,
    read_export_directory,
    resolve_export,
    walk_exports,
    ExportDirectory,
};

pub use fuzzer::ExportFuzzer;
pub use image::{ExecutableImage, ImageView};

pub use report::{
    print_export_list,
    print_probe_results,
    print_probe_summary,
    SessionReport,
};
