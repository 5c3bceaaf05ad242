use serde::Serialize;

use crate::export::{ExportedFunction, ProbeStatus, ProbeSummary};

/// Full session output in machine-readable form
#[derive(Debug, Serialize)]
pub struct SessionReport<'a> {
    pub image: &'a str,
    pub base: usize,
    pub exports: &'a [ExportedFunction],
    pub summary: Option<ProbeSummary>,
}

/// Render a session as pretty JSON
pub fn to_json(report: &SessionReport<'_>) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

/// Argument count, or `unknown` when the probe did not yield one
pub fn arg_count_label(function: &ExportedFunction) -> String {
    match function.arg_count {
        Some(count) => count.to_string(),
        None => "unknown".to_string(),
    }
}

fn status_label(status: Option<ProbeStatus>) -> String {
    match status {
        None => "not probed".to_string(),
        Some(ProbeStatus::Completed) => "completed".to_string(),
        Some(ProbeStatus::TimedOut) => "timed out".to_string(),
        Some(ProbeStatus::Faulted { code: Some(code) }) => format!("faulted (0x{:08x})", code),
        Some(ProbeStatus::Faulted { code: None }) => "faulted".to_string(),
        Some(ProbeStatus::Skipped) => "skipped".to_string(),
    }
}

fn hex_or_dash(value: Option<usize>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("0x{:x}", v))
}

/// Print the export list without probe results
pub fn print_export_list(image_name: &str, exports: &[ExportedFunction]) {
    println!("\n=== Exports of {} ({}) ===", image_name, exports.len());
    for (i, function) in exports.iter().enumerate() {
        match &function.forwarder {
            Some(target) => println!(
                "{:>5}. {} (ordinal {}) -> {}",
                i + 1,
                function.name,
                function.ordinal,
                target
            ),
            None => println!(
                "{:>5}. {} (ordinal {}, RVA: 0x{:x}) at 0x{:x}",
                i + 1,
                function.name,
                function.ordinal,
                function.rva,
                function.address
            ),
        }
    }
}

/// Print one line per export: name, argument count, outcome
pub fn print_probe_results(exports: &[ExportedFunction], show_raw: bool) {
    println!("\n=== Parameter Counts ===");
    for function in exports {
        if show_raw {
            println!(
                "  {:<48} args: {:<8} {:<24} before: {} after: {}",
                function.name,
                arg_count_label(function),
                status_label(function.status),
                hex_or_dash(function.stack_before),
                hex_or_dash(function.stack_after)
            );
        } else {
            println!(
                "  {:<48} args: {:<8} {}",
                function.name,
                arg_count_label(function),
                status_label(function.status)
            );
        }
    }
}

/// Print totals for a sweep
pub fn print_probe_summary(summary: &ProbeSummary) {
    println!("\n=== Probe Summary ===");
    println!("Exports probed: {}", summary.probed);
    println!("Completed: {}", summary.completed);
    if summary.nonconforming > 0 {
        println!("  of which outside the recoverable range: {}", summary.nonconforming);
    }
    println!("Timed out: {}", summary.timed_out);
    println!("Faulted: {}", summary.faulted);
    println!("Skipped: {}", summary.skipped);
    if summary.failed > 0 {
        println!("Could not run: {}", summary.failed);
    }
}
