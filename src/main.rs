use anyhow::{Context, Result};
use argprobe::*;
use clap::Parser;
use std::time::Duration;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "argprobe", about = "Measure the argument count of every export of a Windows image")]
struct Cli {
    /// Image to inspect (e.g. kernel32.dll)
    image: String,

    /// Call each export and measure how many arguments it pops
    #[arg(long, default_value_t = false)]
    probe: bool,

    /// Seconds to wait for one export before terminating its worker
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Only probe these exports
    #[arg(long)]
    only: Vec<String>,

    /// Never call these exports (added to the default skip list)
    #[arg(long)]
    skip: Vec<String>,

    /// Allow calling process-terminating exports such as ExitProcess
    #[arg(long, default_value_t = false)]
    no_default_skips: bool,

    /// Show raw stack pointer snapshots
    #[arg(long, default_value_t = false)]
    raw: bool,

    /// Print the session as JSON instead of text
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl Cli {
    fn probe_config(&self) -> ProbeConfig {
        let config = if self.no_default_skips {
            ProbeConfig::default().without_default_skips()
        } else {
            ProbeConfig::default()
        };
        config
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_skipped(self.skip.iter().cloned())
    }
}

/// Requested names with no matching export
fn unmatched_names<'a>(requested: &'a [String], exports: &[ExportedFunction]) -> Vec<&'a str> {
    requested
        .iter()
        .filter(|name| !exports.iter().any(|f| &f.name == *name))
        .map(String::as_str)
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut fuzzer = ExportFuzzer::open_with_config(&cli.image, cli.probe_config())
        .with_context(|| format!("open {}", cli.image))?;
    let base = fuzzer.image_base()?;

    for name in unmatched_names(&cli.only, fuzzer.list_exports()?) {
        warn!(export = name, "requested export not found");
        eprintln!("⚠️  No export named {} in {}", name, cli.image);
    }

    let summary = if cli.probe {
        let only = &cli.only;
        Some(fuzzer.probe_matching(|f| only.is_empty() || only.contains(&f.name))?)
    } else {
        None
    };

    let exports = fuzzer.list_exports()?;
    if cli.json {
        let report = SessionReport {
            image: &cli.image,
            base,
            exports,
            summary,
        };
        println!("{}", report::to_json(&report)?);
        return Ok(());
    }

    println!("argprobe - export argument count prober");
    println!("Target image: {} at 0x{:x}", cli.image, base);

    match summary {
        Some(summary) => {
            let probed: Vec<_> = exports
                .iter()
                .filter(|f| f.status.is_some())
                .cloned()
                .collect();
            print_probe_results(&probed, cli.raw);
            print_probe_summary(&summary);
        }
        None => {
            print_export_list(&cli.image, exports);
            println!("\nRun with --probe to measure argument counts");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_probe_config() {
        let cli = Cli::try_parse_from([
            "argprobe",
            "kernel32.dll",
            "--probe",
            "--timeout-secs",
            "5",
            "--skip",
            "Sleep",
            "--no-default-skips",
        ])
        .unwrap();

        let config = cli.probe_config();
        assert!(cli.probe);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.is_skipped("Sleep"));
        assert!(!config.is_skipped("ExitProcess"));
    }

    #[test]
    fn unknown_only_names_are_reported() {
        let exports = vec![
            ExportedFunction::new("GetTickCount", 0x1000),
            ExportedFunction::new("Sleep", 0x1010),
        ];
        let requested = vec!["Sleep".to_string(), "GetTickCount64".to_string()];

        assert_eq!(unmatched_names(&requested, &exports), vec!["GetTickCount64"]);
        assert!(unmatched_names(&[], &exports).is_empty());
    }

    #[test]
    fn defaults_keep_builtin_skips() {
        let cli = Cli::try_parse_from(["argprobe", "user32.dll"]).unwrap();
        let config = cli.probe_config();
        assert!(!cli.probe);
        assert_eq!(config.timeout, DEFAULT_PROBE_TIMEOUT);
        assert!(config.is_skipped("ExitProcess"));
    }
}
