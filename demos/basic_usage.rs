use argprobe::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("argprobe - Basic Usage Example");

    // Example 1: Open an image and list its exports
    println!("\n=== Example 1: List exports ===");
    let mut fuzzer = ExportFuzzer::open("kernel32.dll")?;
    println!("kernel32.dll mapped at 0x{:x}", fuzzer.image_base()?);
    let exports = fuzzer.list_exports()?;
    println!("Found {} named exports", exports.len());
    for export in exports.iter().take(5) {
        println!("  - {} (ordinal {}, RVA: 0x{:x})", export.name, export.ordinal, export.rva);
    }

    // Example 2: Probe a few exports that are safe to call with zeroed arguments
    println!("\n=== Example 2: Probe selected exports ===");
    let wanted = ["GetTickCount", "GetCurrentProcessId", "Sleep"];
    let summary = fuzzer.probe_matching(|f| wanted.contains(&f.name.as_str()))?;
    let probed: Vec<_> = fuzzer
        .list_exports()?
        .iter()
        .filter(|f| f.status.is_some())
        .cloned()
        .collect();
    print_probe_results(&probed, true);
    print_probe_summary(&summary);

    Ok(())
}
