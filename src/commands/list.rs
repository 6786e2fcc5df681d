use crate::error::Result;
use crate::report;
use std::path::{Path, PathBuf};

/// Most recent report in a directory, if any.
pub fn most_recent_report(dir: &Path) -> Result<Option<PathBuf>> {
    let reports = report::find_reports(dir)?;
    Ok(reports.into_iter().next().map(|r| r.path))
}

/// Run the list command
pub fn run(dir: Option<&Path>) -> Result<()> {
    let search_dir = dir.unwrap_or_else(|| Path::new("."));
    let reports = report::find_reports(search_dir)?;

    if reports.is_empty() {
        println!("No session reports found in {}", search_dir.display());
        return Ok(());
    }

    println!(
        "{:<42} {:>20} {:>10} {:>10} {:>12}",
        "FILE", "STARTED", "DURATION", "SNAPSHOTS", "CPU SAMPLES"
    );
    println!("{}", "-".repeat(98));

    for info in reports {
        let filename = info
            .path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        println!(
            "{:<42} {:>20} {:>9.1}s {:>10} {:>12}",
            filename,
            info.start_time.format("%Y-%m-%d %H:%M:%S"),
            info.duration_secs,
            info.snapshot_count,
            info.cpu_samples,
        );
    }

    Ok(())
}
