use crate::error::{Error, Result};
use crate::model::CpuProfileData;
use crate::report;
use comfy_table::Table;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use std::path::Path;

struct Hotspot<'a> {
    method: &'a str,
    samples: u64,
    time_ms: f64,
    percent: f64,
}

pub fn run(
    file: &Path,
    limit: usize,
    threshold: f64,
    json: bool,
    filter: Option<&str>,
) -> Result<()> {
    let data = report::read_report(file)?;
    let Some(profile) = data.cpu_profile.as_ref() else {
        return Err(Error::Report(format!(
            "{} contains no CPU profile data",
            file.display()
        )));
    };
    if profile.is_empty() {
        println!("# {}", file.display());
        println!("No stack samples were recorded.");
        return Ok(());
    }

    let entries = rank_hotspots(profile, limit, threshold, filter);

    if json {
        print_json(file, profile, &entries)?;
    } else {
        print_table(file, profile, &entries);
    }
    Ok(())
}

/// Orders methods by inclusive sample count, descending; ties break by
/// name for stable output.
fn rank_hotspots<'a>(
    profile: &'a CpuProfileData,
    limit: usize,
    threshold: f64,
    filter: Option<&str>,
) -> Vec<Hotspot<'a>> {
    let mut entries: Vec<Hotspot<'a>> = profile
        .method_hotspots
        .iter()
        .map(|(method, &samples)| Hotspot {
            method,
            samples,
            time_ms: profile.method_time_ms.get(method).copied().unwrap_or(0.0),
            percent: profile
                .method_percentages
                .get(method)
                .copied()
                .unwrap_or(0.0),
        })
        .filter(|e| e.percent >= threshold)
        .filter(|e| filter.is_none_or(|f| e.method.contains(f)))
        .collect();
    entries.sort_by(|a, b| b.samples.cmp(&a.samples).then(a.method.cmp(b.method)));
    entries.truncate(limit);
    entries
}

fn print_table(file: &Path, profile: &CpuProfileData, entries: &[Hotspot<'_>]) {
    println!("# {}", file.display());
    println!(
        "# {} stack samples at {}ms intervals",
        profile.total_samples(),
        profile.sampling_interval_ms
    );

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(["CPU%", "SAMPLES", "TIME", "METHOD"]);
    for entry in entries {
        table.add_row([
            format!("{:.1}", entry.percent),
            entry.samples.to_string(),
            format!("{:.0}ms", entry.time_ms),
            entry.method.to_string(),
        ]);
    }
    println!("{table}");
}

fn print_json(file: &Path, profile: &CpuProfileData, entries: &[Hotspot<'_>]) -> Result<()> {
    let rows: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "method": e.method,
                "samples": e.samples,
                "time_ms": e.time_ms,
                "percent": e.percent,
            })
        })
        .collect();
    let out = serde_json::json!({
        "file": file.display().to_string(),
        "total_samples": profile.total_samples(),
        "sampling_interval_ms": profile.sampling_interval_ms,
        "hotspots": rows,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn profile() -> CpuProfileData {
        let raw = "a.Outer.handle(O:1);a.Inner.work(I:2);6\na.Outer.handle(O:1);2\n";
        let start = Utc::now();
        let samples = crate::aggregate::parse_collapsed(raw, start, 4);
        let hotspots = crate::aggregate::hotspots(&samples);
        CpuProfileData::new(start, start, 4, samples, hotspots)
    }

    #[test]
    fn ranks_by_inclusive_samples() {
        let profile = profile();
        let entries = rank_hotspots(&profile, 10, 0.0, None);
        assert_eq!(entries[0].method, "a.Outer.handle");
        assert_eq!(entries[0].samples, 8);
        assert_eq!(entries[1].method, "a.Inner.work");
        assert_eq!(entries[1].samples, 6);
    }

    #[test]
    fn filter_and_limit_apply() {
        let profile = profile();
        let entries = rank_hotspots(&profile, 10, 0.0, Some("Inner"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method, "a.Inner.work");

        let entries = rank_hotspots(&profile, 1, 0.0, None);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn threshold_drops_cold_methods() {
        let profile = profile();
        // Outer carries 8 of 14 counted samples, Inner the other 6.
        let entries = rank_hotspots(&profile, 10, 50.0, None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method, "a.Outer.handle");
    }
}
