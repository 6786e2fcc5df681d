//! Report assembly: serialize, compress, persist, read back.
//!
//! One file per completed session: zstd-compressed JSON named after the
//! session start timestamp. The encoding is part of the deployment
//! contract, so readers and writers in this module must stay in sync.

use crate::error::{Error, Result};
use crate::model::ProfilerData;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

pub const REPORT_EXTENSION: &str = "emberprof";
const REPORT_PREFIX: &str = "profile_";
const ZSTD_LEVEL: i32 = 3;

/// Derives the report filename from the session start time. Sessions
/// are serial, so the second-resolution stamp cannot collide.
pub fn report_filename(data: &ProfilerData) -> String {
    let local: DateTime<Local> = data.start_time.into();
    format!(
        "{REPORT_PREFIX}{}.{REPORT_EXTENSION}",
        local.format("%Y-%m-%d_%H-%M-%S")
    )
}

/// Serializes, compresses and writes one session report, creating the
/// directory if needed. Encoding failures surface before any file is
/// touched; the write itself goes through a temp sibling and rename so
/// a torn write never leaves a partial report behind.
pub fn write_report(data: &ProfilerData, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let encoded = serde_json::to_vec(data)?;
    let compressed = zstd::encode_all(encoded.as_slice(), ZSTD_LEVEL)?;

    let path = dir.join(report_filename(data));
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &compressed)?;
    std::fs::rename(&tmp, &path)?;

    tracing::info!(
        "wrote report {} ({} snapshots, {} bytes compressed)",
        path.display(),
        data.snapshots.len(),
        compressed.len()
    );
    Ok(path)
}

/// Reads a report back into memory.
pub fn read_report(path: &Path) -> Result<ProfilerData> {
    let compressed = std::fs::read(path)?;
    let encoded = zstd::decode_all(compressed.as_slice())
        .map_err(|err| Error::Report(format!("{}: {err}", path.display())))?;
    Ok(serde_json::from_slice(&encoded)?)
}

/// Summary of one stored report, for listings.
pub struct ReportInfo {
    pub path: PathBuf,
    pub start_time: DateTime<Local>,
    pub duration_secs: f64,
    pub snapshot_count: usize,
    pub cpu_samples: u64,
}

/// Finds all session reports in a directory, newest first.
pub fn find_reports(dir: &Path) -> Result<Vec<ReportInfo>> {
    let mut reports = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let is_report = path
            .extension()
            .map(|e| e == REPORT_EXTENSION)
            .unwrap_or(false)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(REPORT_PREFIX))
                .unwrap_or(false);
        if !is_report {
            continue;
        }
        match read_report(&path) {
            Ok(data) => reports.push(ReportInfo {
                path,
                start_time: data.start_time.into(),
                duration_secs: data.duration.as_secs_f64(),
                snapshot_count: data.snapshots.len(),
                cpu_samples: data
                    .cpu_profile
                    .as_ref()
                    .map(|p| p.total_samples())
                    .unwrap_or(0),
            }),
            Err(err) => tracing::warn!("skipping unreadable report {}: {err}", path.display()),
        }
    }
    reports.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    Ok(reports)
}
