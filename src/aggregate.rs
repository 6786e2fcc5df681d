//! Collapsed-stack text parsing and hotspot aggregation.
//!
//! The external sampler emits one line per unique folded call path:
//! semicolon-delimited frames followed by an observation weight. Native
//! frames sometimes arrive as a single space-delimited `frame count`
//! pair instead, so the weight detector tries the last `;` first and
//! falls back to the last space. Lines matching neither shape are
//! dropped individually.

use crate::model::{StackFrame, StackSample, UNKNOWN};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Parses raw collapsed-stack output into ordered samples.
///
/// The format carries no per-sample timestamps, so each sample gets an
/// approximate one: `session_start + ordinal * interval_ms`.
pub fn parse_collapsed(
    raw: &str,
    session_start: DateTime<Utc>,
    interval_ms: u64,
) -> Vec<StackSample> {
    let mut samples = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((path, weight)) = split_weight(line) else {
            tracing::debug!("dropping unparseable sample line: {line}");
            continue;
        };

        let frames: Vec<StackFrame> = path
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_frame)
            .collect();

        let offset_ms = samples.len() as u64 * interval_ms;
        let timestamp = session_start + chrono::Duration::milliseconds(offset_ms as i64);
        samples.push(StackSample::new(timestamp, UNKNOWN, 0, frames, weight));
    }

    samples
}

/// Splits a line into (call path, trailing weight), or `None` when no
/// trailing non-negative integer can be found.
fn split_weight(line: &str) -> Option<(&str, u64)> {
    // Collapsed multi-frame format: frame;frame;count
    if let Some(idx) = line.rfind(';') {
        let suffix = line[idx + 1..].trim();
        if let Ok(weight) = suffix.parse::<u64>() {
            return Some((&line[..idx], weight));
        }
    }

    // Single-frame/native format: frame count
    if let Some(idx) = line.rfind(' ') {
        let suffix = line[idx + 1..].trim();
        if let Ok(weight) = suffix.parse::<u64>() {
            return Some((&line[..idx], weight));
        }
    }

    None
}

/// Parses `Class.Method(File:Line)`. Missing pieces default to the
/// sentinel rather than failing the frame.
fn parse_frame(frame: &str) -> StackFrame {
    let (signature, location) = match frame.find('(') {
        Some(paren) => (&frame[..paren], Some(&frame[paren + 1..])),
        None => (frame, None),
    };

    // Last '.' before the parenthesis separates class from method.
    let (class_name, method_name) = match signature.rfind('.') {
        Some(dot) => (&signature[..dot], &signature[dot + 1..]),
        None => ("", signature),
    };

    let (file_name, line) = match location {
        Some(loc) => {
            let loc = loc.strip_suffix(')').unwrap_or(loc);
            match loc.rfind(':') {
                Some(colon) => {
                    let line = loc[colon + 1..].parse::<u32>().unwrap_or(0);
                    (&loc[..colon], line)
                }
                None => (loc, 0),
            }
        }
        None => ("", 0),
    };

    StackFrame::new(class_name, method_name, file_name, line)
}

/// Accumulates per-method hotspot weight across all samples.
///
/// A method appearing in N samples accumulates N times its weight even
/// when it is an ancestor frame, so the counts answer "how many samples
/// touched this method" rather than self time.
pub fn hotspots(samples: &[StackSample]) -> BTreeMap<String, u64> {
    let mut hotspots = BTreeMap::new();
    for sample in samples {
        for frame in &sample.frames {
            *hotspots.entry(frame.qualified_method()).or_insert(0) += sample.weight;
        }
    }
    hotspots
}
