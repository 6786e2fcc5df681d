//! Data model for sessions, snapshots and CPU profiles.
//!
//! Everything here is plain data that serializes into the report. A
//! `None` metric field means the probe is disabled, which callers must
//! distinguish from a probe that returned zeros.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const UNKNOWN: &str = "unknown";

/// Heap occupancy at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapMetrics {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub committed_bytes: u64,
    pub free_bytes: u64,
    pub usage_ratio: f64,
}

impl HeapMetrics {
    pub fn new(used_bytes: u64, max_bytes: u64, committed_bytes: u64) -> Self {
        let ceiling = if max_bytes > 0 { max_bytes } else { committed_bytes };
        let free_bytes = ceiling.saturating_sub(used_bytes);
        let usage_ratio = if ceiling > 0 {
            used_bytes as f64 / ceiling as f64
        } else {
            0.0
        };
        Self {
            used_bytes,
            max_bytes,
            committed_bytes,
            free_bytes,
            usage_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcCollectorInfo {
    pub name: String,
    pub collection_count: u64,
    pub collection_time_ms: u64,
    pub average_pause_ms: f64,
}

/// Collector statistics for hosts that run a garbage- or epoch-collected
/// allocator. Hosts without one leave the probe disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcMetrics {
    pub collectors: Vec<GcCollectorInfo>,
    pub total_collections: u64,
    pub total_collection_time_ms: u64,
    pub average_pause_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMetrics {
    pub total_threads: u32,
    pub peak_threads: u32,
    pub total_started_threads: u64,
    /// Kernel scheduler state -> thread count, e.g. "R" -> 3.
    pub threads_by_state: BTreeMap<String, u32>,
}

/// Host tick-rate statistics over the recent window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRateMetrics {
    pub current: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    /// Fraction of one core consumed by this process, or -1.0 when unknown.
    pub process_cpu_load: f64,
    /// System-wide load fraction, or -1.0 when unknown.
    pub system_cpu_load: f64,
    pub available_processors: u32,
    pub available: bool,
}

impl CpuMetrics {
    pub fn unavailable(available_processors: u32) -> Self {
        Self {
            process_cpu_load: -1.0,
            system_cpu_load: -1.0,
            available_processors,
            available: false,
        }
    }
}

/// Domain-specific workload counters supplied by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadMetrics {
    pub counters: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoMetrics {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub since_start_read_bytes: u64,
    pub since_start_write_bytes: u64,
    pub since_start_read_ops: u64,
    pub since_start_write_ops: u64,
}

/// One point-in-time bundle of metric readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub heap: Option<HeapMetrics>,
    pub gc: Option<GcMetrics>,
    pub threads: Option<ThreadMetrics>,
    pub tick_rate: Option<TickRateMetrics>,
    pub cpu: Option<CpuMetrics>,
    pub workload: Option<WorkloadMetrics>,
    pub io: Option<IoMetrics>,
}

/// A single frame in a sampled stack. Names are never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    pub file_name: String,
    pub line: u32,
}

impl StackFrame {
    pub fn new(class_name: &str, method_name: &str, file_name: &str, line: u32) -> Self {
        let or_unknown = |s: &str| {
            if s.is_empty() {
                UNKNOWN.to_string()
            } else {
                s.to_string()
            }
        };
        Self {
            class_name: or_unknown(class_name),
            method_name: or_unknown(method_name),
            file_name: or_unknown(file_name),
            line,
        }
    }

    /// Fully-qualified method name used as the hotspot key.
    pub fn qualified_method(&self) -> String {
        format!("{}.{}", self.class_name, self.method_name)
    }
}

impl std::fmt::Display for StackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}({}:{})",
            self.class_name, self.method_name, self.file_name, self.line
        )
    }
}

/// One folded call path with an observation weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSample {
    pub timestamp: DateTime<Utc>,
    pub thread_name: String,
    pub thread_id: u64,
    pub frames: Vec<StackFrame>,
    pub weight: u64,
}

impl StackSample {
    pub fn new(
        timestamp: DateTime<Utc>,
        thread_name: &str,
        thread_id: u64,
        frames: Vec<StackFrame>,
        weight: u64,
    ) -> Self {
        Self {
            timestamp,
            thread_name: if thread_name.is_empty() {
                UNKNOWN.to_string()
            } else {
                thread_name.to_string()
            },
            thread_id,
            frames,
            weight: weight.max(1),
        }
    }
}

/// Aggregated CPU profile: raw samples plus per-method hotspot stats.
///
/// The time and percentage maps are derived from the hotspot map inside
/// the constructor and are never populated any other way, so they cannot
/// drift from the counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuProfileData {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub sampling_interval_ms: u64,
    pub samples: Vec<StackSample>,
    pub method_hotspots: BTreeMap<String, u64>,
    pub method_time_ms: BTreeMap<String, f64>,
    pub method_percentages: BTreeMap<String, f64>,
}

impl CpuProfileData {
    pub fn new(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        sampling_interval_ms: u64,
        samples: Vec<StackSample>,
        method_hotspots: BTreeMap<String, u64>,
    ) -> Self {
        let sampling_interval_ms = sampling_interval_ms.max(1);
        let total: u64 = method_hotspots.values().sum();
        let method_time_ms = method_hotspots
            .iter()
            .map(|(k, &count)| (k.clone(), (count * sampling_interval_ms) as f64))
            .collect();
        let method_percentages = if total == 0 {
            BTreeMap::new()
        } else {
            method_hotspots
                .iter()
                .map(|(k, &count)| (k.clone(), count as f64 / total as f64 * 100.0))
                .collect()
        };
        Self {
            start_time,
            end_time,
            sampling_interval_ms,
            samples,
            method_hotspots,
            method_time_ms,
            method_percentages,
        }
    }

    /// Total weight across all hotspot entries. Frames at different
    /// depths are counted once each, matching flamegraph semantics.
    pub fn total_samples(&self) -> u64 {
        self.method_hotspots.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.method_hotspots.is_empty()
    }
}

/// A single captured config file, contents redacted where sensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDump {
    pub path: String,
    pub contents: Option<String>,
    pub error: Option<String>,
}

/// Host configuration state captured at session start and stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preamble {
    pub captured_at: DateTime<Utc>,
    pub configs: Vec<ConfigDump>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub os_name: String,
    pub os_version: Option<String>,
    pub architecture: String,
    pub runtime_version: String,
    pub cpu_model: Option<String>,
    pub available_processors: u32,
    pub max_memory_bytes: u64,
    /// Process arguments with PII-bearing flags stripped.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilerMetadata {
    pub format_version: u32,
    pub host_version: String,
    pub created_at: DateTime<Utc>,
    pub environment: EnvironmentInfo,
}

pub const FORMAT_VERSION: u32 = 1;

/// The complete record of one finished session. Built exactly once at
/// finalize and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilerData {
    pub metadata: ProfilerMetadata,
    pub preamble: Preamble,
    pub postamble: Option<Preamble>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    pub sampling_interval: Duration,
    pub snapshots: Vec<PerformanceSnapshot>,
    pub cpu_profile: Option<CpuProfileData>,
}
