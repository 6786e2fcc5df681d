//! Profiler configuration with clamped accessors.
//!
//! Raw values are stored as supplied; every accessor clamps into the
//! supported range so that a hostile or stale config file can never push
//! the engine into a pathological sampling cadence.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const MIN_SAMPLING_INTERVAL: Duration = Duration::from_secs(1);
const MIN_MAX_DURATION: Duration = Duration::from_secs(1);
const MAX_MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
const MIN_MAX_SNAPSHOTS: u32 = 100;

/// CPU profiling event kind understood by the external sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuEvent {
    Cpu,
    Wall,
}

impl CpuEvent {
    /// Unknown strings fall back to `Cpu` rather than failing the load.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("wall") {
            CpuEvent::Wall
        } else {
            CpuEvent::Cpu
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CpuEvent::Cpu => "cpu",
            CpuEvent::Wall => "wall",
        }
    }
}

impl Default for CpuEvent {
    fn default() -> Self {
        CpuEvent::Cpu
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProfilerConfig {
    /// Seconds between performance snapshots.
    #[serde(default = "default_sampling_interval_secs")]
    pub sampling_interval_secs: u64,

    /// Hard ceiling on session length, in seconds.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Hard ceiling on accumulated snapshots.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: u32,

    /// Whether to drive the external CPU stack sampler.
    #[serde(default = "default_true")]
    pub cpu_profiling_enabled: bool,

    /// External sampler interval in milliseconds.
    #[serde(default = "default_cpu_sampling_interval_ms")]
    pub cpu_sampling_interval_ms: u64,

    /// How long cached slow-tier metrics stay fresh, in milliseconds.
    #[serde(default = "default_slow_tier_refresh_ms")]
    pub slow_tier_refresh_ms: u64,

    /// Maximum stack depth requested from the external sampler.
    #[serde(default = "default_max_stack_depth")]
    pub max_stack_depth: u32,

    /// Event the external sampler records.
    #[serde(default)]
    pub cpu_event: CpuEvent,

    /// Log the collected environment block at session start.
    #[serde(default)]
    pub debug_env_logging: bool,
}

fn default_sampling_interval_secs() -> u64 {
    1
}

fn default_max_duration_secs() -> u64 {
    3600
}

fn default_max_snapshots() -> u32 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_cpu_sampling_interval_ms() -> u64 {
    4
}

fn default_slow_tier_refresh_ms() -> u64 {
    1000
}

fn default_max_stack_depth() -> u32 {
    128
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            sampling_interval_secs: default_sampling_interval_secs(),
            max_duration_secs: default_max_duration_secs(),
            max_snapshots: default_max_snapshots(),
            cpu_profiling_enabled: true,
            cpu_sampling_interval_ms: default_cpu_sampling_interval_ms(),
            slow_tier_refresh_ms: default_slow_tier_refresh_ms(),
            max_stack_depth: default_max_stack_depth(),
            cpu_event: CpuEvent::Cpu,
            debug_env_logging: false,
        }
    }
}

impl ProfilerConfig {
    /// Loads from a TOML file, falling back to defaults when the file is
    /// missing or malformed.
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<ProfilerConfig>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_secs).max(MIN_SAMPLING_INTERVAL)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs).clamp(MIN_MAX_DURATION, MAX_MAX_DURATION)
    }

    pub fn max_snapshots(&self) -> u32 {
        self.max_snapshots.max(MIN_MAX_SNAPSHOTS)
    }

    pub fn cpu_sampling_interval_ms(&self) -> u64 {
        self.cpu_sampling_interval_ms.clamp(1, 100)
    }

    pub fn slow_tier_refresh_ms(&self) -> u64 {
        self.slow_tier_refresh_ms.clamp(100, 10_000)
    }

    pub fn max_stack_depth(&self) -> u32 {
        self.max_stack_depth.clamp(32, 512)
    }
}
