//! Environment metadata and host configuration capture.
//!
//! The metadata block describes the machine and process a report came
//! from. The preamble/postamble capture host config files at session
//! start and stop so a report reader can diff before/after state.
//! Anything that smells like a credential is redacted before it leaves
//! the process.

use crate::model::{
    ConfigDump, EnvironmentInfo, FORMAT_VERSION, Preamble, ProfilerMetadata, UNKNOWN,
};
use crate::probes::proc_field;
use chrono::Utc;
use std::path::{Path, PathBuf};

const REDACTED: &str = "***redacted***";
const SENSITIVE_CONFIG_KEYS: &[&str] = &["password", "token", "secret"];

/// Argument prefixes that may carry PII or credentials.
const SENSITIVE_ARG_PREFIXES: &[&str] = &[
    "--user",
    "--home",
    "--password",
    "--token",
    "--secret",
    "--api-key",
    "--auth",
];

pub fn collect_metadata(host_version: &str) -> ProfilerMetadata {
    let max_memory_bytes = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|m| proc_field(&m, "MemTotal"))
        .map(|kb| kb * 1024)
        .unwrap_or(0);

    ProfilerMetadata {
        format_version: FORMAT_VERSION,
        host_version: host_version.to_string(),
        created_at: Utc::now(),
        environment: EnvironmentInfo {
            os_name: std::env::consts::OS.to_string(),
            os_version: os_version(),
            architecture: std::env::consts::ARCH.to_string(),
            runtime_version: format!("emberprof/{}", env!("CARGO_PKG_VERSION")),
            cpu_model: cpu_model(),
            available_processors: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            max_memory_bytes,
            args: sanitize_args(std::env::args().skip(1)),
        },
    }
}

fn os_version() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Best-effort CPU model string; absence is not an error.
fn cpu_model() -> Option<String> {
    match std::env::consts::OS {
        "linux" => {
            let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
            for line in cpuinfo.lines() {
                let mut parts = line.splitn(2, ':');
                let key = parts.next()?.trim();
                if key == "model name" || key == "Processor" {
                    return parts.next().map(|v| v.trim().to_string());
                }
            }
            None
        }
        "macos" => std::process::Command::new("sysctl")
            .args(["-n", "machdep.cpu.brand_string"])
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

/// Strips flags that may carry PII, along with their detached values.
pub fn sanitize_args(args: impl Iterator<Item = String>) -> Vec<String> {
    let mut sanitized = Vec::new();
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        let lowered = arg.to_ascii_lowercase();
        let sensitive = SENSITIVE_ARG_PREFIXES
            .iter()
            .any(|prefix| lowered.starts_with(prefix));
        if sensitive {
            // `--flag value` carries the value in the next token.
            skip_value = !arg.contains('=');
            continue;
        }
        sanitized.push(arg);
    }
    sanitized
}

/// Captures the named host config files, redacting sensitive JSON keys.
pub fn collect_preamble(paths: &[PathBuf]) -> Preamble {
    Preamble {
        captured_at: Utc::now(),
        configs: paths.iter().map(|p| dump_config(p)).collect(),
    }
}

fn dump_config(path: &Path) -> ConfigDump {
    let display = path.display().to_string();
    if !path.exists() {
        return ConfigDump {
            path: display,
            contents: None,
            error: Some("file not found".to_string()),
        };
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => ConfigDump {
            path: display,
            contents: Some(redact_json(&contents)),
            error: None,
        },
        Err(err) => ConfigDump {
            path: display,
            contents: None,
            error: Some(err.to_string()),
        },
    }
}

/// Replaces sensitive values in JSON contents. Non-JSON files pass
/// through untouched.
fn redact_json(contents: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(contents) {
        Ok(mut value) => {
            redact_value(&mut value);
            value.to_string()
        }
        Err(_) => contents.to_string(),
    }
}

fn redact_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                let lowered = key.to_ascii_lowercase();
                if SENSITIVE_CONFIG_KEYS.iter().any(|s| lowered.contains(s)) {
                    *entry = serde_json::Value::String(REDACTED.to_string());
                } else {
                    redact_value(entry);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                redact_value(item);
            }
        }
        _ => {}
    }
}

/// Logged at session start when `debug_env_logging` is set.
pub fn describe_environment(metadata: &ProfilerMetadata) -> String {
    let env = &metadata.environment;
    format!(
        "os={} {} arch={} cpus={} cpu_model={} mem={}B",
        env.os_name,
        env.os_version.as_deref().unwrap_or(UNKNOWN),
        env.architecture,
        env.available_processors,
        env.cpu_model.as_deref().unwrap_or(UNKNOWN),
        env.max_memory_bytes,
    )
}
