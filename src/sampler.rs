//! Control surface around the external native stack sampler.
//!
//! The engine never links the profiler directly. It drives an
//! async-profiler-style command-line launcher against its own pid and
//! reads back collapsed-stack text. When the launcher is missing the
//! engine runs in a fully supported degraded mode without CPU data, so
//! every operation here reports failure as a value, never an error.

use crate::config::CpuEvent;
use std::path::PathBuf;
use std::process::Command;

pub const DEFAULT_SAMPLER_PROGRAM: &str = "asprof";

pub trait StackSampler: Send {
    /// Platform/library support, independent of configuration.
    fn is_available(&self) -> bool;

    /// Begins sampling. Returns false if already running or the
    /// launcher fails; the caller logs and continues without CPU data.
    fn start(&mut self, interval_ms: u64, event: CpuEvent, max_stack_depth: u32) -> bool;

    /// Ends sampling and returns raw collapsed output, if any. The
    /// running flag is cleared even when the underlying stop fails.
    fn stop(&mut self) -> Option<String>;

    fn is_running(&self) -> bool;
}

/// Selects the sampler variant once at construction: a command-backed
/// sampler when the launcher is on PATH, otherwise the no-op variant.
pub fn detect(program: &str) -> Box<dyn StackSampler> {
    match which::which(program) {
        Ok(path) => {
            tracing::info!("external stack sampler found at {}", path.display());
            Box::new(CommandSampler::new(path))
        }
        Err(_) => {
            tracing::info!("external stack sampler '{program}' not found, CPU profiling disabled");
            Box::new(UnavailableSampler)
        }
    }
}

/// Drives an external sampler launcher against the current process.
pub struct CommandSampler {
    program: PathBuf,
    pid: u32,
    running: bool,
}

impl CommandSampler {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            pid: std::process::id(),
            running: false,
        }
    }

    fn run(&self, args: &[String]) -> Option<std::process::Output> {
        match Command::new(&self.program).args(args).output() {
            Ok(output) => Some(output),
            Err(err) => {
                tracing::warn!("sampler command failed to launch: {err}");
                None
            }
        }
    }
}

impl StackSampler for CommandSampler {
    fn is_available(&self) -> bool {
        true
    }

    fn start(&mut self, interval_ms: u64, event: CpuEvent, max_stack_depth: u32) -> bool {
        if self.running {
            tracing::warn!("stack sampler already running");
            return false;
        }
        let args = vec![
            "start".to_string(),
            "-e".to_string(),
            event.as_str().to_string(),
            "-i".to_string(),
            format!("{interval_ms}ms"),
            "-j".to_string(),
            max_stack_depth.to_string(),
            self.pid.to_string(),
        ];
        match self.run(&args) {
            Some(output) if output.status.success() => {
                self.running = true;
                tracing::info!(
                    "started external stack sampler ({} event, {interval_ms}ms interval)",
                    event.as_str()
                );
                true
            }
            Some(output) => {
                tracing::warn!(
                    "stack sampler start failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                log_perf_environment();
                false
            }
            None => {
                log_perf_environment();
                false
            }
        }
    }

    fn stop(&mut self) -> Option<String> {
        if !self.running {
            return None;
        }
        // Export collapsed output before issuing the stop so the data
        // survives a failed stop call.
        let dump_args = vec![
            "dump".to_string(),
            "-o".to_string(),
            "collapsed".to_string(),
            self.pid.to_string(),
        ];
        let raw = self.run(&dump_args).and_then(|output| {
            if output.status.success() {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            } else {
                tracing::warn!(
                    "sampler dump failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
        });

        let stop_args = vec!["stop".to_string(), self.pid.to_string()];
        match self.run(&stop_args) {
            Some(output) if output.status.success() => {}
            _ => tracing::warn!("sampler stop command failed, clearing running state anyway"),
        }
        self.running = false;
        raw
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

/// Kernel perf settings that commonly block the launcher inside
/// containers. Read once when a start fails, to make the log entry
/// actionable.
#[derive(Debug, Default, PartialEq)]
pub struct PerfRestrictions {
    pub perf_event_paranoid: Option<i64>,
    pub kptr_restrict: Option<i64>,
    pub perf_event_max_sample_rate: Option<i64>,
    pub perf_event_mlock_kb: Option<i64>,
    pub cap_eff: Option<String>,
}

impl PerfRestrictions {
    pub fn detect() -> Self {
        if std::env::consts::OS != "linux" {
            return Self::default();
        }
        Self {
            perf_event_paranoid: read_i64("/proc/sys/kernel/perf_event_paranoid"),
            kptr_restrict: read_i64("/proc/sys/kernel/kptr_restrict"),
            perf_event_max_sample_rate: read_i64("/proc/sys/kernel/perf_event_max_sample_rate"),
            perf_event_mlock_kb: read_i64("/proc/sys/kernel/perf_event_mlock_kb"),
            cap_eff: std::fs::read_to_string("/proc/self/status")
                .ok()
                .and_then(|s| status_field(&s, "CapEff")),
        }
    }

    /// True when the settings are known to block perf-based sampling:
    /// paranoid >= 3, a sample-rate ceiling of 1, a 32 kB mlock budget,
    /// or a fully empty effective capability set.
    pub fn is_restricted(&self) -> bool {
        self.perf_event_paranoid.is_some_and(|v| v >= 3)
            || self.perf_event_max_sample_rate.is_some_and(|v| v <= 1)
            || self.perf_event_mlock_kb.is_some_and(|v| v <= 32)
            || self.cap_eff.as_deref() == Some("0000000000000000")
    }
}

impl std::fmt::Display for PerfRestrictions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn num(v: Option<i64>) -> String {
            v.map_or_else(|| "unavailable".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "perf_event_paranoid={} kptr_restrict={} perf_event_max_sample_rate={} \
             perf_event_mlock_kb={} CapEff={}",
            num(self.perf_event_paranoid),
            num(self.kptr_restrict),
            num(self.perf_event_max_sample_rate),
            num(self.perf_event_mlock_kb),
            self.cap_eff.as_deref().unwrap_or("unavailable"),
        )
    }
}

fn read_i64(path: &str) -> Option<i64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn status_field(contents: &str, field: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        line.strip_prefix(field)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(|rest| rest.trim().to_string())
    })
}

fn log_perf_environment() {
    let restrictions = PerfRestrictions::detect();
    if restrictions.is_restricted() {
        tracing::warn!("kernel perf settings restrict CPU profiling: {restrictions}");
    } else {
        tracing::info!("sampler environment: {restrictions}");
    }
}

/// No-op variant for platforms without the launcher.
pub struct UnavailableSampler;

impl StackSampler for UnavailableSampler {
    fn is_available(&self) -> bool {
        false
    }

    fn start(&mut self, _interval_ms: u64, _event: CpuEvent, _max_stack_depth: u32) -> bool {
        false
    }

    fn stop(&mut self) -> Option<String> {
        None
    }

    fn is_running(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_sampler_is_inert() {
        let mut sampler = UnavailableSampler;
        assert!(!sampler.is_available());
        assert!(!sampler.start(4, CpuEvent::Cpu, 128));
        assert!(!sampler.is_running());
        assert!(sampler.stop().is_none());
    }

    #[test]
    fn detect_falls_back_when_program_is_missing() {
        let sampler = detect("definitely-not-a-real-sampler-binary");
        assert!(!sampler.is_available());
    }

    #[test]
    fn perf_restriction_heuristic_matches_known_blockers() {
        assert!(!PerfRestrictions::default().is_restricted());
        assert!(
            PerfRestrictions {
                perf_event_paranoid: Some(3),
                ..Default::default()
            }
            .is_restricted()
        );
        assert!(
            !PerfRestrictions {
                perf_event_paranoid: Some(2),
                ..Default::default()
            }
            .is_restricted()
        );
        assert!(
            PerfRestrictions {
                perf_event_max_sample_rate: Some(1),
                ..Default::default()
            }
            .is_restricted()
        );
        assert!(
            PerfRestrictions {
                perf_event_mlock_kb: Some(32),
                ..Default::default()
            }
            .is_restricted()
        );
        assert!(
            PerfRestrictions {
                cap_eff: Some("0000000000000000".to_string()),
                ..Default::default()
            }
            .is_restricted()
        );
        assert!(
            !PerfRestrictions {
                cap_eff: Some("000001ffffffffff".to_string()),
                ..Default::default()
            }
            .is_restricted()
        );
    }

    #[test]
    fn status_field_extracts_exact_key() {
        let status = "Name:\tworker\nCapInh:\t0000000000000000\nCapEff:\t000001ffffffffff\n";
        assert_eq!(
            status_field(status, "CapEff").as_deref(),
            Some("000001ffffffffff")
        );
        assert_eq!(status_field(status, "CapBnd"), None);
    }

    #[test]
    fn stop_without_start_returns_nothing() {
        let mut sampler = CommandSampler::new(PathBuf::from("/bin/true"));
        assert!(sampler.stop().is_none());
    }

    #[cfg(unix)]
    mod fake_launcher {
        use super::*;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        fn write_script(dir: &std::path::Path, body: &str) -> PathBuf {
            let path = dir.join("fake-asprof");
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh\n{body}").unwrap();
            let mut perms = file.metadata().unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[test]
        fn start_dump_stop_round_trip() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(
                dir.path(),
                "case \"$1\" in dump) echo 'a.C.f(F:1);3' ;; esac\nexit 0",
            );

            let mut sampler = CommandSampler::new(script);
            assert!(sampler.is_available());
            assert!(sampler.start(4, CpuEvent::Wall, 64));
            assert!(sampler.is_running());
            // Double start fails while running.
            assert!(!sampler.start(4, CpuEvent::Cpu, 64));

            let raw = sampler.stop().unwrap();
            assert!(raw.contains("a.C.f(F:1);3"));
            assert!(!sampler.is_running());
        }

        #[test]
        fn dump_output_survives_failed_stop() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(
                dir.path(),
                "case \"$1\" in dump) echo 'a.C.f(F:1);3'; exit 0 ;; stop) exit 1 ;; esac\nexit 0",
            );

            let mut sampler = CommandSampler::new(script);
            assert!(sampler.start(4, CpuEvent::Cpu, 64));
            let raw = sampler.stop();
            assert_eq!(raw.as_deref().map(str::trim), Some("a.C.f(F:1);3"));
            // Running flag cleared even though the stop command failed.
            assert!(!sampler.is_running());
        }

        #[test]
        fn failed_start_leaves_sampler_stopped() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "exit 1");

            let mut sampler = CommandSampler::new(script);
            assert!(!sampler.start(4, CpuEvent::Cpu, 64));
            assert!(!sampler.is_running());
        }
    }
}
