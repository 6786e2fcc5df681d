use crate::config::{CpuEvent, ProfilerConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "emberprof")]
#[command(about = "In-process performance profiler with external CPU stack sampling")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Profiler config file (TOML)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Directory for session reports
    #[arg(long, short = 'o', default_value = "./reports")]
    pub output_dir: PathBuf,

    /// Recording duration (default: configured session bound)
    #[arg(long, short = 'd', value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Interval between performance snapshots
    #[arg(long, short = 'i', value_parser = parse_duration)]
    pub interval: Option<Duration>,

    /// CPU sampling event for the external sampler (cpu or wall)
    #[arg(long)]
    pub event: Option<String>,

    /// Disable the external CPU stack sampler
    #[arg(long)]
    pub no_cpu: bool,

    /// Host config files to capture into the report preamble
    #[arg(long = "capture", value_name = "FILE")]
    pub capture: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// View top CPU hotspots from a recorded report
    Top {
        /// Report file (defaults to most recent in the current directory)
        file: Option<PathBuf>,

        /// Number of entries to display
        #[arg(long, short = 'n', default_value = "20")]
        top: usize,

        /// Minimum percentage to display
        #[arg(long, short = 't', default_value = "0")]
        threshold: f64,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Filter by method name
        #[arg(long, short = 'f')]
        filter: Option<String>,
    },

    /// List saved session reports
    List {
        /// Directory to search (defaults to current directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    // Bare numbers read as seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    Err(format!(
        "Invalid duration '{}'. Examples: 30s, 5m, 2h, 1h30m, 90",
        s
    ))
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(duration) = self.duration
            && duration < Duration::from_secs(1)
        {
            return Err("Recording duration must be at least 1 second".to_string());
        }
        if let Some(interval) = self.interval
            && interval < Duration::from_secs(1)
        {
            return Err("Snapshot interval must be at least 1 second".to_string());
        }
        if let (Some(duration), Some(interval)) = (self.duration, self.interval)
            && interval > duration
        {
            return Err("Snapshot interval cannot exceed the recording duration".to_string());
        }
        Ok(())
    }

    /// Loads the config file (or defaults) and overlays CLI flags.
    pub fn profiler_config(&self) -> ProfilerConfig {
        let mut config = match &self.config {
            Some(path) => ProfilerConfig::load_optional(path),
            None => ProfilerConfig::default(),
        };
        if let Some(duration) = self.duration {
            config.max_duration_secs = duration.as_secs();
        }
        if let Some(interval) = self.interval {
            config.sampling_interval_secs = interval.as_secs();
        }
        if let Some(event) = &self.event {
            config.cpu_event = CpuEvent::parse(event);
        }
        if self.no_cpu {
            config.cpu_profiling_enabled = false;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parser_accepts_humantime_and_bare_seconds() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn flags_overlay_the_config_file_defaults() {
        let cli = Cli::parse_from([
            "emberprof",
            "--duration",
            "2m",
            "--interval",
            "5s",
            "--event",
            "wall",
            "--no-cpu",
        ]);
        cli.validate().unwrap();
        let config = cli.profiler_config();
        assert_eq!(config.max_duration_secs, 120);
        assert_eq!(config.sampling_interval_secs, 5);
        assert_eq!(config.cpu_event, CpuEvent::Wall);
        assert!(!config.cpu_profiling_enabled);
    }

    #[test]
    fn interval_longer_than_duration_is_rejected() {
        let cli = Cli::parse_from(["emberprof", "--duration", "5s", "--interval", "10s"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::parse_from(["emberprof", "top", "report.emberprof", "-n", "5", "--json"]);
        match cli.command {
            Some(Command::Top { top, json, .. }) => {
                assert_eq!(top, 5);
                assert!(json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
