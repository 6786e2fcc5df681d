//! Metric probes: the per-family query interface plus /proc-backed
//! system implementations.
//!
//! A probe must never error for "feature unsupported" — it returns
//! `None` instead, and the engine records the field as absent. On
//! platforms without procfs the system probes simply find nothing to
//! read and degrade to `None`.

use crate::model::{
    CpuMetrics, GcMetrics, HeapMetrics, IoMetrics, ThreadMetrics, TickRateMetrics, WorkloadMetrics,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// One metric family's query surface.
pub trait Probe<T>: Send {
    fn is_enabled(&self) -> bool {
        true
    }

    /// Returns the current reading, or `None` when unavailable.
    fn collect(&self) -> Option<T>;
}

/// Probe for a family the host has not wired up.
pub struct DisabledProbe;

impl<T> Probe<T> for DisabledProbe {
    fn is_enabled(&self) -> bool {
        false
    }

    fn collect(&self) -> Option<T> {
        None
    }
}

/// Adapter turning a closure into a probe, for host-supplied families
/// such as workload counters.
pub struct FnProbe<F>(F);

impl<F> FnProbe<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<T, F> Probe<T> for FnProbe<F>
where
    F: Fn() -> Option<T> + Send,
{
    fn collect(&self) -> Option<T> {
        (self.0)()
    }
}

/// The full probe set consumed by the snapshot collector.
pub struct ProbeSet {
    pub heap: Box<dyn Probe<HeapMetrics>>,
    pub gc: Box<dyn Probe<GcMetrics>>,
    pub threads: Box<dyn Probe<ThreadMetrics>>,
    pub tick_rate: Box<dyn Probe<TickRateMetrics>>,
    pub cpu: Box<dyn Probe<CpuMetrics>>,
    pub workload: Box<dyn Probe<WorkloadMetrics>>,
    pub io: Box<dyn Probe<IoMetrics>>,
}

impl ProbeSet {
    /// Every family disabled. Useful for tests and minimal embeddings.
    pub fn disabled() -> Self {
        Self {
            heap: Box::new(DisabledProbe),
            gc: Box::new(DisabledProbe),
            threads: Box::new(DisabledProbe),
            tick_rate: Box::new(DisabledProbe),
            cpu: Box::new(DisabledProbe),
            workload: Box::new(DisabledProbe),
            io: Box::new(DisabledProbe),
        }
    }

    /// Process-level system probes. GC, tick-rate and workload stay
    /// disabled until the host wires its own in.
    pub fn system() -> Self {
        Self {
            heap: Box::new(SystemHeapProbe),
            gc: Box::new(DisabledProbe),
            threads: Box::new(SystemThreadProbe::new()),
            tick_rate: Box::new(DisabledProbe),
            cpu: Box::new(SystemCpuProbe::new()),
            workload: Box::new(DisabledProbe),
            io: Box::new(SystemIoProbe::new()),
        }
    }
}

fn available_processors() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Reads a `Key: value` line (kB-suffixed values in /proc status files).
pub(crate) fn proc_field(contents: &str, key: &str) -> Option<u64> {
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            let rest = rest.trim_start_matches(':').trim();
            let value = rest.split_whitespace().next()?;
            return value.parse::<u64>().ok();
        }
    }
    None
}

/// Resident set and address-space size of the current process.
pub struct SystemHeapProbe;

impl Probe<HeapMetrics> for SystemHeapProbe {
    fn collect(&self) -> Option<HeapMetrics> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let used = proc_field(&status, "VmRSS")? * 1024;
        let committed = proc_field(&status, "VmSize").unwrap_or(0) * 1024;
        let max = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|m| proc_field(&m, "MemTotal"))
            .map(|kb| kb * 1024)
            .unwrap_or(0);
        Some(HeapMetrics::new(used, max, committed))
    }
}

/// Enumerates /proc/self/task, histogramming kernel scheduler states.
/// Deliberately slow-tier: the walk touches one file per thread.
pub struct SystemThreadProbe {
    peak: Mutex<u32>,
}

impl SystemThreadProbe {
    pub fn new() -> Self {
        Self { peak: Mutex::new(0) }
    }
}

impl Default for SystemThreadProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe<ThreadMetrics> for SystemThreadProbe {
    fn collect(&self) -> Option<ThreadMetrics> {
        let tasks = std::fs::read_dir("/proc/self/task").ok()?;
        let mut total = 0u32;
        let mut by_state: BTreeMap<String, u32> = BTreeMap::new();
        for entry in tasks.flatten() {
            total += 1;
            let stat_path = entry.path().join("stat");
            if let Ok(stat) = std::fs::read_to_string(stat_path)
                && let Some(state) = task_state(&stat)
            {
                *by_state.entry(state.to_string()).or_insert(0) += 1;
            }
        }
        if total == 0 {
            return None;
        }
        let peak = {
            let mut peak = self.peak.lock().unwrap_or_else(|p| p.into_inner());
            *peak = (*peak).max(total);
            *peak
        };
        Some(ThreadMetrics {
            total_threads: total,
            peak_threads: peak,
            // procfs exposes no started-thread counter.
            total_started_threads: 0,
            threads_by_state: by_state,
        })
    }
}

/// Extracts the state character from a task stat line. The comm field
/// is parenthesized and may contain spaces, so scan from its close.
fn task_state(stat: &str) -> Option<char> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().next()?.chars().next()
}

struct CpuBaseline {
    at: Instant,
    process_ticks: u64,
    system_busy: u64,
    system_total: u64,
}

/// Process and system CPU load from utime/stime deltas. The first call
/// only establishes the baseline and reports loads as unknown.
pub struct SystemCpuProbe {
    baseline: Mutex<Option<CpuBaseline>>,
}

impl SystemCpuProbe {
    pub fn new() -> Self {
        Self {
            baseline: Mutex::new(None),
        }
    }

    fn read_process_ticks() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        let after_comm = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        // Fields after comm: state is index 0, utime 11, stime 12.
        let utime = fields.get(11)?.parse::<u64>().ok()?;
        let stime = fields.get(12)?.parse::<u64>().ok()?;
        Some(utime + stime)
    }

    fn read_system_ticks() -> Option<(u64, u64)> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let cpu = stat.lines().next()?;
        let values: Vec<u64> = cpu
            .split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.len() < 4 {
            return None;
        }
        let total: u64 = values.iter().sum();
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        Some((total - idle, total))
    }
}

impl Default for SystemCpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe<CpuMetrics> for SystemCpuProbe {
    fn collect(&self) -> Option<CpuMetrics> {
        let nprocs = available_processors();
        let process_ticks = Self::read_process_ticks()?;
        let (system_busy, system_total) = Self::read_system_ticks().unwrap_or((0, 0));
        let now = Instant::now();

        let mut guard = self.baseline.lock().unwrap_or_else(|p| p.into_inner());
        let previous = guard.replace(CpuBaseline {
            at: now,
            process_ticks,
            system_busy,
            system_total,
        });
        drop(guard);

        let Some(prev) = previous else {
            return Some(CpuMetrics::unavailable(nprocs));
        };

        let wall_secs = now.duration_since(prev.at).as_secs_f64();
        if wall_secs <= 0.0 {
            return Some(CpuMetrics::unavailable(nprocs));
        }

        let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let clk_tck = if clk_tck > 0 { clk_tck as f64 } else { 100.0 };
        let cpu_secs = process_ticks.saturating_sub(prev.process_ticks) as f64 / clk_tck;
        let process_load = (cpu_secs / (wall_secs * nprocs as f64)).clamp(0.0, 1.0);

        let system_load = {
            let busy = system_busy.saturating_sub(prev.system_busy);
            let total = system_total.saturating_sub(prev.system_total);
            if total > 0 {
                (busy as f64 / total as f64).clamp(0.0, 1.0)
            } else {
                -1.0
            }
        };

        Some(CpuMetrics {
            process_cpu_load: process_load,
            system_cpu_load: system_load,
            available_processors: nprocs,
            available: true,
        })
    }
}

#[derive(Clone, Copy)]
struct IoCounters {
    read_bytes: u64,
    write_bytes: u64,
    read_ops: u64,
    write_ops: u64,
}

/// I/O throughput from /proc/self/io, with deltas against the counters
/// seen when the probe was constructed.
pub struct SystemIoProbe {
    start: Mutex<Option<IoCounters>>,
}

impl SystemIoProbe {
    pub fn new() -> Self {
        Self {
            start: Mutex::new(None),
        }
    }

    fn read_counters() -> Option<IoCounters> {
        let io = std::fs::read_to_string("/proc/self/io").ok()?;
        let field = |key: &str| proc_field(&io, key);
        Some(IoCounters {
            read_bytes: field("read_bytes")?,
            write_bytes: field("write_bytes")?,
            read_ops: field("syscr").unwrap_or(0),
            write_ops: field("syscw").unwrap_or(0),
        })
    }
}

impl Default for SystemIoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe<IoMetrics> for SystemIoProbe {
    fn collect(&self) -> Option<IoMetrics> {
        let current = Self::read_counters()?;
        let mut guard = self.start.lock().unwrap_or_else(|p| p.into_inner());
        let start = *guard.get_or_insert(current);
        drop(guard);
        Some(IoMetrics {
            read_bytes: current.read_bytes,
            write_bytes: current.write_bytes,
            read_ops: current.read_ops,
            write_ops: current.write_ops,
            since_start_read_bytes: current.read_bytes.saturating_sub(start.read_bytes),
            since_start_write_bytes: current.write_bytes.saturating_sub(start.write_bytes),
            since_start_read_ops: current.read_ops.saturating_sub(start.read_ops),
            since_start_write_ops: current.write_ops.saturating_sub(start.write_ops),
        })
    }
}

const TICK_WINDOW: usize = 128;

struct TickState {
    started: Instant,
    total_ticks: u64,
    recent: VecDeque<Instant>,
    min_rate: f64,
    max_rate: f64,
}

/// Shared tick counter the host feeds from its main loop. The derived
/// probe turns recorded ticks into current/average/min/max rates.
pub struct TickTracker {
    state: Mutex<TickState>,
}

impl TickTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TickState {
                started: Instant::now(),
                total_ticks: 0,
                recent: VecDeque::with_capacity(TICK_WINDOW),
                min_rate: f64::MAX,
                max_rate: 0.0,
            }),
        })
    }

    /// Called by the host once per tick of its main loop.
    pub fn record_tick(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.total_ticks += 1;
        if state.recent.len() == TICK_WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(Instant::now());
    }

    /// A probe view over this tracker.
    pub fn probe(self: &Arc<Self>) -> TickRateProbe {
        TickRateProbe {
            tracker: Arc::clone(self),
        }
    }
}

pub struct TickRateProbe {
    tracker: Arc<TickTracker>,
}

impl Probe<TickRateMetrics> for TickRateProbe {
    fn collect(&self) -> Option<TickRateMetrics> {
        let mut state = self
            .tracker
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if state.recent.len() < 2 {
            return None;
        }

        let span = state
            .recent
            .back()?
            .duration_since(*state.recent.front()?)
            .as_secs_f64();
        if span <= 0.0 {
            return None;
        }
        let current = (state.recent.len() - 1) as f64 / span;

        let elapsed = state.started.elapsed().as_secs_f64();
        let average = if elapsed > 0.0 {
            state.total_ticks as f64 / elapsed
        } else {
            current
        };

        state.min_rate = state.min_rate.min(current);
        state.max_rate = state.max_rate.max(current);

        Some(TickRateMetrics {
            current,
            average,
            min: state.min_rate,
            max: state.max_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_probe_reports_disabled() {
        let probe = DisabledProbe;
        assert!(!Probe::<HeapMetrics>::is_enabled(&probe));
        assert!(Probe::<HeapMetrics>::collect(&probe).is_none());
    }

    #[test]
    fn fn_probe_delegates_to_closure() {
        let probe = FnProbe::new(|| {
            Some(WorkloadMetrics {
                counters: [("entities".to_string(), 42)].into_iter().collect(),
            })
        });
        let metrics = probe.collect().unwrap();
        assert_eq!(metrics.counters["entities"], 42);
        assert!(probe.is_enabled());
    }

    #[test]
    fn proc_field_parses_kb_lines() {
        let text = "VmPeak:\t  101 kB\nVmRSS:\t   52 kB\nThreads:\t4\n";
        assert_eq!(proc_field(text, "VmRSS"), Some(52));
        assert_eq!(proc_field(text, "Threads"), Some(4));
        assert_eq!(proc_field(text, "Missing"), None);
    }

    #[test]
    fn task_state_survives_spaces_in_comm() {
        let stat = "123 (some proc) S 1 123 123 0 -1";
        assert_eq!(task_state(stat), Some('S'));
    }

    #[test]
    fn tick_tracker_needs_two_ticks() {
        let tracker = TickTracker::new();
        let probe = tracker.probe();
        assert!(probe.collect().is_none());
        tracker.record_tick();
        assert!(probe.collect().is_none());
    }

    #[test]
    fn tick_tracker_derives_rates() {
        let tracker = TickTracker::new();
        let probe = tracker.probe();
        for _ in 0..5 {
            tracker.record_tick();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let metrics = probe.collect().unwrap();
        assert!(metrics.current > 0.0);
        assert!(metrics.max >= metrics.min);
        assert!(metrics.average > 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn system_probes_read_procfs() {
        let heap = SystemHeapProbe.collect().unwrap();
        assert!(heap.used_bytes > 0);

        let threads = SystemThreadProbe::new().collect().unwrap();
        assert!(threads.total_threads >= 1);
        assert!(threads.peak_threads >= threads.total_threads);

        let cpu_probe = SystemCpuProbe::new();
        // First reading establishes the baseline only.
        let first = cpu_probe.collect().unwrap();
        assert!(!first.available);
        let second = cpu_probe.collect().unwrap();
        assert!(second.available);
        assert!(second.process_cpu_load >= 0.0);
    }
}
