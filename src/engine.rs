//! The profiling engine: at-most-one active session, a dedicated
//! sampling worker, and the start/stop surface.
//!
//! All sampling ticks and the finalize-and-write sequence run on one
//! worker thread, so the snapshot list only ever has a single writer. A
//! lightweight per-session ticker thread stands in for the host's
//! periodic scheduler: it does nothing but push `Tick` jobs, keeping
//! probe latency off the timing path.

use crate::collector::TieredSnapshotCollector;
use crate::config::ProfilerConfig;
use crate::env;
use crate::error::{Error, Result};
use crate::model::CpuProfileData;
use crate::probes::ProbeSet;
use crate::report;
use crate::sampler::{self, StackSampler};
use crate::session::ProfilerSession;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

enum Job {
    Tick,
    Stop {
        session: Arc<ProfilerSession>,
        reply: mpsc::Sender<Result<Option<PathBuf>>>,
    },
    Shutdown,
}

struct Shared {
    config: ProfilerConfig,
    reports_dir: PathBuf,
    host_version: String,
    preamble_paths: Vec<PathBuf>,
    /// The single active-session slot: compare-and-set on start,
    /// take-and-clear on stop. Held only for pointer swaps and clones.
    active: Mutex<Option<Arc<ProfilerSession>>>,
    sampler: Mutex<Box<dyn StackSampler>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read-only view of the active session, safe from any thread.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub active: bool,
    pub start_time: DateTime<Utc>,
    pub elapsed: Duration,
    pub snapshot_count: u32,
}

pub struct ProfilerBuilder {
    config: ProfilerConfig,
    probes: ProbeSet,
    reports_dir: PathBuf,
    host_version: String,
    preamble_paths: Vec<PathBuf>,
    sampler: Option<Box<dyn StackSampler>>,
}

impl ProfilerBuilder {
    pub fn new(config: ProfilerConfig, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            probes: ProbeSet::system(),
            reports_dir: reports_dir.into(),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            preamble_paths: Vec::new(),
            sampler: None,
        }
    }

    pub fn probes(mut self, probes: ProbeSet) -> Self {
        self.probes = probes;
        self
    }

    /// Version string of the embedding host, recorded in the report.
    pub fn host_version(mut self, version: impl Into<String>) -> Self {
        self.host_version = version.into();
        self
    }

    /// Host config files captured into the preamble and postamble.
    pub fn preamble_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.preamble_paths = paths;
        self
    }

    /// Overrides the detected external stack sampler.
    pub fn sampler(mut self, sampler: Box<dyn StackSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn build(self) -> Profiler {
        let sampler = match self.sampler {
            Some(sampler) => sampler,
            None if self.config.cpu_profiling_enabled => {
                sampler::detect(sampler::DEFAULT_SAMPLER_PROGRAM)
            }
            None => Box::new(sampler::UnavailableSampler),
        };

        let shared = Arc::new(Shared {
            reports_dir: self.reports_dir,
            host_version: self.host_version,
            preamble_paths: self.preamble_paths,
            active: Mutex::new(None),
            sampler: Mutex::new(sampler),
            config: self.config.clone(),
        });

        let collector =
            TieredSnapshotCollector::new(self.probes, self.config.slow_tier_refresh_ms());
        let (jobs, job_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("emberprof-worker".to_string())
            .spawn(move || {
                worker_loop(worker_shared, job_rx, collector);
                let _ = done_tx.send(());
            })
            .expect("failed to spawn profiler worker thread");

        Profiler {
            shared,
            jobs,
            worker: Mutex::new(Some(worker)),
            done: Mutex::new(Some(done_rx)),
        }
    }
}

pub struct Profiler {
    shared: Arc<Shared>,
    jobs: mpsc::Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
    done: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Profiler {
    pub fn builder(config: ProfilerConfig, reports_dir: impl Into<PathBuf>) -> ProfilerBuilder {
        ProfilerBuilder::new(config, reports_dir)
    }

    /// Starts a new session. Fails fast with `SessionActive` when one
    /// is already running; never replaces or queues.
    pub fn start(&self) -> Result<()> {
        let metadata = env::collect_metadata(&self.shared.host_version);
        if self.shared.config.debug_env_logging {
            tracing::debug!("session environment: {}", env::describe_environment(&metadata));
        }
        let preamble = env::collect_preamble(&self.shared.preamble_paths);
        let session = Arc::new(ProfilerSession::new(
            self.shared.config.clone(),
            metadata,
            preamble,
        ));

        // The sampler starts and the session publishes under one slot
        // guard: a stop() that takes the slot always observes a session
        // whose sampler is already running, and a session that never
        // publishes never leaves a sampler behind.
        let mut slot = lock(&self.shared.active);
        if slot.is_some() {
            return Err(Error::SessionActive);
        }

        if self.shared.config.cpu_profiling_enabled {
            let mut sampler = lock(&self.shared.sampler);
            if !sampler.is_available() {
                tracing::info!("external sampler unavailable, session runs without CPU profile");
            } else if !sampler.start(
                self.shared.config.cpu_sampling_interval_ms(),
                self.shared.config.cpu_event,
                self.shared.config.max_stack_depth(),
            ) {
                tracing::warn!("failed to start CPU sampler, continuing with metrics only");
            }
        }

        *slot = Some(Arc::clone(&session));
        drop(slot);

        self.spawn_ticker(session);
        tracing::info!("started profiling session");
        Ok(())
    }

    /// Stops the active session, finalizes it on the worker and waits
    /// for the report write. `Ok(None)` means no session was active; a
    /// write failure surfaces as the error while the in-memory
    /// finalize stands.
    pub fn stop(&self) -> Result<Option<PathBuf>> {
        let Some(session) = lock(&self.shared.active).take() else {
            return Ok(None);
        };

        let (reply, result) = mpsc::channel();
        self.jobs
            .send(Job::Stop { session, reply })
            .map_err(|_| Error::Report("profiler worker is gone".to_string()))?;
        result
            .recv()
            .map_err(|_| Error::Report("profiler worker dropped the stop request".to_string()))?
    }

    pub fn is_active(&self) -> bool {
        lock(&self.shared.active)
            .as_ref()
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    pub fn status(&self) -> Option<SessionStatus> {
        let session = lock(&self.shared.active).clone()?;
        Some(SessionStatus {
            active: session.is_active(),
            start_time: session.start_time(),
            elapsed: session.elapsed(),
            snapshot_count: session.snapshot_count(),
        })
    }

    /// Best-effort stop of any in-flight session, then drains the
    /// worker with a bounded grace period before detaching it.
    pub fn shutdown(&self) {
        match self.stop() {
            Ok(Some(path)) => tracing::info!("flushed session to {} on shutdown", path.display()),
            Ok(None) => {}
            Err(err) => tracing::warn!("failed to flush session on shutdown: {err}"),
        }
        let _ = self.jobs.send(Job::Shutdown);
        let Some(done) = lock(&self.done).take() else {
            return;
        };
        match done.recv_timeout(SHUTDOWN_GRACE) {
            // Completed or already gone; joining reaps a panic if any.
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(handle) = lock(&self.worker).take()
                    && handle.join().is_err()
                {
                    tracing::warn!("profiler worker terminated abnormally");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "profiler worker still draining after {SHUTDOWN_GRACE:?}, detaching"
                );
                drop(lock(&self.worker).take());
            }
        }
    }

    fn spawn_ticker(&self, session: Arc<ProfilerSession>) {
        let jobs = self.jobs.clone();
        let interval = session.config().sampling_interval();
        let spawned = std::thread::Builder::new()
            .name("emberprof-ticker".to_string())
            .spawn(move || {
                loop {
                    std::thread::sleep(interval);
                    if session.is_stopped() || jobs.send(Job::Tick).is_err() {
                        break;
                    }
                }
            });
        if let Err(err) = spawned {
            tracing::warn!("failed to spawn sampling ticker: {err}");
        }
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        // The worker finalizes any leftover session when the channel
        // closes; explicit shutdown() additionally joins it.
        let _ = self.jobs.send(Job::Shutdown);
    }
}

fn worker_loop(
    shared: Arc<Shared>,
    jobs: mpsc::Receiver<Job>,
    mut collector: TieredSnapshotCollector,
) {
    loop {
        match jobs.recv() {
            Ok(Job::Tick) => handle_tick(&shared, &mut collector),
            Ok(Job::Stop { session, reply }) => {
                let _ = reply.send(finalize_session(&shared, &session));
            }
            Ok(Job::Shutdown) | Err(_) => {
                if let Some(session) = lock(&shared.active).take()
                    && let Err(err) = finalize_session(&shared, &session)
                {
                    tracing::warn!("failed to finalize session during shutdown: {err}");
                }
                break;
            }
        }
    }
}

fn handle_tick(shared: &Arc<Shared>, collector: &mut TieredSnapshotCollector) {
    let Some(session) = lock(&shared.active).clone() else {
        return;
    };

    if session.is_active() {
        // A probe panic costs one tick, never the session.
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| collector.collect())) {
            Ok(snapshot) => {
                session.add_snapshot(snapshot);
            }
            Err(_) => tracing::warn!("snapshot collection panicked, tick dropped"),
        }
    }

    // The bounds may have been crossed by this tick or by the clock;
    // auto-stop exactly once via the same take-and-clear as stop().
    if !session.is_active() {
        let taken = {
            let mut slot = lock(&shared.active);
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, &session) => slot.take(),
                _ => None,
            }
        };
        if let Some(session) = taken {
            tracing::info!(
                "session reached its bounds after {} snapshots, auto-stopping",
                session.snapshot_count()
            );
            match finalize_session(shared, &session) {
                Ok(Some(path)) => tracing::info!("wrote report {}", path.display()),
                Ok(None) => {}
                Err(err) => tracing::warn!("failed to write report on auto-stop: {err}"),
            }
        }
    }
}

/// Captures the postamble, drains the CPU sampler and writes the
/// report. Runs on the worker; the caller has already removed the
/// session from the active slot.
fn finalize_session(shared: &Arc<Shared>, session: &ProfilerSession) -> Result<Option<PathBuf>> {
    session.mark_stopped();
    let postamble = env::collect_preamble(&shared.preamble_paths);

    let cpu_profile = {
        let mut sampler = lock(&shared.sampler);
        if sampler.is_running() {
            sampler.stop().map(|raw| build_cpu_profile(session, &raw))
        } else {
            None
        }
    };

    let Some(data) = session.finalize(postamble, cpu_profile) else {
        return Ok(None);
    };

    let path = report::write_report(&data, &shared.reports_dir)?;
    tracing::info!(
        "stopped profiling session: {} snapshots over {:?}",
        data.snapshots.len(),
        data.duration
    );
    Ok(Some(path))
}

/// Empty or unparseable sampler output still yields an (empty) profile;
/// only a failed export yields none at all.
fn build_cpu_profile(session: &ProfilerSession, raw: &str) -> CpuProfileData {
    let interval_ms = session.config().cpu_sampling_interval_ms();
    let samples = crate::aggregate::parse_collapsed(raw, session.start_time(), interval_ms);
    let hotspots = crate::aggregate::hotspots(&samples);
    if samples.is_empty() {
        tracing::warn!("external sampler produced no parseable stack samples");
    } else {
        tracing::info!("collected {} stack samples from external sampler", samples.len());
    }
    CpuProfileData::new(
        session.start_time(),
        Utc::now(),
        interval_ms,
        samples,
        hotspots,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuEvent;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Instant;

    fn test_config() -> ProfilerConfig {
        ProfilerConfig {
            cpu_profiling_enabled: false,
            ..ProfilerConfig::default()
        }
    }

    fn build_profiler(dir: &std::path::Path) -> Profiler {
        Profiler::builder(test_config(), dir)
            .probes(ProbeSet::disabled())
            .build()
    }

    #[test]
    fn start_stop_cycle_writes_a_report() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = build_profiler(dir.path());

        assert!(profiler.status().is_none());
        profiler.start().unwrap();
        assert!(profiler.is_active());
        let status = profiler.status().unwrap();
        assert!(status.active);
        assert_eq!(status.snapshot_count, 0);

        let path = profiler.stop().unwrap().expect("report path");
        assert!(path.exists());
        assert!(profiler.status().is_none());

        let data = report::read_report(&path).unwrap();
        assert!(data.postamble.is_some());
        assert!(data.cpu_profile.is_none());
        profiler.shutdown();
    }

    #[test]
    fn stop_without_session_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = build_profiler(dir.path());
        assert!(profiler.stop().unwrap().is_none());
        profiler.shutdown();
    }

    #[test]
    fn second_start_fails_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = build_profiler(dir.path());
        profiler.start().unwrap();
        assert!(matches!(profiler.start(), Err(Error::SessionActive)));
        profiler.stop().unwrap();
        // A new session is allowed after the old one stopped.
        profiler.start().unwrap();
        profiler.shutdown();
    }

    #[test]
    fn concurrent_starts_yield_exactly_one_success() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = Arc::new(build_profiler(dir.path()));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let successes = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let profiler = Arc::clone(&profiler);
                let barrier = Arc::clone(&barrier);
                let successes = Arc::clone(&successes);
                std::thread::spawn(move || {
                    barrier.wait();
                    if profiler.start().is_ok() {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        profiler.stop().unwrap();
        profiler.shutdown();
    }

    #[test]
    fn session_auto_stops_at_duration_bound() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProfilerConfig {
            max_duration_secs: 2,
            sampling_interval_secs: 1,
            cpu_profiling_enabled: false,
            ..ProfilerConfig::default()
        };
        let profiler = Profiler::builder(config, dir.path())
            .probes(ProbeSet::disabled())
            .build();

        profiler.start().unwrap();
        std::thread::sleep(Duration::from_millis(3500));

        // The worker noticed the bound on its own tick and finalized.
        assert!(profiler.status().is_none());
        let reports = report::find_reports(dir.path()).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].snapshot_count <= 3);
        profiler.shutdown();
    }

    #[test]
    fn sampler_output_flows_into_the_report() {
        struct FixedSampler {
            running: bool,
        }
        impl StackSampler for FixedSampler {
            fn is_available(&self) -> bool {
                true
            }
            fn start(&mut self, _: u64, _: CpuEvent, _: u32) -> bool {
                self.running = true;
                true
            }
            fn stop(&mut self) -> Option<String> {
                self.running = false;
                Some("a.C.f(F:1);a.C.g(F:2);4\n".to_string())
            }
            fn is_running(&self) -> bool {
                self.running
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = ProfilerConfig::default();
        let profiler = Profiler::builder(config, dir.path())
            .probes(ProbeSet::disabled())
            .sampler(Box::new(FixedSampler { running: false }))
            .build();

        profiler.start().unwrap();
        let path = profiler.stop().unwrap().unwrap();
        let data = report::read_report(&path).unwrap();
        let profile = data.cpu_profile.expect("cpu profile");
        assert_eq!(profile.samples.len(), 1);
        assert_eq!(profile.method_hotspots["a.C.f"], 4);
        assert_eq!(profile.method_hotspots["a.C.g"], 4);
        let sum: f64 = profile.method_percentages.values().sum();
        assert!((sum - 100.0).abs() < 1e-6);
        profiler.shutdown();
    }

    #[test]
    fn shutdown_flushes_in_flight_session() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = build_profiler(dir.path());
        profiler.start().unwrap();
        profiler.shutdown();
        let reports = report::find_reports(dir.path()).unwrap();
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn sampler_runs_before_the_session_is_visible() {
        struct SlowStartSampler {
            running: Arc<AtomicBool>,
        }
        impl StackSampler for SlowStartSampler {
            fn is_available(&self) -> bool {
                true
            }
            fn start(&mut self, _: u64, _: CpuEvent, _: u32) -> bool {
                std::thread::sleep(Duration::from_millis(150));
                self.running.store(true, Ordering::SeqCst);
                true
            }
            fn stop(&mut self) -> Option<String> {
                self.running.store(false, Ordering::SeqCst);
                Some(String::new())
            }
            fn is_running(&self) -> bool {
                self.running.load(Ordering::SeqCst)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let running = Arc::new(AtomicBool::new(false));
        let profiler = Arc::new(
            Profiler::builder(ProfilerConfig::default(), dir.path())
                .probes(ProbeSet::disabled())
                .sampler(Box::new(SlowStartSampler {
                    running: Arc::clone(&running),
                }))
                .build(),
        );

        // The slow sampler start opens a wide window; the session must
        // not become observable, nor takeable by stop(), inside it.
        let watcher_profiler = Arc::clone(&profiler);
        let watcher_running = Arc::clone(&running);
        let watcher = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if watcher_profiler.status().is_some() {
                    return Some(watcher_running.load(Ordering::SeqCst));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            None
        });

        profiler.start().unwrap();
        let sampler_running_at_publish = watcher
            .join()
            .unwrap()
            .expect("session never became visible");
        assert!(sampler_running_at_publish);

        // Stopping drains the sampler; nothing keeps running afterwards.
        profiler.stop().unwrap();
        assert!(!running.load(Ordering::SeqCst));
        assert!(profiler.status().is_none());
        profiler.shutdown();
    }

    #[test]
    fn shutdown_is_bounded_and_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = build_profiler(dir.path());
        profiler.start().unwrap();

        let begun = Instant::now();
        profiler.shutdown();
        assert!(begun.elapsed() < SHUTDOWN_GRACE);

        // A second shutdown finds the worker already drained.
        profiler.shutdown();
        assert!(profiler.status().is_none());
        assert_eq!(report::find_reports(dir.path()).unwrap().len(), 1);
    }
}
