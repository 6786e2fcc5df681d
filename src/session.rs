//! One bounded profiling run: Active until stopped, then terminal.
//!
//! Activity is computed fresh on every query from three independent
//! conditions (explicit stop, duration bound, snapshot bound), so a
//! session can go inactive purely by the clock or the counter without
//! anyone calling `mark_stopped`. The sampling worker detects that
//! transition on its next tick and finalizes exactly once.

use crate::config::ProfilerConfig;
use crate::model::{PerformanceSnapshot, Preamble, ProfilerData, ProfilerMetadata};
use crate::model::CpuProfileData;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

struct SessionCore {
    metadata: ProfilerMetadata,
    preamble: Preamble,
    snapshots: Vec<PerformanceSnapshot>,
}

pub struct ProfilerSession {
    config: ProfilerConfig,
    start_time: DateTime<Utc>,
    start_instant: Instant,
    stopped: AtomicBool,
    snapshot_count: AtomicU32,
    core: Mutex<Option<SessionCore>>,
}

impl ProfilerSession {
    pub fn new(config: ProfilerConfig, metadata: ProfilerMetadata, preamble: Preamble) -> Self {
        Self {
            config,
            start_time: Utc::now(),
            start_instant: Instant::now(),
            stopped: AtomicBool::new(false),
            snapshot_count: AtomicU32::new(0),
            core: Mutex::new(Some(SessionCore {
                metadata,
                preamble,
                snapshots: Vec::new(),
            })),
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn elapsed(&self) -> Duration {
        self.start_instant.elapsed()
    }

    pub fn snapshot_count(&self) -> u32 {
        self.snapshot_count.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Evaluated fresh on every call, never cached.
    pub fn is_active(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
            && self.elapsed() < self.config.max_duration()
            && self.snapshot_count() < self.config.max_snapshots()
    }

    pub fn max_duration_reached(&self) -> bool {
        self.elapsed() >= self.config.max_duration()
    }

    pub fn max_snapshots_reached(&self) -> bool {
        self.snapshot_count() >= self.config.max_snapshots()
    }

    /// Appends a snapshot if, and only if, the session is still active.
    /// Returns whether the snapshot was admitted.
    pub fn add_snapshot(&self, snapshot: PerformanceSnapshot) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut core = self.core.lock().unwrap_or_else(|p| p.into_inner());
        let Some(core) = core.as_mut() else {
            return false;
        };
        core.snapshots.push(snapshot);
        self.snapshot_count
            .store(core.snapshots.len() as u32, Ordering::Release);
        true
    }

    /// Marks the session stopped. Returns true only for the call that
    /// made the Active -> Stopped transition.
    pub fn mark_stopped(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Consumes the accumulated state into the immutable session
    /// record. Returns `None` if the session was already finalized.
    pub fn finalize(
        &self,
        postamble: Preamble,
        cpu_profile: Option<CpuProfileData>,
    ) -> Option<ProfilerData> {
        self.mark_stopped();
        let core = self
            .core
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()?;
        let end_time = Utc::now();
        let duration = (end_time - self.start_time).to_std().unwrap_or_default();
        Some(ProfilerData {
            metadata: core.metadata,
            preamble: core.preamble,
            postamble: Some(postamble),
            start_time: self.start_time,
            end_time,
            duration,
            sampling_interval: self.config.sampling_interval(),
            snapshots: core.snapshots,
            cpu_profile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env;

    fn snapshot() -> PerformanceSnapshot {
        PerformanceSnapshot {
            timestamp: Utc::now(),
            heap: None,
            gc: None,
            threads: None,
            tick_rate: None,
            cpu: None,
            workload: None,
            io: None,
        }
    }

    fn session(config: ProfilerConfig) -> ProfilerSession {
        ProfilerSession::new(config, env::collect_metadata("test"), env::collect_preamble(&[]))
    }

    #[test]
    fn fresh_session_is_active() {
        let s = session(ProfilerConfig::default());
        assert!(s.is_active());
        assert_eq!(s.snapshot_count(), 0);
    }

    #[test]
    fn stop_is_terminal_and_reported_once() {
        let s = session(ProfilerConfig::default());
        assert!(s.mark_stopped());
        assert!(!s.mark_stopped());
        assert!(!s.is_active());
        assert!(s.is_stopped());
    }

    #[test]
    fn add_snapshot_after_stop_is_a_noop() {
        let s = session(ProfilerConfig::default());
        assert!(s.add_snapshot(snapshot()));
        s.mark_stopped();
        assert!(!s.add_snapshot(snapshot()));
        assert_eq!(s.snapshot_count(), 1);
    }

    #[test]
    fn snapshot_bound_deactivates_without_explicit_stop() {
        let s = session(ProfilerConfig::default());
        // max_snapshots clamps to 100.
        for _ in 0..100 {
            assert!(s.add_snapshot(snapshot()));
        }
        assert!(s.max_snapshots_reached());
        assert!(!s.is_active());
        assert!(!s.add_snapshot(snapshot()));
        assert_eq!(s.snapshot_count(), 100);
        // Deactivated by the counter, not by an explicit stop.
        assert!(!s.is_stopped());
    }

    #[test]
    fn duration_bound_deactivates_by_the_clock() {
        let config = ProfilerConfig {
            max_duration_secs: 1,
            ..ProfilerConfig::default()
        };
        let s = session(config);
        assert!(s.is_active());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(s.max_duration_reached());
        assert!(!s.is_active());
        assert!(!s.add_snapshot(snapshot()));
    }

    #[test]
    fn finalize_builds_immutable_record_once() {
        let s = session(ProfilerConfig::default());
        s.add_snapshot(snapshot());
        s.add_snapshot(snapshot());

        let data = s.finalize(env::collect_preamble(&[]), None).unwrap();
        assert_eq!(data.snapshots.len(), 2);
        assert_eq!(data.start_time, s.start_time());
        assert!(data.postamble.is_some());
        assert!(data.cpu_profile.is_none());
        assert!(s.is_stopped());

        // Second finalize finds nothing to consume.
        assert!(s.finalize(env::collect_preamble(&[]), None).is_none());
    }

    #[test]
    fn snapshots_preserve_insertion_order() {
        let s = session(ProfilerConfig::default());
        let mut stamps = Vec::new();
        for _ in 0..5 {
            let snap = snapshot();
            stamps.push(snap.timestamp);
            s.add_snapshot(snap);
        }
        let data = s.finalize(env::collect_preamble(&[]), None).unwrap();
        let recorded: Vec<_> = data.snapshots.iter().map(|s| s.timestamp).collect();
        assert_eq!(recorded, stamps);
    }
}
