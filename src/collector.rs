//! Tiered snapshot collection.
//!
//! Thread enumeration and heap walks cost far more than reading a tick
//! rate, so the collector refreshes the expensive "slow tier" (heap,
//! gc, threads, workload, io) only once per refresh window and re-reads
//! the cheap volatile "fast tier" (tick rate, cpu) every snapshot. The
//! cached baseline lives on the sampling worker thread, which is the
//! only reader and writer, so it needs no synchronization.

use crate::model::PerformanceSnapshot;
use crate::probes::ProbeSet;
use chrono::Utc;
use std::time::{Duration, Instant};

pub struct TieredSnapshotCollector {
    probes: ProbeSet,
    refresh_interval: Duration,
    last_full: Option<PerformanceSnapshot>,
    last_full_at: Option<Instant>,
}

impl TieredSnapshotCollector {
    pub fn new(probes: ProbeSet, refresh_interval_ms: u64) -> Self {
        Self {
            probes,
            refresh_interval: Duration::from_millis(refresh_interval_ms),
            last_full: None,
            last_full_at: None,
        }
    }

    /// Produces one snapshot, refreshing the slow-tier baseline when it
    /// is stale or absent.
    pub fn collect(&mut self) -> PerformanceSnapshot {
        let now = Instant::now();
        let stale = match self.last_full_at {
            Some(at) => now.duration_since(at) >= self.refresh_interval,
            None => true,
        };

        if stale || self.last_full.is_none() {
            let snapshot = PerformanceSnapshot {
                timestamp: Utc::now(),
                heap: self.probes.heap.collect(),
                gc: self.probes.gc.collect(),
                threads: self.probes.threads.collect(),
                tick_rate: self.probes.tick_rate.collect(),
                cpu: self.probes.cpu.collect(),
                workload: self.probes.workload.collect(),
                io: self.probes.io.collect(),
            };
            self.last_full = Some(snapshot.clone());
            self.last_full_at = Some(now);
            return snapshot;
        }

        // Reuse cached slow-tier fields, re-query only the fast tier. A
        // disabled probe cached as None stays None for the session.
        let cached = self.last_full.as_ref().expect("baseline checked above");
        PerformanceSnapshot {
            timestamp: Utc::now(),
            heap: cached.heap.clone(),
            gc: cached.gc.clone(),
            threads: cached.threads.clone(),
            workload: cached.workload.clone(),
            io: cached.io.clone(),
            tick_rate: self.probes.tick_rate.collect(),
            cpu: self.probes.cpu.collect(),
        }
    }
}
