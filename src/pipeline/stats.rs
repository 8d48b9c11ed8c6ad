//! Pipeline counters shared between stages

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for every record the pipeline drops or emits.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub events_accepted: AtomicU64,
    pub samples_accepted: AtomicU64,
    pub routes_scored: AtomicU64,
    pub malformed: AtomicU64,
    pub late_dropped: AtomicU64,
    pub duplicates: AtomicU64,
    pub severity_filtered: AtomicU64,
    pub undefined_ratio: AtomicU64,
    pub analyses: AtomicU64,
    pub alerts: AtomicU64,
    pub sink_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_accepted: u64,
    pub samples_accepted: u64,
    pub routes_scored: u64,
    pub malformed: u64,
    pub late_dropped: u64,
    pub duplicates: u64,
    pub severity_filtered: u64,
    pub undefined_ratio: u64,
    pub analyses: u64,
    pub alerts: u64,
    pub sink_failures: u64,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            samples_accepted: self.samples_accepted.load(Ordering::Relaxed),
            routes_scored: self.routes_scored.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            late_dropped: self.late_dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            severity_filtered: self.severity_filtered.load(Ordering::Relaxed),
            undefined_ratio: self.undefined_ratio.load(Ordering::Relaxed),
            analyses: self.analyses.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        log::info!(
            "📊 Ingested: {} events, {} samples, {} routes | emitted: {} analyses, {} alerts",
            s.events_accepted,
            s.samples_accepted,
            s.routes_scored,
            s.analyses,
            s.alerts
        );
        log::info!(
            "   ├─ Dropped: {} malformed, {} late, {} duplicate, {} low-severity",
            s.malformed,
            s.late_dropped,
            s.duplicates,
            s.severity_filtered
        );
        log::info!(
            "   └─ Undefined congestion ratio: {} | sink failures: {}",
            s.undefined_ratio,
            s.sink_failures
        );
    }
}
