//! Ingestion counters
//!
//! Per-class drop and processing counters for the event path. Malformed or
//! filtered events are dropped silently by design; these counters are the
//! only trace they leave. All counters are atomics so handlers can bump
//! them while holding a tracker lock.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct PipelineStats {
    pub events_processed: AtomicU64,
    pub events_ignored: AtomicU64,
    pub failed_result: AtomicU64,
    pub missing_fd_info: AtomicU64,
    pub unsupported_proto: AtomicU64,
    pub no_container: AtomicU64,
    pub filtered: AtomicU64,
    pub malformed: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_processed: u64,
    pub events_ignored: u64,
    pub failed_result: u64,
    pub missing_fd_info: u64,
    pub unsupported_proto: u64,
    pub no_container: u64,
    pub filtered: u64,
    pub malformed: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            failed_result: self.failed_result.load(Ordering::Relaxed),
            missing_fd_info: self.missing_fd_info.load(Ordering::Relaxed),
            unsupported_proto: self.unsupported_proto.load(Ordering::Relaxed),
            no_container: self.no_container.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={} ignored={} failed_res={} no_fd={} bad_proto={} no_container={} filtered={} malformed={}",
            self.events_processed,
            self.events_ignored,
            self.failed_result,
            self.missing_fd_info,
            self.unsupported_proto,
            self.no_container,
            self.filtered,
            self.malformed,
        )
    }
}
