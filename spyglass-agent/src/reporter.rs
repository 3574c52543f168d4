//! Periodic reporter
//!
//! One tick: scrape (when enabled) → snapshot and diff both trackers →
//! assemble the outbound message → submit → commit on success. A failed
//! delivery commits nothing, so the next tick re-computes against the same
//! old state and re-emits; an observation is delivered at least once under
//! persistent connectivity and at most twice across a single failure.
//!
//! Configuration is loaded once per tick, so collector updates apply at
//! tick boundaries and never mid-diff.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;

use spyglass_proto::NetworkObservations;

use crate::config::{ConfigHandle, RuntimeConfig};
use crate::conntrack::ConnectionTracker;
use crate::control::ObservationSink;
use crate::endpoints::{EndpointId, EndpointTracker};
use crate::net::{Connection, ProcessInfo};
use crate::scrape::ListeningSocketSource;
use crate::stats::PipelineStats;

pub struct Reporter {
    conn_tracker: Arc<ConnectionTracker>,
    endpoint_tracker: Arc<EndpointTracker>,
    scraper: Option<Arc<dyn ListeningSocketSource>>,
    sink: Arc<dyn ObservationSink>,
    config: Arc<ConfigHandle>,
    stats: Arc<PipelineStats>,
    host_id: String,
}

impl Reporter {
    pub fn new(
        conn_tracker: Arc<ConnectionTracker>,
        endpoint_tracker: Arc<EndpointTracker>,
        scraper: Option<Arc<dyn ListeningSocketSource>>,
        sink: Arc<dyn ObservationSink>,
        config: Arc<ConfigHandle>,
        stats: Arc<PipelineStats>,
        host_id: String,
    ) -> Self {
        Self {
            conn_tracker,
            endpoint_tracker,
            scraper,
            sink,
            config,
            stats,
            host_id,
        }
    }

    /// Tick until shutdown, then run one final best-effort flush.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut reported_evictions = 0u64;
        loop {
            let interval = self.config.load().scrape_interval;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {
                    self.tick(boot_now_micros()).await;
                    reported_evictions = self.warn_on_evictions(reported_evictions);
                }
            }
        }

        info!("reporter stopping, flushing final diff");
        self.tick(boot_now_micros()).await;
    }

    /// One reporter cycle at `now_micros` (driver clock domain).
    pub async fn tick(&self, now_micros: u64) {
        let config = self.config.load();

        if let Some(scraper) = &self.scraper {
            if !config.turn_off_scrape {
                self.run_scrape(scraper.as_ref(), now_micros, &config).await;
            }
        }

        let afterglow = config.afterglow();
        let conn_delta = self.conn_tracker.compute_delta(now_micros, afterglow);
        let endpoint_delta = self.endpoint_tracker.compute_delta(now_micros, afterglow);

        debug!(
            "tick: connections +{} -{} ={} endpoints +{} -{} ={} ({})",
            conn_delta.added.len(),
            conn_delta.removed.len(),
            conn_delta.still_open,
            endpoint_delta.added.len(),
            endpoint_delta.removed.len(),
            endpoint_delta.still_open,
            self.stats.snapshot(),
        );

        if conn_delta.is_empty() && endpoint_delta.is_empty() {
            return;
        }

        let message = self.assemble(now_micros, &conn_delta, &endpoint_delta);
        match self.sink.submit(message).await {
            Ok(()) => {
                self.conn_tracker.commit(conn_delta);
                self.endpoint_tracker.commit(endpoint_delta);
            }
            Err(err) => {
                // No commit: the next tick diffs against the same old
                // state and re-emits everything that was lost.
                warn!("observation delivery failed: {}, will retry", err);
            }
        }
    }

    async fn run_scrape(
        &self,
        scraper: &dyn ListeningSocketSource,
        now_micros: u64,
        config: &RuntimeConfig,
    ) {
        match scraper.scan().await {
            Ok(mut scraped) => {
                if !config.processes_listening_on_port {
                    for entry in &mut scraped {
                        entry.originator = None;
                    }
                }
                self.endpoint_tracker.submit_scrape(now_micros, scraped);
            }
            Err(err) => {
                warn!("listening-port scrape failed: {}", err);
            }
        }
    }

    fn assemble(
        &self,
        now_micros: u64,
        conn_delta: &crate::conntrack::Delta<Connection>,
        endpoint_delta: &crate::conntrack::Delta<EndpointId>,
    ) -> NetworkObservations {
        NetworkObservations {
            host_id: self.host_id.clone(),
            timestamp_micros: now_micros as i64,
            added_connections: conn_delta.added.iter().map(Connection::to_proto).collect(),
            removed_connections: conn_delta
                .removed
                .iter()
                .map(Connection::to_proto)
                .collect(),
            added_endpoints: endpoint_delta
                .added
                .iter()
                .map(|id| self.endpoint_proto(id))
                .collect(),
            removed_endpoints: endpoint_delta
                .removed
                .iter()
                .map(|id| self.endpoint_proto(id))
                .collect(),
        }
    }

    fn endpoint_proto(&self, id: &EndpointId) -> spyglass_proto::ListeningEndpoint {
        listening_endpoint_proto(id, self.endpoint_tracker.originator_of(id))
    }

    fn warn_on_evictions(&self, reported: u64) -> u64 {
        let total = self.conn_tracker.evictions() + self.endpoint_tracker.evictions();
        if total > reported {
            warn!(
                "tracker tables over capacity: {} entries evicted so far",
                total
            );
        }
        total
    }
}

pub fn listening_endpoint_proto(
    id: &EndpointId,
    originator: Option<ProcessInfo>,
) -> spyglass_proto::ListeningEndpoint {
    spyglass_proto::ListeningEndpoint {
        container_id: id.container_id.clone(),
        endpoint: Some(id.endpoint.to_proto()),
        protocol: id.proto.to_proto() as i32,
        originator: originator.map(|p| p.to_proto()),
    }
}

/// Microseconds on the boot clock, the same domain as driver timestamps.
pub fn boot_now_micros() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_BOOTTIME cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}
