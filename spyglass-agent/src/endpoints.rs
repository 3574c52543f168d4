//! Listening endpoint tracker
//!
//! Tracks bound sockets per container from two merged sources: the periodic
//! listening-port scrape (a complete enumeration at a point in time) and
//! syscall-driven deltas (listen/close/shutdown) arriving between scrapes.
//!
//! Merge rule: a scrape at `T_s` is authoritative for everything it does
//! not mention - entries last seen before `T_s` and absent from the scrape
//! are marked inactive at `T_s`. Syscall events always apply. Originator
//! attribution prefers the syscall source; a scrape never downgrades it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::conntrack::{ConnStatus, Delta, DeltaTable};
use crate::net::{Endpoint, L4Proto, ProcessInfo};

/// Identity of a listening endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId {
    pub container_id: String,
    pub endpoint: Endpoint,
    pub proto: L4Proto,
}

/// One bound socket from a scrape pass.
#[derive(Clone, Debug)]
pub struct ScrapedEndpoint {
    pub container_id: String,
    pub endpoint: Endpoint,
    pub proto: L4Proto,
    pub originator: Option<ProcessInfo>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OriginSource {
    Scrape,
    Syscall,
}

pub struct EndpointTracker {
    table: DeltaTable<EndpointId>,
    originators: Mutex<HashMap<EndpointId, (ProcessInfo, OriginSource)>>,
}

impl EndpointTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            table: DeltaTable::new(cap),
            originators: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one syscall observation. `is_add` is true for listen, false
    /// for close/shutdown of a listening socket.
    pub fn update_endpoint(
        &self,
        id: EndpointId,
        ts_micros: u64,
        is_add: bool,
        originator: Option<ProcessInfo>,
    ) {
        self.table.update(id.clone(), ts_micros, is_add);
        if let Some(info) = originator {
            self.originators
                .lock()
                .unwrap()
                .insert(id, (info, OriginSource::Syscall));
        }
    }

    /// Merge a complete scrape taken at `scrape_ts_micros`.
    pub fn submit_scrape(&self, scrape_ts_micros: u64, scraped: Vec<ScrapedEndpoint>) {
        let mut present: HashSet<EndpointId> = HashSet::with_capacity(scraped.len());

        for entry in &scraped {
            let id = EndpointId {
                container_id: entry.container_id.clone(),
                endpoint: entry.endpoint,
                proto: entry.proto,
            };
            present.insert(id.clone());
            self.table.with_entry(
                id,
                ConnStatus::new(scrape_ts_micros, true),
                |status| {
                    if scrape_ts_micros >= status.last_active_micros {
                        status.active = true;
                        status.last_active_micros = scrape_ts_micros;
                    }
                },
            );
        }

        // Anything the scrape did not see and that had no activity since
        // the pass started is gone.
        self.table.for_each(|id, status| {
            if !present.contains(id) && status.last_active_micros < scrape_ts_micros {
                status.active = false;
                status.last_active_micros = scrape_ts_micros;
            }
        });

        let mut originators = self.originators.lock().unwrap();
        for entry in scraped {
            let Some(info) = entry.originator else {
                continue;
            };
            let id = EndpointId {
                container_id: entry.container_id,
                endpoint: entry.endpoint,
                proto: entry.proto,
            };
            match originators.get(&id) {
                // The syscall event pinpoints the owning process; an
                // inode-level scrape inference must not replace it.
                Some((_, OriginSource::Syscall)) => {}
                _ => {
                    originators.insert(id, (info, OriginSource::Scrape));
                }
            }
        }
    }

    pub fn originator_of(&self, id: &EndpointId) -> Option<ProcessInfo> {
        self.originators
            .lock()
            .unwrap()
            .get(id)
            .map(|(info, _)| info.clone())
    }

    pub fn compute_delta(
        &self,
        now_micros: u64,
        afterglow_micros: Option<u64>,
    ) -> Delta<EndpointId> {
        self.table.compute_delta(now_micros, afterglow_micros)
    }

    pub fn commit(&self, delta: Delta<EndpointId>) {
        let reaped = self.table.commit(delta);
        if !reaped.is_empty() {
            let mut originators = self.originators.lock().unwrap();
            for id in &reaped {
                originators.remove(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn evictions(&self) -> u64 {
        self.table.evictions()
    }
}

impl Default for EndpointTracker {
    fn default() -> Self {
        Self::new(crate::conntrack::DEFAULT_TABLE_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Address;

    fn id(port: u16) -> EndpointId {
        EndpointId {
            container_id: "c1".to_string(),
            endpoint: Endpoint::new(Address::from_v4_octets([0, 0, 0, 0]), port),
            proto: L4Proto::Tcp,
        }
    }

    fn scraped(port: u16, pid: u32) -> ScrapedEndpoint {
        ScrapedEndpoint {
            container_id: "c1".to_string(),
            endpoint: Endpoint::new(Address::from_v4_octets([0, 0, 0, 0]), port),
            proto: L4Proto::Tcp,
            originator: Some(ProcessInfo {
                name: "srv".to_string(),
                pid,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_listen_then_close() {
        let tracker = EndpointTracker::new(16);
        tracker.update_endpoint(id(8080), 1_000_000, true, None);

        let delta = tracker.compute_delta(2_000_000, None);
        assert_eq!(delta.added, vec![id(8080)]);
        tracker.commit(delta);

        tracker.update_endpoint(id(8080), 3_000_000, false, None);
        let delta = tracker.compute_delta(4_000_000, None);
        assert_eq!(delta.removed, vec![id(8080)]);
        tracker.commit(delta);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_scrape_adds_and_reaps_absent() {
        let tracker = EndpointTracker::new(16);
        tracker.submit_scrape(1_000_000, vec![scraped(80, 10), scraped(443, 11)]);

        let delta = tracker.compute_delta(2_000_000, None);
        assert_eq!(delta.added, vec![id(80), id(443)]);
        tracker.commit(delta);

        // Next scrape no longer sees :443.
        tracker.submit_scrape(3_000_000, vec![scraped(80, 10)]);
        let delta = tracker.compute_delta(4_000_000, None);
        assert_eq!(delta.removed, vec![id(443)]);
        assert!(delta.added.is_empty());
    }

    #[test]
    fn test_syscall_after_scrape_start_survives_merge() {
        let tracker = EndpointTracker::new(16);
        tracker.submit_scrape(1_000_000, vec![scraped(80, 10)]);
        tracker.update_endpoint(id(9090), 2_000_000, true, None);

        // Scrape pass stamped before the listen arrived must not kill it.
        tracker.submit_scrape(1_500_000, Vec::new());
        let delta = tracker.compute_delta(3_000_000, None);
        assert!(delta.added.contains(&id(9090)));
        assert!(delta.removed.contains(&id(80)));
    }

    #[test]
    fn test_syscall_originator_wins_over_scrape() {
        let tracker = EndpointTracker::new(16);
        let syscall_proc = ProcessInfo {
            name: "nginx".to_string(),
            pid: 99,
            ..Default::default()
        };
        tracker.update_endpoint(id(80), 1_000_000, true, Some(syscall_proc.clone()));

        tracker.submit_scrape(2_000_000, vec![scraped(80, 10)]);
        assert_eq!(tracker.originator_of(&id(80)), Some(syscall_proc));
    }

    #[test]
    fn test_scrape_refreshes_scrape_sourced_originator() {
        let tracker = EndpointTracker::new(16);
        tracker.submit_scrape(1_000_000, vec![scraped(80, 10)]);
        tracker.submit_scrape(2_000_000, vec![scraped(80, 20)]);

        assert_eq!(tracker.originator_of(&id(80)).unwrap().pid, 20);
    }

    #[test]
    fn test_originator_pruned_with_reap() {
        let tracker = EndpointTracker::new(16);
        tracker.update_endpoint(id(80), 1_000_000, true, Some(ProcessInfo::default()));
        tracker.commit(tracker.compute_delta(2_000_000, None));

        tracker.update_endpoint(id(80), 3_000_000, false, None);
        tracker.commit(tracker.compute_delta(4_000_000, None));

        assert_eq!(tracker.len(), 0);
        assert_eq!(tracker.originator_of(&id(80)), None);
    }

    #[test]
    fn test_afterglow_applies_per_endpoint() {
        let tracker = EndpointTracker::new(16);
        tracker.update_endpoint(id(80), 1_000_000, true, None);
        tracker.update_endpoint(id(80), 1_500_000, false, None);
        tracker.update_endpoint(id(80), 2_000_000, true, None);
        tracker.update_endpoint(id(80), 2_500_000, false, None);

        let delta = tracker.compute_delta(3_000_000, Some(5_000_000));
        assert_eq!(delta.added, vec![id(80)]);
        assert!(delta.removed.is_empty());
    }
}
