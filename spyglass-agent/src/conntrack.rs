//! Connection tracker
//!
//! Stateful map of live network tuples with the two-phase activity
//! lifecycle, the afterglow suppression window, and per-tick delta
//! computation against the last delivered report.
//!
//! Locking: one coarse mutex around the entry map, held only for O(1)
//! map operations and the snapshot copy at diff time. No I/O and no
//! logging under the lock; overflow accounting is an atomic counter.
//!
//! The "old state" image (what the collector last acknowledged) lives in
//! its own mutex but is only ever touched by the reporter task.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::net::Connection;

/// Default hard cap per tracker table.
pub const DEFAULT_TABLE_CAP: usize = 65_536;

/// Victims collected per eviction sweep, so the at-cap scan amortizes
/// across inserts instead of running once per event.
const EVICT_BATCH: usize = 64;

/// Activity state of one tracked identity.
///
/// `last_active_micros` is monotone within a kernel generation: updates
/// apply `max`, so cross-CPU ringbuffer disorder cannot move it backwards.
/// The event carrying the greatest timestamp decides `active` (on a tie the
/// later arrival wins).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnStatus {
    pub last_active_micros: u64,
    pub active: bool,
}

impl ConnStatus {
    pub fn new(ts_micros: u64, active: bool) -> Self {
        Self {
            last_active_micros: ts_micros,
            active,
        }
    }

    fn merge(&mut self, ts_micros: u64, is_add: bool) {
        if ts_micros >= self.last_active_micros {
            self.active = is_add;
        }
        self.last_active_micros = self.last_active_micros.max(ts_micros);
    }

    /// Activity as the external observer should see it: an inactive entry
    /// still inside the afterglow window counts as active, which is what
    /// collapses rapid open/close churn into one continuous connection.
    pub fn effective_active(&self, now_micros: u64, afterglow_micros: Option<u64>) -> bool {
        if self.active {
            return true;
        }
        match afterglow_micros {
            Some(window) => now_micros.saturating_sub(self.last_active_micros) < window,
            None => false,
        }
    }
}

/// One tick's diff. `added` and `removed` are disjoint except for
/// identities that appeared and went inactive between two reports, which
/// show up in both so the receiver always sees an add before its remove.
/// Still-open identities are implicit and only counted.
#[derive(Debug)]
pub struct Delta<K> {
    pub added: Vec<K>,
    pub removed: Vec<K>,
    pub still_open: usize,
    new_reported: HashSet<K>,
    reaped: Vec<(K, u64)>,
}

impl<K> Delta<K> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Shared delta machinery for both trackers: mutex-guarded entry map,
/// reported-state image, commit-on-ack, reap, hard cap.
pub(crate) struct DeltaTable<K> {
    entries: Mutex<HashMap<K, ConnStatus>>,
    reported: Mutex<HashSet<K>>,
    cap: usize,
    evictions: AtomicU64,
}

impl<K> DeltaTable<K>
where
    K: Clone + Eq + Hash + Ord,
{
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            reported: Mutex::new(HashSet::new()),
            cap,
            evictions: AtomicU64::new(0),
        }
    }

    /// Apply one add/remove observation at `ts_micros`.
    pub fn update(&self, key: K, ts_micros: u64, is_add: bool) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&key) {
            Some(status) => status.merge(ts_micros, is_add),
            None => {
                if entries.len() >= self.cap {
                    let evicted = evict_batch(&mut entries);
                    self.evictions.fetch_add(evicted, Ordering::Relaxed);
                }
                entries.insert(key, ConnStatus::new(ts_micros, is_add));
            }
        }
    }

    /// Visit an entry's status in place, inserting a fresh one when absent.
    /// Used by the endpoint tracker's scrape merge.
    pub fn with_entry<F>(&self, key: K, default: ConnStatus, visit: F)
    where
        F: FnOnce(&mut ConnStatus),
    {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&key) {
            Some(status) => visit(status),
            None => {
                if entries.len() >= self.cap {
                    let evicted = evict_batch(&mut entries);
                    self.evictions.fetch_add(evicted, Ordering::Relaxed);
                }
                let status = entries.entry(key).or_insert(default);
                visit(status);
            }
        }
    }

    /// Run `visit` over every (key, status) pair under the lock. O(n); only
    /// the scrape merge uses it, once per tick.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &mut ConnStatus),
    {
        let mut entries = self.entries.lock().unwrap();
        for (key, status) in entries.iter_mut() {
            visit(key, status);
        }
    }

    /// Compute the diff against the last committed report.
    ///
    /// Does not mutate anything: the returned [`Delta`] carries the next
    /// reported image and the reap list, applied by [`Self::commit`] once
    /// the reporter has confirmed delivery. Re-running after a failed
    /// delivery therefore re-computes against the same old state.
    pub fn compute_delta(&self, now_micros: u64, afterglow_micros: Option<u64>) -> Delta<K> {
        let snapshot: Vec<(K, ConnStatus)> = {
            let entries = self.entries.lock().unwrap();
            entries.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        let reported = self.reported.lock().unwrap();

        let mut delta = Delta {
            added: Vec::new(),
            removed: Vec::new(),
            still_open: 0,
            new_reported: HashSet::new(),
            reaped: Vec::new(),
        };

        let mut seen: HashSet<&K> = HashSet::with_capacity(snapshot.len());
        for (key, status) in &snapshot {
            seen.insert(key);
            let was_active = reported.contains(key);
            if status.effective_active(now_micros, afterglow_micros) {
                if !was_active {
                    delta.added.push(key.clone());
                } else {
                    delta.still_open += 1;
                }
                delta.new_reported.insert(key.clone());
            } else {
                // Inactive and past afterglow. An identity the collector
                // never saw gets its add and remove in the same message.
                if !was_active {
                    delta.added.push(key.clone());
                }
                delta.removed.push(key.clone());
                delta.reaped.push((key.clone(), status.last_active_micros));
            }
        }

        // Entries that disappeared from the table (reaped in an earlier
        // commit) but whose removal was never acknowledged.
        for key in reported.iter() {
            if !seen.contains(key) {
                delta.removed.push(key.clone());
            }
        }

        delta.added.sort();
        delta.removed.sort();
        delta
    }

    /// Commit a delivered delta: swap in the reported image and reap the
    /// entries whose removal is now acknowledged. An entry that saw new
    /// activity after the snapshot is left alone. Returns the keys that
    /// were actually reaped.
    pub fn commit(&self, delta: Delta<K>) -> Vec<K> {
        let mut reaped = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            for (key, snapshot_ts) in &delta.reaped {
                if let Some(status) = entries.get(key) {
                    if !status.active && status.last_active_micros == *snapshot_ts {
                        entries.remove(key);
                        reaped.push(key.clone());
                    }
                }
            }
        }
        *self.reported.lock().unwrap() = delta.new_reported;
        reaped
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Drop a batch of victims: oldest inactive entries first, oldest active
/// ones only if the table is still full of active entries. Never more than
/// half the table, so a tiny cap cannot flush everything at once.
fn evict_batch<K: Clone + Eq + Hash>(entries: &mut HashMap<K, ConnStatus>) -> u64 {
    let batch = EVICT_BATCH.min(entries.len() / 2).max(1);
    let mut candidates: Vec<(K, ConnStatus)> =
        entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
    candidates.sort_by_key(|(_, status)| (status.active, status.last_active_micros));

    let mut evicted = 0u64;
    for (key, _) in candidates.into_iter().take(batch) {
        entries.remove(&key);
        evicted += 1;
    }
    evicted
}

/// Live-connection state keyed by full connection identity.
pub struct ConnectionTracker {
    table: DeltaTable<Connection>,
}

impl ConnectionTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            table: DeltaTable::new(cap),
        }
    }

    /// Apply one network syscall observation. `is_add` is true for
    /// connect/accept, false for close/shutdown.
    pub fn update_connection(&self, conn: Connection, ts_micros: u64, is_add: bool) {
        self.table.update(conn, ts_micros, is_add);
    }

    pub fn compute_delta(
        &self,
        now_micros: u64,
        afterglow_micros: Option<u64>,
    ) -> Delta<Connection> {
        self.table.compute_delta(now_micros, afterglow_micros)
    }

    pub fn commit(&self, delta: Delta<Connection>) {
        self.table.commit(delta);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn evictions(&self) -> u64 {
        self.table.evictions()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_CAP)
    }
}
