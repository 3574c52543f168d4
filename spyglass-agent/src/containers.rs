//! Container id lookup for attributing events to containers
//!
//! Resolves a thread id to the container it belongs to by parsing
//! `/proc/<tid>/cgroup`, with a concurrent cache in front so the per-event
//! cost stays O(1). Host processes resolve to `None`.
//!
//! Recognized cgroup path shapes:
//! - `/docker/<64-hex>`
//! - `.../docker-<64-hex>.scope`
//! - `.../cri-containerd-<64-hex>.scope`
//! - `.../crio-<64-hex>.scope`
//! - `.../libpod-<64-hex>.scope`

use std::fs;
use std::path::PathBuf;

use dashmap::DashMap;

/// Reported container ids use the short (12 character) form.
const SHORT_ID_LEN: usize = 12;

pub trait ContainerLookup: Send + Sync {
    /// Container id for a thread, `None` for host processes. Must be
    /// thread-safe and O(1) amortized; called once per event.
    fn container_id_for(&self, tid: u32) -> Option<String>;
}

/// `/proc`-backed resolver with a dashmap cache keyed by tid.
///
/// Negative results (host processes) are cached too; tid reuse across
/// container boundaries is rare enough that the next cache flush covers it.
pub struct ProcContainerLookup {
    proc_root: PathBuf,
    cache: DashMap<u32, Option<String>>,
}

impl ProcContainerLookup {
    pub fn new() -> Self {
        Self::with_root(PathBuf::from("/proc"))
    }

    pub fn with_root(proc_root: PathBuf) -> Self {
        Self {
            proc_root,
            cache: DashMap::new(),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Drop cached resolutions; tids recycle, so callers flush periodically.
    pub fn flush(&self) {
        self.cache.clear();
    }

    fn resolve(&self, tid: u32) -> Option<String> {
        let path = self.proc_root.join(tid.to_string()).join("cgroup");
        let content = fs::read_to_string(path).ok()?;
        content.lines().find_map(container_id_from_cgroup_line)
    }
}

impl Default for ProcContainerLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerLookup for ProcContainerLookup {
    fn container_id_for(&self, tid: u32) -> Option<String> {
        if let Some(cached) = self.cache.get(&tid) {
            return cached.clone();
        }
        let resolved = self.resolve(tid);
        self.cache.insert(tid, resolved.clone());
        resolved
    }
}

/// Extract a container id from one `/proc/<tid>/cgroup` line
/// (`<hierarchy>:<controllers>:<path>`).
fn container_id_from_cgroup_line(line: &str) -> Option<String> {
    let path = line.splitn(3, ':').nth(2)?;

    for segment in path.split('/') {
        let segment = segment.strip_suffix(".scope").unwrap_or(segment);
        let candidate = ["docker-", "cri-containerd-", "crio-", "libpod-"]
            .iter()
            .find_map(|prefix| segment.strip_prefix(prefix))
            .unwrap_or(segment);

        if candidate.len() == 64 && candidate.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Some(candidate[..SHORT_ID_LEN].to_string());
        }
    }
    None
}

/// Fixed-map lookup for tests and wiring without a /proc view.
pub struct StaticContainerLookup {
    map: DashMap<u32, String>,
}

impl StaticContainerLookup {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        let map = DashMap::new();
        for (tid, id) in entries {
            map.insert(tid, id.into());
        }
        Self { map }
    }
}

impl ContainerLookup for StaticContainerLookup {
    fn container_id_for(&self, tid: u32) -> Option<String> {
        self.map.get(&tid).map(|r| r.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_docker_cgroup_line() {
        let line = format!("0::/docker/{}", ID);
        assert_eq!(
            container_id_from_cgroup_line(&line),
            Some("0123456789ab".to_string())
        );
    }

    #[test]
    fn test_containerd_scope_line() {
        let line = format!(
            "0::/kubepods.slice/kubepods-pod12_34.slice/cri-containerd-{}.scope",
            ID
        );
        assert_eq!(
            container_id_from_cgroup_line(&line),
            Some("0123456789ab".to_string())
        );
    }

    #[test]
    fn test_systemd_docker_scope_line() {
        let line = format!("0::/system.slice/docker-{}.scope", ID);
        assert_eq!(
            container_id_from_cgroup_line(&line),
            Some("0123456789ab".to_string())
        );
    }

    #[test]
    fn test_host_process_line() {
        assert_eq!(container_id_from_cgroup_line("0::/init.scope"), None);
        assert_eq!(
            container_id_from_cgroup_line("0::/system.slice/sshd.service"),
            None
        );
    }

    #[test]
    fn test_proc_lookup_caches() {
        let dir = tempfile::tempdir().unwrap();
        let task = dir.path().join("42");
        fs::create_dir_all(&task).unwrap();
        fs::write(task.join("cgroup"), format!("0::/docker/{}\n", ID)).unwrap();

        let lookup = ProcContainerLookup::with_root(dir.path().to_path_buf());
        assert_eq!(lookup.container_id_for(42), Some("0123456789ab".into()));
        assert_eq!(lookup.container_id_for(42), Some("0123456789ab".into()));
        assert_eq!(lookup.cached_entries(), 1);

        // Host process: negative result is cached as well.
        let host = dir.path().join("43");
        fs::create_dir_all(&host).unwrap();
        fs::write(host.join("cgroup"), "0::/init.scope\n").unwrap();
        assert_eq!(lookup.container_id_for(43), None);
        assert_eq!(lookup.cached_entries(), 2);
    }

    #[test]
    fn test_missing_proc_entry_is_host() {
        let dir = tempfile::tempdir().unwrap();
        let lookup = ProcContainerLookup::with_root(dir.path().to_path_buf());
        assert_eq!(lookup.container_id_for(1234), None);
    }
}
