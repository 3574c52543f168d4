//! Listening-socket scraper
//!
//! Periodic enumeration of bound sockets: /proc/net/{tcp,tcp6,udp,udp6}
//! gives the socket table with inodes, /proc/<pid>/fd attributes inodes to
//! processes, and /proc/<pid>/{comm,cmdline,status} fills in the
//! originator. Sockets that cannot be attributed to a containerized
//! process are skipped; the whole pass is best-effort and degrades to
//! syscall-only endpoint state when /proc is unreadable.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use crate::containers::ContainerLookup;
use crate::endpoints::ScrapedEndpoint;
use crate::net::{Address, Endpoint, L4Proto, ProcessInfo};

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("reading {}: {}", path.display(), source)]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("scrape task was cancelled")]
    Cancelled,
}

/// tcp socket state LISTEN in /proc/net/tcp.
const TCP_LISTEN: u8 = 0x0a;
/// udp sockets show TCP_CLOSE while bound and unconnected.
const UDP_BOUND: u8 = 0x07;

#[async_trait]
pub trait ListeningSocketSource: Send + Sync {
    /// Enumerate currently bound listening sockets.
    async fn scan(&self) -> Result<Vec<ScrapedEndpoint>, ScrapeError>;
}

/// /proc-backed scraper.
pub struct ProcNetScraper {
    proc_root: PathBuf,
    containers: Arc<dyn ContainerLookup>,
}

impl ProcNetScraper {
    pub fn new(containers: Arc<dyn ContainerLookup>) -> Self {
        Self::with_root(PathBuf::from("/proc"), containers)
    }

    pub fn with_root(proc_root: PathBuf, containers: Arc<dyn ContainerLookup>) -> Self {
        Self {
            proc_root,
            containers,
        }
    }
}

#[async_trait]
impl ListeningSocketSource for ProcNetScraper {
    async fn scan(&self) -> Result<Vec<ScrapedEndpoint>, ScrapeError> {
        let proc_root = self.proc_root.clone();
        let containers = self.containers.clone();
        tokio::task::spawn_blocking(move || scan_blocking(&proc_root, containers.as_ref()))
            .await
            .map_err(|_| ScrapeError::Cancelled)?
    }
}

fn scan_blocking(
    proc_root: &Path,
    containers: &dyn ContainerLookup,
) -> Result<Vec<ScrapedEndpoint>, ScrapeError> {
    let mut by_inode: HashMap<u64, (Endpoint, L4Proto)> = HashMap::new();
    for (file, proto, state) in [
        ("net/tcp", L4Proto::Tcp, TCP_LISTEN),
        ("net/tcp6", L4Proto::Tcp, TCP_LISTEN),
        ("net/udp", L4Proto::Udp, UDP_BOUND),
        ("net/udp6", L4Proto::Udp, UDP_BOUND),
    ] {
        let path = proc_root.join(file);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            // Not every kernel exposes all four tables.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => return Err(ScrapeError::Io { path, source }),
        };
        for line in content.lines().skip(1) {
            if let Some((inode, endpoint)) = parse_socket_line(line, state) {
                by_inode.insert(inode, (endpoint, proto));
            }
        }
    }

    if by_inode.is_empty() {
        return Ok(Vec::new());
    }

    let mut scraped = Vec::new();
    let entries = fs::read_dir(proc_root).map_err(|source| ScrapeError::Io {
        path: proc_root.to_path_buf(),
        source,
    })?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Some(container_id) = containers.container_id_for(pid) else {
            continue;
        };

        for inode in socket_inodes(&entry.path().join("fd")) {
            let Some((endpoint, proto)) = by_inode.get(&inode) else {
                continue;
            };
            scraped.push(ScrapedEndpoint {
                container_id: container_id.clone(),
                endpoint: *endpoint,
                proto: *proto,
                originator: Some(process_info(proc_root, pid)),
            });
        }
    }

    debug!(
        "scrape pass: {} bound sockets, {} container-attributed",
        by_inode.len(),
        scraped.len()
    );
    Ok(scraped)
}

/// One /proc/net/tcp-style row: `sl local_address rem_address st ... inode`.
/// Returns the inode and local endpoint for rows in the wanted state.
fn parse_socket_line(line: &str, wanted_state: u8) -> Option<(u64, Endpoint)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }

    let state = u8::from_str_radix(fields[3], 16).ok()?;
    if state != wanted_state {
        return None;
    }

    let (addr_hex, port_hex) = fields[1].split_once(':')?;
    let address = parse_hex_address(addr_hex)?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let inode: u64 = fields[9].parse().ok()?;

    Some((inode, Endpoint::new(address, port)))
}

/// The kernel prints addresses as native-endian 32-bit words; decode back
/// to network byte order. IPv4-mapped IPv6 normalizes like everywhere else.
fn parse_hex_address(hex: &str) -> Option<Address> {
    match hex.len() {
        8 => {
            let word = u32::from_str_radix(hex, 16).ok()?;
            Some(Address::from_v4_octets(word.to_le_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in hex.as_bytes().chunks(8).enumerate() {
                let chunk = std::str::from_utf8(chunk).ok()?;
                let word = u32::from_str_radix(chunk, 16).ok()?;
                octets[i * 4..(i + 1) * 4].copy_from_slice(&word.to_le_bytes());
            }
            Some(Address::from_v6_octets(octets))
        }
        _ => None,
    }
}

/// Socket inodes held by a process, from its fd symlinks (`socket:[N]`).
fn socket_inodes(fd_dir: &Path) -> Vec<u64> {
    let mut inodes = Vec::new();
    let Ok(entries) = fs::read_dir(fd_dir) else {
        return inodes;
    };
    for entry in entries.flatten() {
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        let Some(target) = target.to_str() else {
            continue;
        };
        if let Some(inode) = target
            .strip_prefix("socket:[")
            .and_then(|s| s.strip_suffix(']'))
            .and_then(|s| s.parse().ok())
        {
            inodes.push(inode);
        }
    }
    inodes
}

fn process_info(proc_root: &Path, pid: u32) -> ProcessInfo {
    let pid_dir = proc_root.join(pid.to_string());

    let name = fs::read_to_string(pid_dir.join("comm"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let exe_path = fs::read_link(pid_dir.join("exe"))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let args = fs::read_to_string(pid_dir.join("cmdline"))
        .map(|s| {
            s.split('\0')
                .filter(|a| !a.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    let (uid, gid) = fs::read_to_string(pid_dir.join("status"))
        .map(|s| parse_status_ids(&s))
        .unwrap_or((0, 0));

    ProcessInfo {
        name,
        exe_path,
        args,
        pid,
        uid,
        gid,
        container_start_ts: 0,
    }
}

/// Real uid/gid from /proc/<pid>/status `Uid:`/`Gid:` lines.
fn parse_status_ids(status: &str) -> (u32, u32) {
    let mut uid = 0;
    let mut gid = 0;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            uid = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Gid:") {
            gid = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
    }
    (uid, gid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::StaticContainerLookup;
    use std::os::unix::fs::symlink;

    const TCP_HEADER: &str =
        "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

    #[test]
    fn test_parse_hex_address_v4() {
        // 127.0.0.1 printed by a little-endian kernel.
        assert_eq!(
            parse_hex_address("0100007F"),
            Some(Address::from_v4_octets([127, 0, 0, 1]))
        );
        assert_eq!(
            parse_hex_address("00000000"),
            Some(Address::from_v4_octets([0, 0, 0, 0]))
        );
    }

    #[test]
    fn test_parse_hex_address_v6_mapped_normalizes() {
        // ::ffff:10.0.0.1 as four native-endian words.
        let addr = parse_hex_address("0000000000000000FFFF00000100000A").unwrap();
        assert_eq!(addr, Address::from_v4_octets([10, 0, 0, 1]));
    }

    #[test]
    fn test_parse_socket_line_listen_only() {
        let listen =
            "   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 4242 1 0000000000000000 100 0 0 10 0";
        let established =
            "   1: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 4243 1 0000000000000000 100 0 0 10 0";

        let (inode, endpoint) = parse_socket_line(listen, TCP_LISTEN).unwrap();
        assert_eq!(inode, 4242);
        assert_eq!(endpoint, Endpoint::new(Address::from_v4_octets([0, 0, 0, 0]), 8080));

        assert!(parse_socket_line(established, TCP_LISTEN).is_none());
    }

    #[test]
    fn test_parse_status_ids() {
        let status = "Name:\tnginx\nUid:\t101\t101\t101\t101\nGid:\t102\t102\t102\t102\n";
        assert_eq!(parse_status_ids(status), (101, 102));
    }

    #[tokio::test]
    async fn test_scan_attributes_container_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::create_dir_all(root.join("net")).unwrap();
        let listen_row =
            "   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 4242 1 0000000000000000 100 0 0 10 0";
        fs::write(
            root.join("net/tcp"),
            format!("{}\n{}\n", TCP_HEADER, listen_row),
        )
        .unwrap();

        let pid_dir = root.join("321");
        fs::create_dir_all(pid_dir.join("fd")).unwrap();
        symlink("socket:[4242]", pid_dir.join("fd/3")).unwrap();
        fs::write(pid_dir.join("comm"), "nginx\n").unwrap();
        fs::write(pid_dir.join("cmdline"), "nginx\0-g\0daemon off;\0").unwrap();
        fs::write(pid_dir.join("status"), "Uid:\t101\t101\t101\t101\nGid:\t0\t0\t0\t0\n").unwrap();

        let scraper = ProcNetScraper::with_root(
            root.to_path_buf(),
            Arc::new(StaticContainerLookup::new([(321, "c1")])),
        );
        let scraped = scraper.scan().await.unwrap();

        assert_eq!(scraped.len(), 1);
        let entry = &scraped[0];
        assert_eq!(entry.container_id, "c1");
        assert_eq!(entry.endpoint.port, 8080);
        assert_eq!(entry.proto, L4Proto::Tcp);
        let originator = entry.originator.as_ref().unwrap();
        assert_eq!(originator.name, "nginx");
        assert_eq!(originator.args, "nginx -g daemon off;");
        assert_eq!(originator.uid, 101);
    }

    #[tokio::test]
    async fn test_scan_skips_host_processes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::create_dir_all(root.join("net")).unwrap();
        let listen_row =
            "   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 99 1 0000000000000000 100 0 0 10 0";
        fs::write(
            root.join("net/tcp"),
            format!("{}\n{}\n", TCP_HEADER, listen_row),
        )
        .unwrap();

        let pid_dir = root.join("77");
        fs::create_dir_all(pid_dir.join("fd")).unwrap();
        symlink("socket:[99]", pid_dir.join("fd/3")).unwrap();

        let scraper = ProcNetScraper::with_root(
            root.to_path_buf(),
            Arc::new(StaticContainerLookup::new::<_, String>([])),
        );
        assert!(scraper.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_without_net_tables_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let scraper = ProcNetScraper::with_root(
            dir.path().to_path_buf(),
            Arc::new(StaticContainerLookup::new::<_, String>([])),
        );
        assert!(scraper.scan().await.unwrap().is_empty());
    }
}
