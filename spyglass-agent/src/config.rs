//! Runtime configuration
//!
//! One immutable snapshot behind an atomic pointer. The ingestion path
//! loads it once per batch and the reporter once per tick, so collector
//! pushed updates apply at tick boundaries and never tear a diff.
//!
//! Updates are validated before publication: a rejected update leaves the
//! previous snapshot in place and the error travels back in the ack.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::LevelFilter;
use thiserror::Error;
use tokio::sync::watch;

use crate::conntrack::DEFAULT_TABLE_CAP;
use crate::net::Address;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CIDR '{value}'")]
    InvalidCidr { value: String },

    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u32, end: u32 },

    #[error("scrape interval {value}s out of range (1-3600)")]
    ScrapeIntervalOutOfRange { value: u32 },

    #[error("unknown log level '{value}'")]
    UnknownLogLevel { value: String },
}

/// `a.b.c.d/len` or `<v6>/len` block with a containment check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CidrBlock {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrBlock {
    pub fn new(network: IpAddr, prefix_len: u8) -> Option<Self> {
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix_len <= max).then_some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, addr: &Address) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), Address::V4(a)) => {
                prefix_match(&net.octets(), &a.octets(), self.prefix_len)
            }
            (IpAddr::V6(net), Address::V6(a)) => {
                prefix_match(&net.octets(), &a.octets(), self.prefix_len)
            }
            _ => false,
        }
    }
}

impl FromStr for CidrBlock {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ConfigError::InvalidCidr {
            value: s.to_string(),
        };
        let (addr, len) = s.split_once('/').ok_or_else(err)?;
        let network: IpAddr = addr.parse().map_err(|_| err())?;
        let prefix_len: u8 = len.parse().map_err(|_| err())?;
        Self::new(network, prefix_len).ok_or_else(err)
    }
}

fn prefix_match(network: &[u8], addr: &[u8], prefix_len: u8) -> bool {
    let full_bytes = usize::from(prefix_len / 8);
    if network[..full_bytes] != addr[..full_bytes] {
        return false;
    }
    let rem = prefix_len % 8;
    if rem == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem);
    (network[full_bytes] ^ addr[full_bytes]) & mask == 0
}

/// Inclusive port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub log_level: LevelFilter,
    pub turn_off_scrape: bool,
    pub scrape_interval: Duration,
    pub afterglow_period_micros: u64,
    pub enable_afterglow: bool,
    pub processes_listening_on_port: bool,
    pub ignore_localhost: bool,
    pub privileged_only: bool,
    pub ignored_cidrs: Vec<CidrBlock>,
    pub ignored_client_ports: Vec<PortRange>,
    pub connection_table_cap: usize,
    pub endpoint_table_cap: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            turn_off_scrape: false,
            scrape_interval: Duration::from_secs(30),
            afterglow_period_micros: 20_000_000,
            enable_afterglow: true,
            processes_listening_on_port: true,
            ignore_localhost: false,
            privileged_only: false,
            ignored_cidrs: Vec::new(),
            ignored_client_ports: Vec::new(),
            connection_table_cap: DEFAULT_TABLE_CAP,
            endpoint_table_cap: DEFAULT_TABLE_CAP,
        }
    }
}

impl RuntimeConfig {
    /// Effective afterglow window; `None` when disabled.
    pub fn afterglow(&self) -> Option<u64> {
        (self.enable_afterglow && self.afterglow_period_micros > 0)
            .then_some(self.afterglow_period_micros)
    }

    /// Build the successor snapshot from a collector update. Fails without
    /// side effects; only set fields override.
    fn with_update(
        &self,
        msg: &spyglass_proto::RuntimeFilteringConfiguration,
    ) -> Result<Self, ConfigError> {
        let mut next = self.clone();

        if let Some(level) = &msg.log_level {
            next.log_level = parse_level(level)?;
        }
        if let Some(interval) = msg.scrape_interval_seconds {
            if !(1..=3600).contains(&interval) {
                return Err(ConfigError::ScrapeIntervalOutOfRange { value: interval });
            }
            next.scrape_interval = Duration::from_secs(u64::from(interval));
        }
        if let Some(v) = msg.turn_off_scrape {
            next.turn_off_scrape = v;
        }
        if let Some(v) = msg.afterglow_period_micros {
            next.afterglow_period_micros = v;
        }
        if let Some(v) = msg.enable_afterglow {
            next.enable_afterglow = v;
        }
        if let Some(v) = msg.processes_listening_on_port {
            next.processes_listening_on_port = v;
        }
        if let Some(v) = msg.ignore_localhost {
            next.ignore_localhost = v;
        }
        if !msg.ignored_cidrs.is_empty() {
            next.ignored_cidrs = msg
                .ignored_cidrs
                .iter()
                .map(|s| s.parse())
                .collect::<Result<_, _>>()?;
        }
        if !msg.ignored_client_ports.is_empty() {
            next.ignored_client_ports = msg
                .ignored_client_ports
                .iter()
                .map(|r| {
                    let (start, end) = (r.start, r.end);
                    if start > end || end > u32::from(u16::MAX) {
                        return Err(ConfigError::InvalidPortRange { start, end });
                    }
                    Ok(PortRange {
                        start: start as u16,
                        end: end as u16,
                    })
                })
                .collect::<Result<_, _>>()?;
        }

        Ok(next)
    }
}

fn parse_level(s: &str) -> Result<LevelFilter, ConfigError> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        _ => Err(ConfigError::UnknownLogLevel {
            value: s.to_string(),
        }),
    }
}

/// Shared handle to the current snapshot. Reads are wait-free; the control
/// task is the only writer.
pub struct ConfigHandle {
    current: ArcSwap<RuntimeConfig>,
    init_tx: watch::Sender<bool>,
}

impl ConfigHandle {
    pub fn new(initial: RuntimeConfig) -> Self {
        let (init_tx, _) = watch::channel(false);
        Self {
            current: ArcSwap::from_pointee(initial),
            init_tx,
        }
    }

    pub fn load(&self) -> Arc<RuntimeConfig> {
        self.current.load_full()
    }

    /// Validate and publish a collector update. On success the new snapshot
    /// is visible to the next load and the process log level follows.
    pub fn apply_update(
        &self,
        msg: &spyglass_proto::RuntimeFilteringConfiguration,
    ) -> Result<(), ConfigError> {
        let next = self.current.load().with_update(msg)?;
        let level = next.log_level;
        self.current.store(Arc::new(next));
        log::set_max_level(level);
        self.init_tx.send_replace(true);
        Ok(())
    }

    /// Block until the collector has pushed the first configuration, or the
    /// timeout elapses (startup then proceeds on the built-in defaults).
    pub async fn wait_until_initialized(&self, timeout: Duration) -> bool {
        let mut rx = self.init_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spyglass_proto::RuntimeFilteringConfiguration;

    #[test]
    fn test_cidr_contains_v4() {
        let block: CidrBlock = "10.0.0.0/8".parse().unwrap();
        assert!(block.contains(&Address::from_v4_octets([10, 1, 2, 3])));
        assert!(!block.contains(&Address::from_v4_octets([11, 0, 0, 1])));

        let narrow: CidrBlock = "192.168.1.128/25".parse().unwrap();
        assert!(narrow.contains(&Address::from_v4_octets([192, 168, 1, 200])));
        assert!(!narrow.contains(&Address::from_v4_octets([192, 168, 1, 1])));
    }

    #[test]
    fn test_cidr_contains_v6() {
        let block: CidrBlock = "fd00::/8".parse().unwrap();
        let mut octets = [0u8; 16];
        octets[0] = 0xfd;
        octets[15] = 1;
        assert!(block.contains(&Address::from_v6_octets(octets)));
        assert!(!block.contains(&Address::from_v4_octets([10, 0, 0, 1])));
    }

    #[test]
    fn test_cidr_parse_errors() {
        assert!("10.0.0.0".parse::<CidrBlock>().is_err());
        assert!("10.0.0.0/33".parse::<CidrBlock>().is_err());
        assert!("not-an-ip/8".parse::<CidrBlock>().is_err());
    }

    #[test]
    fn test_partial_update_preserves_other_fields() {
        let handle = ConfigHandle::default();
        let msg = RuntimeFilteringConfiguration {
            scrape_interval_seconds: Some(10),
            ..Default::default()
        };
        handle.apply_update(&msg).unwrap();

        let cfg = handle.load();
        assert_eq!(cfg.scrape_interval, Duration::from_secs(10));
        assert!(cfg.enable_afterglow);
        assert_eq!(cfg.afterglow_period_micros, 20_000_000);
    }

    #[test]
    fn test_invalid_update_keeps_previous_snapshot() {
        let handle = ConfigHandle::default();
        let before = handle.load();

        let msg = RuntimeFilteringConfiguration {
            scrape_interval_seconds: Some(0),
            enable_afterglow: Some(false),
            ..Default::default()
        };
        assert!(handle.apply_update(&msg).is_err());

        let after = handle.load();
        assert_eq!(after.scrape_interval, before.scrape_interval);
        assert!(after.enable_afterglow);
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let handle = ConfigHandle::default();
        let msg = RuntimeFilteringConfiguration {
            ignored_cidrs: vec!["300.0.0.0/8".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            handle.apply_update(&msg),
            Err(ConfigError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn test_afterglow_helper() {
        let mut cfg = RuntimeConfig::default();
        assert_eq!(cfg.afterglow(), Some(20_000_000));
        cfg.enable_afterglow = false;
        assert_eq!(cfg.afterglow(), None);
        cfg.enable_afterglow = true;
        cfg.afterglow_period_micros = 0;
        assert_eq!(cfg.afterglow(), None);
    }

    #[tokio::test]
    async fn test_wait_until_initialized() {
        let handle = Arc::new(ConfigHandle::default());
        assert!(
            !handle
                .wait_until_initialized(Duration::from_millis(10))
                .await
        );

        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter.wait_until_initialized(Duration::from_secs(5)).await
        });
        handle
            .apply_update(&RuntimeFilteringConfiguration::default())
            .unwrap();
        assert!(task.await.unwrap());
    }
}
