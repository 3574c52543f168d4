//! Network signal handler
//!
//! Translates connect/accept/close/shutdown exit events into connection
//! tracker updates. Everything that does not describe a successful TCP or
//! UDP connection with a known role and container is dropped here, counted
//! but not logged.

use std::sync::Arc;

use spyglass_common::{EventType, RawEvent};

use crate::config::{ConfigHandle, RuntimeConfig};
use crate::conntrack::ConnectionTracker;
use crate::dispatch::{HandleResult, SignalHandler};
use crate::event::EventExtractor;
use crate::net::{Connection, ConnectionTuple, L4Proto};
use crate::stats::PipelineStats;

pub struct NetworkSignalHandler {
    extractor: EventExtractor,
    tracker: Arc<ConnectionTracker>,
    config: Arc<ConfigHandle>,
    stats: Arc<PipelineStats>,
}

impl NetworkSignalHandler {
    pub fn new(
        extractor: EventExtractor,
        tracker: Arc<ConnectionTracker>,
        config: Arc<ConfigHandle>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            extractor,
            tracker,
            config,
            stats,
        }
    }

    fn connection_of(&self, evt: &RawEvent) -> Option<Connection> {
        match self.extractor.res(evt) {
            Some(res) if res >= 0 => {}
            Some(_) => {
                PipelineStats::bump(&self.stats.failed_result);
                return None;
            }
            None => return None,
        }

        let Some(fd) = self.extractor.fd_info(evt) else {
            PipelineStats::bump(&self.stats.missing_fd_info);
            return None;
        };
        let role = fd.role?;

        if !matches!(fd.proto, L4Proto::Tcp | L4Proto::Udp) {
            PipelineStats::bump(&self.stats.unsupported_proto);
            return None;
        }

        let Some(container_id) = self.extractor.container_id(evt) else {
            PipelineStats::bump(&self.stats.no_container);
            return None;
        };

        Some(Connection::new(
            container_id,
            ConnectionTuple {
                client: fd.client,
                server: fd.server,
                proto: fd.proto,
                role,
            },
        ))
    }
}

impl SignalHandler for NetworkSignalHandler {
    fn name(&self) -> &'static str {
        "network"
    }

    fn relevant_events(&self) -> &'static [EventType] {
        &[
            EventType::ConnectExit,
            EventType::AcceptExit,
            EventType::CloseExit,
            EventType::ShutdownExit,
        ]
    }

    fn handle(&mut self, evt: &RawEvent) -> HandleResult {
        let is_add = match self.extractor.event_type(evt) {
            Some(EventType::ConnectExit) | Some(EventType::AcceptExit) => true,
            Some(EventType::CloseExit) | Some(EventType::ShutdownExit) => false,
            _ => return HandleResult::Ignored,
        };

        let Some(conn) = self.connection_of(evt) else {
            return HandleResult::Ignored;
        };

        let config = self.config.load();
        if !is_relevant_connection(&conn, &config) {
            PipelineStats::bump(&self.stats.filtered);
            return HandleResult::Ignored;
        }

        self.tracker
            .update_connection(conn, self.extractor.ts_micros(evt), is_add);
        HandleResult::Processed
    }
}

/// Relevance predicates, first match drops. The unspecified-remote check is
/// always on; the rest follow configuration.
pub fn is_relevant_connection(conn: &Connection, config: &RuntimeConfig) -> bool {
    let tuple = &conn.tuple;
    let remote = tuple.remote();

    if remote.is_unspecified() {
        return false;
    }
    if config.ignore_localhost && (remote.is_loopback() || tuple.local().is_loopback()) {
        return false;
    }
    if let Some(addr) = remote.address {
        if config.ignored_cidrs.iter().any(|c| c.contains(&addr)) {
            return false;
        }
    }
    if config
        .ignored_client_ports
        .iter()
        .any(|r| r.contains(tuple.client.port))
    {
        return false;
    }
    if config.privileged_only && tuple.server.port >= 1024 {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CidrBlock, PortRange};
    use crate::containers::StaticContainerLookup;
    use crate::net::{Address, Endpoint, Role};
    use spyglass_common::{FD_FAMILY_V4, FD_L4_OTHER, FD_L4_TCP, FD_ROLE_NONE, FD_ROLE_SERVER};

    fn harness() -> (NetworkSignalHandler, Arc<ConnectionTracker>) {
        let tracker = Arc::new(ConnectionTracker::new(64));
        let lookup = Arc::new(StaticContainerLookup::new([(7, "c1")]));
        let handler = NetworkSignalHandler::new(
            EventExtractor::new(lookup),
            tracker.clone(),
            Arc::new(ConfigHandle::default()),
            Arc::new(PipelineStats::new()),
        );
        (handler, tracker)
    }

    fn accept_event(ts_ns: u64) -> RawEvent {
        let mut evt = RawEvent::zeroed();
        evt.event_type = EventType::AcceptExit.ordinal();
        evt.tid = 7;
        evt.ts_ns = ts_ns;
        evt.res = 0;
        evt.fd.role = FD_ROLE_SERVER;
        evt.fd.l4proto = FD_L4_TCP;
        evt.fd.family = FD_FAMILY_V4;
        evt.fd.client_addr[..4].copy_from_slice(&[10, 0, 0, 2]);
        evt.fd.server_addr[..4].copy_from_slice(&[10, 0, 0, 1]);
        evt.fd.client_port = 54321;
        evt.fd.server_port = 80;
        evt
    }

    fn expected_conn() -> Connection {
        Connection::new(
            "c1",
            ConnectionTuple {
                client: Endpoint::new(Address::from_v4_octets([10, 0, 0, 2]), 54321),
                server: Endpoint::new(Address::from_v4_octets([10, 0, 0, 1]), 80),
                proto: L4Proto::Tcp,
                role: Role::Server,
            },
        )
    }

    #[test]
    fn test_accept_adds_connection() {
        let (mut handler, tracker) = harness();
        assert_eq!(
            handler.handle(&accept_event(1_000_000_000)),
            HandleResult::Processed
        );

        let delta = tracker.compute_delta(2_000_000, None);
        assert_eq!(delta.added, vec![expected_conn()]);
    }

    #[test]
    fn test_close_removes_connection() {
        let (mut handler, tracker) = harness();
        handler.handle(&accept_event(1_000_000_000));

        let mut close = accept_event(2_000_000_000);
        close.event_type = EventType::CloseExit.ordinal();
        assert_eq!(handler.handle(&close), HandleResult::Processed);

        let delta = tracker.compute_delta(3_000_000, None);
        assert_eq!(delta.removed, vec![expected_conn()]);
    }

    #[test]
    fn test_failed_result_is_no_op() {
        let (mut handler, tracker) = harness();
        let mut evt = accept_event(1_000_000_000);
        evt.res = -111;
        assert_eq!(handler.handle(&evt), HandleResult::Ignored);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_unsupported_proto_is_no_op() {
        let (mut handler, tracker) = harness();
        let mut evt = accept_event(1_000_000_000);
        evt.fd.l4proto = FD_L4_OTHER;
        assert_eq!(handler.handle(&evt), HandleResult::Ignored);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_missing_role_is_no_op() {
        let (mut handler, tracker) = harness();
        let mut evt = accept_event(1_000_000_000);
        evt.fd.role = FD_ROLE_NONE;
        assert_eq!(handler.handle(&evt), HandleResult::Ignored);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_host_process_is_no_op() {
        let (mut handler, tracker) = harness();
        let mut evt = accept_event(1_000_000_000);
        evt.tid = 99;
        assert_eq!(handler.handle(&evt), HandleResult::Ignored);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_relevance_unspecified_remote() {
        let config = RuntimeConfig::default();
        let mut conn = expected_conn();
        // Server role: the remote side is the client.
        conn.tuple.client = Endpoint::new(Address::from_v4_octets([0, 0, 0, 0]), 1234);
        assert!(!is_relevant_connection(&conn, &config));
    }

    #[test]
    fn test_relevance_ignore_localhost() {
        let config = RuntimeConfig {
            ignore_localhost: true,
            ..Default::default()
        };
        let mut conn = expected_conn();
        conn.tuple.client = Endpoint::new(Address::from_v4_octets([127, 0, 0, 1]), 1234);
        assert!(!is_relevant_connection(&conn, &config));
        assert!(is_relevant_connection(&expected_conn(), &config));
    }

    #[test]
    fn test_relevance_ignored_cidrs() {
        let config = RuntimeConfig {
            ignored_cidrs: vec!["10.0.0.0/24".parse::<CidrBlock>().unwrap()],
            ..Default::default()
        };
        assert!(!is_relevant_connection(&expected_conn(), &config));
    }

    #[test]
    fn test_relevance_ignored_client_ports() {
        let config = RuntimeConfig {
            ignored_client_ports: vec![PortRange {
                start: 54000,
                end: 55000,
            }],
            ..Default::default()
        };
        assert!(!is_relevant_connection(&expected_conn(), &config));
    }

    #[test]
    fn test_relevance_privileged_only() {
        let config = RuntimeConfig {
            privileged_only: true,
            ..Default::default()
        };
        // Server port 80 is privileged; passes.
        assert!(is_relevant_connection(&expected_conn(), &config));

        let mut conn = expected_conn();
        conn.tuple.server.port = 8080;
        assert!(!is_relevant_connection(&conn, &config));
    }
}
