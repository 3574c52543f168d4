//! Endpoint signal handler
//!
//! Feeds the endpoint tracker with syscall deltas between scrape passes:
//! listen exit events open an endpoint, close/shutdown of a listening
//! socket retire it. Connection-socket close events (those with a peer)
//! belong to the network handler and are ignored here.

use std::sync::Arc;

use spyglass_common::{EventType, RawEvent};

use crate::config::ConfigHandle;
use crate::dispatch::{HandleResult, SignalHandler};
use crate::endpoints::{EndpointId, EndpointTracker};
use crate::event::EventExtractor;
use crate::net::{L4Proto, Role};
use crate::stats::PipelineStats;

pub struct EndpointSignalHandler {
    extractor: EventExtractor,
    tracker: Arc<EndpointTracker>,
    config: Arc<ConfigHandle>,
    stats: Arc<PipelineStats>,
}

impl EndpointSignalHandler {
    pub fn new(
        extractor: EventExtractor,
        tracker: Arc<EndpointTracker>,
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
}

impl SignalHandler for EndpointSignalHandler {
    fn name(&self) -> &'static str {
        "endpoint"
    }

    fn relevant_events(&self) -> &'static [EventType] {
        &[
            EventType::ListenExit,
            EventType::CloseExit,
            EventType::ShutdownExit,
        ]
    }

    fn handle(&mut self, evt: &RawEvent) -> HandleResult {
        let is_add = match self.extractor.event_type(evt) {
            Some(EventType::ListenExit) => true,
            Some(EventType::CloseExit) | Some(EventType::ShutdownExit) => false,
            _ => return HandleResult::Ignored,
        };

        match self.extractor.res(evt) {
            Some(res) if res >= 0 => {}
            _ => return HandleResult::Ignored,
        }

        let Some(fd) = self.extractor.fd_info(evt) else {
            return HandleResult::Ignored;
        };
        // A listening socket has no peer; a close with a connected client
        // side is a connection event, not an endpoint one.
        if fd.role != Some(Role::Server) || !fd.client.is_unspecified() || fd.client.port != 0 {
            return HandleResult::Ignored;
        }
        if !matches!(fd.proto, L4Proto::Tcp | L4Proto::Udp) {
            PipelineStats::bump(&self.stats.unsupported_proto);
            return HandleResult::Ignored;
        }

        let Some(container_id) = self.extractor.container_id(evt) else {
            PipelineStats::bump(&self.stats.no_container);
            return HandleResult::Ignored;
        };

        let id = EndpointId {
            container_id,
            endpoint: fd.server,
            proto: fd.proto,
        };

        let originator = (is_add && self.config.load().processes_listening_on_port)
            .then(|| self.extractor.process_info(evt));

        self.tracker
            .update_endpoint(id, self.extractor.ts_micros(evt), is_add, originator);
        HandleResult::Processed
    }
}
