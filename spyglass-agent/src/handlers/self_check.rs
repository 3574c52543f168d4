//! Startup self-check handler
//!
//! Verifies the driver end-to-end at startup: a short-lived companion
//! process performs a known network syscall sequence, and this handler
//! watches for any event attributed to it. First match signals success and
//! returns `Finished`, which removes the handler from the registry.
//!
//! Matching is by process name and executable path; pid matching is not
//! possible because the driver reports host pids while the companion sees
//! its namespace pid.

use std::time::{Duration, Instant};

use spyglass_common::{EventType, RawEvent};
use tokio::sync::oneshot;

use crate::dispatch::{HandleResult, SignalHandler};
use crate::event::EventExtractor;

pub const SELF_CHECK_COMM: &str = "spyglass-check";
pub const SELF_CHECK_EXE: &str = "/usr/local/bin/spyglass-check";

pub const DEFAULT_SELF_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SelfCheckNetworkHandler {
    extractor: EventExtractor,
    started_at: Instant,
    timeout: Duration,
    verified_tx: Option<oneshot::Sender<()>>,
}

impl SelfCheckNetworkHandler {
    pub fn new(extractor: EventExtractor, verified_tx: oneshot::Sender<()>) -> Self {
        Self::with_timeout(extractor, verified_tx, DEFAULT_SELF_CHECK_TIMEOUT)
    }

    pub fn with_timeout(
        extractor: EventExtractor,
        verified_tx: oneshot::Sender<()>,
        timeout: Duration,
    ) -> Self {
        Self {
            extractor,
            started_at: Instant::now(),
            timeout,
            verified_tx: Some(verified_tx),
        }
    }

    pub fn timed_out(&self) -> bool {
        Instant::now() > self.started_at + self.timeout
    }

    fn is_self_check_event(&self, evt: &RawEvent) -> bool {
        let comm = self.extractor.comm(evt);
        let exe = self.extractor.exe(evt);
        comm == Some(SELF_CHECK_COMM) || exe == Some(SELF_CHECK_EXE)
    }
}

impl SignalHandler for SelfCheckNetworkHandler {
    fn name(&self) -> &'static str {
        "self-check-network"
    }

    fn relevant_events(&self) -> &'static [EventType] {
        &[
            EventType::ConnectExit,
            EventType::AcceptExit,
            EventType::GetsockoptExit,
            EventType::CloseExit,
            EventType::ShutdownExit,
        ]
    }

    fn handle(&mut self, evt: &RawEvent) -> HandleResult {
        if !self.is_self_check_event(evt) {
            return HandleResult::Ignored;
        }
        if let Some(tx) = self.verified_tx.take() {
            let _ = tx.send(());
        }
        HandleResult::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::StaticContainerLookup;
    use std::sync::Arc;

    fn extractor() -> EventExtractor {
        EventExtractor::new(Arc::new(StaticContainerLookup::new::<_, String>([])))
    }

    fn check_event(comm: &str) -> RawEvent {
        let mut evt = RawEvent::zeroed();
        evt.event_type = EventType::GetsockoptExit.ordinal();
        evt.comm[..comm.len()].copy_from_slice(comm.as_bytes());
        evt
    }

    #[test]
    fn test_matching_comm_finishes_and_signals() {
        let (tx, mut rx) = oneshot::channel();
        let mut handler = SelfCheckNetworkHandler::new(extractor(), tx);

        assert_eq!(
            handler.handle(&check_event(SELF_CHECK_COMM)),
            HandleResult::Finished
        );
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_matching_exe_finishes() {
        let (tx, _rx) = oneshot::channel();
        let mut handler = SelfCheckNetworkHandler::new(extractor(), tx);

        let mut evt = check_event("other");
        evt.exe[..SELF_CHECK_EXE.len()].copy_from_slice(SELF_CHECK_EXE.as_bytes());
        assert_eq!(handler.handle(&evt), HandleResult::Finished);
    }

    #[test]
    fn test_unrelated_event_ignored() {
        let (tx, mut rx) = oneshot::channel();
        let mut handler = SelfCheckNetworkHandler::new(extractor(), tx);

        assert_eq!(handler.handle(&check_event("curl")), HandleResult::Ignored);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_timeout() {
        let (tx, _rx) = oneshot::channel();
        let handler =
            SelfCheckNetworkHandler::with_timeout(extractor(), tx, Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(handler.timed_out());
    }
}
