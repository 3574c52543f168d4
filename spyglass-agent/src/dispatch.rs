//! Signal handler registry
//!
//! Routes raw events to the handlers that declared interest in their type.
//! Each handler gets a precomputed bitmap over the event-type space, plus a
//! union bitmap for the "is this event interesting to anyone" early exit, so
//! the per-event cost of an irrelevant event is one bit test.
//!
//! The ingestion task owns the registry exclusively; dispatch takes
//! `&mut self` and needs no locks. After start the handler set only shrinks,
//! when a one-shot handler returns `Finished`.

use log::{debug, warn};
use spyglass_common::{EventType, RawEvent, MAX_EVENT_TYPES};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("signal registry has no handlers")]
    EmptyRegistry,
}

/// Outcome of one handler invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleResult {
    Processed,
    Ignored,
    /// One-shot handler is done; remove it from the registry.
    Finished,
    Error,
}

/// Aggregate outcome of dispatching one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Processed,
    Ignored,
}

pub trait SignalHandler: Send {
    fn name(&self) -> &'static str;

    /// Event types this handler wants; resolved into a bitmap at
    /// registration time.
    fn relevant_events(&self) -> &'static [EventType];

    fn handle(&mut self, evt: &RawEvent) -> HandleResult;

    /// Release any held resources at shutdown.
    fn stop(&mut self) {}
}

const FILTER_WORDS: usize = MAX_EVENT_TYPES.div_ceil(64);

/// Fixed-size bitmap over event-type ordinals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct EventFilter([u64; FILTER_WORDS]);

impl EventFilter {
    const fn empty() -> Self {
        Self([0; FILTER_WORDS])
    }

    fn set(&mut self, ty: EventType) {
        let ordinal = ty.ordinal() as usize;
        self.0[ordinal / 64] |= 1 << (ordinal % 64);
    }

    fn test(&self, ordinal: u16) -> bool {
        let ordinal = ordinal as usize;
        if ordinal >= MAX_EVENT_TYPES {
            return false;
        }
        self.0[ordinal / 64] & (1 << (ordinal % 64)) != 0
    }

    fn union_with(&mut self, other: &EventFilter) {
        for (word, other_word) in self.0.iter_mut().zip(other.0.iter()) {
            *word |= other_word;
        }
    }

    fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }
}

struct HandlerEntry {
    handler: Box<dyn SignalHandler>,
    filter: EventFilter,
}

pub struct SignalRegistry {
    handlers: Vec<HandlerEntry>,
    global_filter: EventFilter,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            global_filter: EventFilter::empty(),
        }
    }

    pub fn register(&mut self, handler: Box<dyn SignalHandler>) {
        let mut filter = EventFilter::empty();
        for &ty in handler.relevant_events() {
            filter.set(ty);
        }
        debug!(
            "registered handler {} for {} event types",
            handler.name(),
            handler.relevant_events().len()
        );
        self.global_filter.union_with(&filter);
        self.handlers.push(HandlerEntry { handler, filter });
    }

    /// Startup sanity check; an empty registry is a fatal wiring error.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.handlers.is_empty() || self.global_filter.is_empty() {
            return Err(DispatchError::EmptyRegistry);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch one event to every interested handler, in registration
    /// order. A handler error is logged and does not stop the remaining
    /// handlers.
    pub fn dispatch(&mut self, evt: &RawEvent) -> DispatchOutcome {
        if !self.global_filter.test(evt.event_type) {
            return DispatchOutcome::Ignored;
        }

        let mut processed = false;
        let mut finished_any = false;

        for entry in &mut self.handlers {
            if !entry.filter.test(evt.event_type) {
                continue;
            }
            match entry.handler.handle(evt) {
                HandleResult::Processed => processed = true,
                HandleResult::Ignored => {}
                HandleResult::Finished => {
                    debug!("handler {} finished", entry.handler.name());
                    // Mark for removal by clearing the filter; the entry is
                    // dropped below, outside the iteration.
                    entry.filter = EventFilter::empty();
                    finished_any = true;
                    processed = true;
                }
                HandleResult::Error => {
                    warn!("handler {} failed on {}", entry.handler.name(), evt.event_type);
                }
            }
        }

        if finished_any {
            self.handlers.retain(|entry| !entry.filter.is_empty());
            self.recompute_global_filter();
        }

        if processed {
            DispatchOutcome::Processed
        } else {
            DispatchOutcome::Ignored
        }
    }

    pub fn stop_all(&mut self) {
        for entry in &mut self.handlers {
            entry.handler.stop();
        }
    }

    fn recompute_global_filter(&mut self) {
        let mut filter = EventFilter::empty();
        for entry in &self.handlers {
            filter.union_with(&entry.filter);
        }
        self.global_filter = filter;
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::new()
    }
}
