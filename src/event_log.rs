//! Event log for workflow runs
//!
//! Append-only audit trail of one run's progress:
//! - `Event`: envelope with id + timestamp + kind
//! - `EventKind`: run / state / action level variants
//! - `EventLog`: thread-safe, append-only log shared across branches

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Single event in the run's execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence id (for ordering)
    pub id: u64,
    /// Time since run start (ms)
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

/// All event types across the three levels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // RUN LEVEL
    // ═══════════════════════════════════════════
    RunStarted { workflow_id: String, run_id: String },
    RunCompleted { final_state: String, total_duration_ms: u64 },
    RunFailed { error: String },
    RunCancelled,

    // ═══════════════════════════════════════════
    // STATE LEVEL
    // ═══════════════════════════════════════════
    StateEntered { state_id: Arc<str> },
    StateExited { state_id: Arc<str> },
    TransitionTaken { from: Arc<str>, to: Arc<str>, guarded: bool },

    // ═══════════════════════════════════════════
    // ACTION LEVEL
    // ═══════════════════════════════════════════
    ActionStarted { element_id: Arc<str>, sub_type: String },
    ActionCompleted { element_id: Arc<str>, duration_ms: u64 },
    ActionFailed { element_id: Arc<str>, error: String },
    ActionSkipped { element_id: Arc<str> },
}

impl EventKind {
    /// Element/state id if the event is tied to one
    pub fn element_id(&self) -> Option<&str> {
        match self {
            Self::StateEntered { state_id } | Self::StateExited { state_id } => Some(state_id),
            Self::ActionStarted { element_id, .. }
            | Self::ActionCompleted { element_id, .. }
            | Self::ActionFailed { element_id, .. }
            | Self::ActionSkipped { element_id } => Some(element_id),
            Self::TransitionTaken { from, .. } => Some(from),
            Self::RunStarted { .. }
            | Self::RunCompleted { .. }
            | Self::RunFailed { .. }
            | Self::RunCancelled => None,
        }
    }

    pub fn is_run_event(&self) -> bool {
        matches!(
            self,
            Self::RunStarted { .. }
                | Self::RunCompleted { .. }
                | Self::RunFailed { .. }
                | Self::RunCancelled
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    /// Create a new event log (call at run start)
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event id)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };
        self.events.write().push(event);
        id
    }

    /// All events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Events tied to one element id
    pub fn filter_element(&self, element_id: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.element_id() == Some(element_id))
            .collect()
    }

    /// Run-level events only
    pub fn run_events(&self) -> Vec<Event> {
        self.events().into_iter().filter(|e| e.kind.is_run_event()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_ordered_and_timestamped() {
        let log = EventLog::new();
        log.emit(EventKind::RunStarted { workflow_id: "w".into(), run_id: "r".into() });
        log.emit(EventKind::StateEntered { state_id: Arc::from("s") });
        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 0);
        assert_eq!(events[1].id, 1);
        assert!(events[1].timestamp_ms >= events[0].timestamp_ms);
    }

    #[test]
    fn filter_by_element() {
        let log = EventLog::new();
        log.emit(EventKind::StateEntered { state_id: Arc::from("a") });
        log.emit(EventKind::StateEntered { state_id: Arc::from("b") });
        log.emit(EventKind::ActionStarted { element_id: Arc::from("a"), sub_type: "llm".into() });
        assert_eq!(log.filter_element("a").len(), 2);
        assert_eq!(log.filter_element("b").len(), 1);
    }

    #[test]
    fn run_events_filter() {
        let log = EventLog::new();
        log.emit(EventKind::RunStarted { workflow_id: "w".into(), run_id: "r".into() });
        log.emit(EventKind::StateEntered { state_id: Arc::from("s") });
        log.emit(EventKind::RunCompleted { final_state: "final".into(), total_duration_ms: 3 });
        assert_eq!(log.run_events().len(), 2);
    }
}
