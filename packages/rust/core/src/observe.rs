//! Transition observers.
//!
//! The engine calls [`TransitionObserver::on_transition`] once per edge it
//! crosses, after the write has committed. Observers must be cheap and must
//! not fail; anything slow belongs behind a channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use linkflow_shared::{ItemId, Outcome, Stage, Status};

/// One committed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub item_id: ItemId,
    pub from: Status,
    pub to: Status,
    pub stage: Option<Stage>,
    /// Time the item spent in `from`.
    pub duration: Duration,
    pub outcome: Outcome,
}

/// Receives every committed transition.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, event: &TransitionEvent);
}

/// Emits one structured `tracing` event per transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TransitionObserver for TracingObserver {
    fn on_transition(&self, event: &TransitionEvent) {
        tracing::info!(
            target: "linkflow::transition",
            item_id = %event.item_id,
            from = %event.from,
            to = %event.to,
            stage = event.stage.map(|s| s.as_str()),
            duration_ms = event.duration.as_millis() as u64,
            outcome = %event.outcome,
            "transition"
        );
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransitionObserver for NoopObserver {
    fn on_transition(&self, _event: &TransitionEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<TransitionEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events seen so far.
    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of events with the given outcome.
    pub fn count(&self, outcome: Outcome) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.outcome == outcome)
            .count()
    }

    /// Events for one item, in order.
    pub fn for_item(&self, item_id: ItemId) -> Vec<TransitionEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.item_id == item_id)
            .cloned()
            .collect()
    }
}

impl TransitionObserver for RecordingObserver {
    fn on_transition(&self, event: &TransitionEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Forwards each event to several observers, in order.
#[derive(Default, Clone)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn TransitionObserver>>,
}

impl FanoutObserver {
    pub fn new(observers: Vec<Arc<dyn TransitionObserver>>) -> Self {
        Self { observers }
    }

    pub fn with(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl TransitionObserver for FanoutObserver {
    fn on_transition(&self, event: &TransitionEvent) {
        for observer in &self.observers {
            observer.on_transition(event);
        }
    }
}
