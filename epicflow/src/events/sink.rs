//! Event sink trait and implementations.

use super::PipelineEvent;
use tracing::{debug, info, Level};

/// Receives the decisions a controller takes while it runs.
///
/// Sinks are owned per controller instance; emission never fails and never
/// blocks on anything but the sink's own bookkeeping.
pub trait EventSink: Send + Sync {
    /// Records one event.
    fn emit(&self, event: &PipelineEvent);
}

/// A sink that discards all events. Used when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: &PipelineEvent) {}
}

/// A sink that forwards events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level` (anything but `DEBUG` logs at `INFO`).
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        let data = serde_json::to_string(event).unwrap_or_default();
        if self.level == Level::DEBUG {
            debug!(event_type = event.event_type(), event_data = %data, "Event: {}", event.event_type());
        } else {
            info!(event_type = event.event_type(), event_data = %data, "Event: {}", event.event_type());
        }
    }
}

/// A sink that keeps every event in memory, for tests and reports.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events whose type starts with `type_prefix` (e.g. `"exposure."`).
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineState;

    fn started(stage: PipelineState) -> PipelineEvent {
        PipelineEvent::StageStarted {
            obs_id: "0100000101".to_string(),
            stage,
        }
    }

    #[test]
    fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit(&started(PipelineState::Init));
        LoggingEventSink::default().emit(&started(PipelineState::Acquire));
        LoggingEventSink::debug().emit(&started(PipelineState::Acquire));
    }

    #[test]
    fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&started(PipelineState::Init));
        sink.emit(&PipelineEvent::ExposureDropped {
            obs_id: "0100000101".to_string(),
            prefix: "2S001".to_string(),
            reason: "no filtered events".to_string(),
        });
        sink.emit(&started(PipelineState::Acquire));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(sink.events_of_type("exposure.").len(), 1);
    }
}
