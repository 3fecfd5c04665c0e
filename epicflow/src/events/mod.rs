//! Event emission for observability.
//!
//! The controller reports every stage transition, tool invocation and
//! exposure drop to an [`EventSink`] owned by that controller instance.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::ObservationStatus;
use crate::pipeline::{PipelineState, StageOutcome};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Something the controller did or decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A stage was entered.
    StageStarted {
        /// Observation identifier.
        obs_id: String,
        /// The stage.
        stage: PipelineState,
    },
    /// A stage finished.
    StageCompleted {
        /// Observation identifier.
        obs_id: String,
        /// The stage.
        stage: PipelineState,
        /// How it ended.
        outcome: StageOutcome,
    },
    /// An external tool is about to run.
    ToolInvoked {
        /// Observation identifier.
        obs_id: String,
        /// Logical tool name.
        tool: String,
        /// Exact command line.
        command_line: String,
        /// Captured log location.
        log_path: PathBuf,
    },
    /// An exposure left the active set.
    ExposureDropped {
        /// Observation identifier.
        obs_id: String,
        /// Exposure prefix.
        prefix: String,
        /// Why.
        reason: String,
    },
    /// The observation reached a terminal status.
    ObservationFinished {
        /// Observation identifier.
        obs_id: String,
        /// Terminal status.
        status: ObservationStatus,
    },
}

impl PipelineEvent {
    /// Dotted event type, e.g. `stage.started`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StageStarted { .. } => "stage.started",
            Self::StageCompleted { .. } => "stage.completed",
            Self::ToolInvoked { .. } => "tool.invoked",
            Self::ExposureDropped { .. } => "exposure.dropped",
            Self::ObservationFinished { .. } => "observation.finished",
        }
    }
}
