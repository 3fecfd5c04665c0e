//! Per-stage results folded into the run report.

use super::PipelineState;
use crate::errors::FailureKind;
use crate::tools::{ToolInvocation, ToolRun};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How a stage ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StageOutcome {
    /// The exit gate passed.
    Passed,
    /// The stage had nothing to do.
    Skipped {
        /// Why.
        reason: String,
    },
    /// The exit gate stopped the observation.
    Failed {
        /// Classification.
        kind: FailureKind,
        /// Why.
        reason: String,
    },
}

impl StageOutcome {
    /// Creates a skipped outcome.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    /// Returns true unless the stage failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Skipped { reason } => write!(f, "skipped ({reason})"),
            Self::Failed { kind, reason } => write!(f, "failed ({kind}: {reason})"),
        }
    }
}

/// One external invocation made during a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRecord {
    /// Logical tool name.
    pub tool: String,
    /// Exact command line as echoed into the summary.
    pub command_line: String,
    /// Captured log.
    pub log_path: PathBuf,
    /// Exit code, advisory only.
    pub exit_code: Option<i32>,
    /// Whether the wall-clock limit expired.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl InvocationRecord {
    /// Builds a record from an invocation and its run.
    #[must_use]
    pub fn new(invocation: &ToolInvocation, run: &ToolRun) -> Self {
        Self {
            tool: invocation.tool.clone(),
            command_line: invocation.command_line(),
            log_path: run.log_path.clone(),
            exit_code: run.exit_code,
            timed_out: run.timed_out,
        }
    }
}

/// Result of one controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// The state.
    pub stage: PipelineState,
    /// How it ended.
    pub outcome: StageOutcome,
    /// When it started.
    pub started_at: DateTime<Utc>,
    /// When it ended.
    pub ended_at: DateTime<Utc>,
    /// Invocations in order.
    #[serde(default)]
    pub invocations: Vec<InvocationRecord>,
    /// Reruns consumed across the stage.
    pub retries: usize,
}

impl StageResult {
    /// Starts a result for `stage`; the outcome is provisional until [`Self::finish`].
    #[must_use]
    pub fn started(stage: PipelineState) -> Self {
        let now = Utc::now();
        Self {
            stage,
            outcome: StageOutcome::Passed,
            started_at: now,
            ended_at: now,
            invocations: Vec::new(),
            retries: 0,
        }
    }

    /// Seals the result.
    pub fn finish(&mut self, outcome: StageOutcome) {
        self.outcome = outcome;
        self.ended_at = Utc::now();
    }

    /// Duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    /// Number of invocations of `tool`.
    #[must_use]
    pub fn invocation_count(&self, tool: &str) -> usize {
        self.invocations.iter().filter(|i| i.tool == tool).count()
    }
}
