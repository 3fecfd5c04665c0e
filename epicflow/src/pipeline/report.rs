//! The result of one observation run.

use super::{PipelineState, StageResult};
use crate::core::{BackgroundState, Exposure, ExposureStatus, MaskState, ObservationId, ObservationStatus};
use crate::errors::FailureKind;
use crate::summary::{FAILURE_LINE, SUCCESS_LINE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Everything a finished controller knows about its observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Identifier of this run, shared with its tracing span.
    pub run_id: Uuid,
    /// Observation identifier.
    pub obs_id: ObservationId,
    /// Terminal status.
    pub status: ObservationStatus,
    /// Revolution, if it was extracted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revolution: Option<u32>,
    /// Observation root.
    pub root: PathBuf,
    /// Summary log, absent when the run stopped before creating it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<PathBuf>,
    /// Every stage entered, in order.
    pub stages: Vec<StageResult>,
    /// Every discovered exposure with its final state.
    pub exposures: Vec<Exposure>,
}

impl RunReport {
    /// Returns true if the observation succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == ObservationStatus::Succeeded
    }

    /// The failure classification, if the run failed.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.status {
            ObservationStatus::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// `Complete!` or `Processing failed!`.
    #[must_use]
    pub fn terminal_line(&self) -> &'static str {
        if self.succeeded() {
            SUCCESS_LINE
        } else {
            FAILURE_LINE
        }
    }

    /// The last stage entered.
    #[must_use]
    pub fn last_stage(&self) -> Option<PipelineState> {
        self.stages.last().map(|s| s.stage)
    }

    /// The result of `stage`, if it ran.
    #[must_use]
    pub fn stage(&self, stage: PipelineState) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Looks an exposure up by its prefix text (e.g. `1S001`).
    #[must_use]
    pub fn exposure(&self, prefix: &str) -> Option<&Exposure> {
        self.exposures.iter().find(|e| e.prefix.to_string() == prefix)
    }

    /// Prefixes still in the active set.
    #[must_use]
    pub fn active_prefixes(&self) -> Vec<String> {
        self.exposures
            .iter()
            .filter(|e| e.is_active())
            .map(|e| e.prefix.to_string())
            .collect()
    }

    /// Prefixes with a converted product.
    #[must_use]
    pub fn converted_prefixes(&self) -> Vec<String> {
        self.exposures
            .iter()
            .filter(|e| e.status == ExposureStatus::Converted)
            .map(|e| e.prefix.to_string())
            .collect()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observation {}: {}", self.obs_id, self.status)?;
        if let Some(revolution) = self.revolution {
            write!(f, " (revolution {revolution})")?;
        }
        writeln!(f)?;

        for stage in &self.stages {
            write!(
                f,
                "  {:>2}. {:<20} {} [{} invocation(s)",
                stage.stage.ordinal(),
                stage.stage.name(),
                stage.outcome,
                stage.invocations.len()
            )?;
            if stage.retries > 0 {
                write!(f, ", {} rerun(s)", stage.retries)?;
            }
            writeln!(f, ", {} ms]", stage.duration_ms())?;
        }

        for exposure in &self.exposures {
            write!(f, "  {} {}: {}", exposure.prefix.family(), exposure.prefix, exposure.status)?;
            if exposure.is_active() {
                let mask = match exposure.mask {
                    MaskState::Pending => "pending",
                    MaskState::Available => "available",
                    MaskState::Unavailable => "unavailable",
                };
                let background = match &exposure.background {
                    BackgroundState::Pending => "pending".to_string(),
                    BackgroundState::Estimated => "estimated".to_string(),
                    BackgroundState::Skipped(reason) => format!("skipped ({reason})"),
                };
                write!(
                    f,
                    "; ccds {}; mask {mask}; background {background}",
                    exposure.usability
                )?;
            }
            writeln!(f)?;
            for note in &exposure.notes {
                writeln!(f, "      {note}")?;
            }
        }
        write!(f, "{}", self.terminal_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageOutcome;

    fn report(status: ObservationStatus) -> RunReport {
        let mut exposure = Exposure::discovered("1S001".parse().unwrap());
        exposure.status = ExposureStatus::Converted;
        exposure.background = BackgroundState::Skipped("singular fit".to_string());
        let mut dropped = Exposure::discovered("2S001".parse().unwrap());
        dropped.status = ExposureStatus::Dropped("no filtered events".to_string());

        let mut stage = StageResult::started(PipelineState::MaskPointSources);
        stage.retries = 2;
        stage.finish(StageOutcome::Passed);

        RunReport {
            run_id: Uuid::new_v4(),
            obs_id: "0100000101".parse().unwrap(),
            status,
            revolution: Some(123),
            root: PathBuf::from("/data/0100000101"),
            summary_path: None,
            stages: vec![stage],
            exposures: vec![exposure, dropped],
        }
    }

    #[test]
    fn test_queries() {
        let report = report(ObservationStatus::Succeeded);
        assert!(report.succeeded());
        assert_eq!(report.failure_kind(), None);
        assert_eq!(report.active_prefixes(), vec!["1S001"]);
        assert_eq!(report.converted_prefixes(), vec!["1S001"]);
        assert_eq!(report.last_stage(), Some(PipelineState::MaskPointSources));
        assert!(report.stage(PipelineState::Init).is_none());
        assert!(report.exposure("2S001").is_some_and(|e| !e.is_active()));
    }

    #[test]
    fn test_display() {
        let text = report(ObservationStatus::Succeeded).to_string();
        assert!(text.starts_with("Observation 0100000101: succeeded (revolution 123)"));
        assert!(text.contains("mask_point_sources"));
        assert!(text.contains("2 rerun(s)"));
        assert!(text.contains("background skipped (singular fit)"));
        assert!(text.contains("MOS 2S001: dropped (no filtered events)"));
        assert!(text.ends_with("Complete!"));

        let failed = report(ObservationStatus::Failed {
            kind: FailureKind::TerminalVerification,
            reason: "no converted outputs".to_string(),
        });
        assert_eq!(failed.failure_kind(), Some(FailureKind::TerminalVerification));
        assert!(failed.to_string().ends_with("Processing failed!"));
    }

    #[test]
    fn test_json_round_trip_keeps_status() {
        let report = report(ObservationStatus::Succeeded);
        let json = serde_json::to_string(&report).unwrap();
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert!(back.succeeded());
        assert_eq!(back.exposures.len(), 2);
    }
}
