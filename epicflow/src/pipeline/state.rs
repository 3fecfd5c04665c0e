//! Controller states and their transition order.

use super::retry::{RetryPolicy, RetryTrigger};
use crate::inspect::markers;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One state of the reduction state machine.
///
/// States run strictly in declaration order; each has an exit gate applied
/// by the controller and a retry budget declared here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Refuse already-processed observations; bind the tool environment.
    Init,
    /// Download and unpack the archive.
    Acquire,
    /// Gate on the revolution number.
    ValidateRevolution,
    /// Build the calibration index and ingest the ODF summary.
    Calibrate,
    /// Populate the exposure registry.
    Discover,
    /// PN event lists, CTI correction and filtering.
    PnEvents,
    /// MOS event chain and filtering.
    MosEvents,
    /// Per-CCD usability for MOS exposures.
    ResolveAnomalies,
    /// Point-source detection.
    MaskPointSources,
    /// Spectra and background models.
    ExtractSpectra,
    /// Conversion to the analysis format, then cleanup.
    Convert,
    /// At least one converted product must exist.
    Verify,
}

impl PipelineState {
    /// Every state in execution order.
    pub const ALL: [Self; 12] = [
        Self::Init,
        Self::Acquire,
        Self::ValidateRevolution,
        Self::Calibrate,
        Self::Discover,
        Self::PnEvents,
        Self::MosEvents,
        Self::ResolveAnomalies,
        Self::MaskPointSources,
        Self::ExtractSpectra,
        Self::Convert,
        Self::Verify,
    ];

    /// Stable snake_case name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Acquire => "acquire",
            Self::ValidateRevolution => "validate_revolution",
            Self::Calibrate => "calibrate",
            Self::Discover => "discover",
            Self::PnEvents => "pn_events",
            Self::MosEvents => "mos_events",
            Self::ResolveAnomalies => "resolve_anomalies",
            Self::MaskPointSources => "mask_point_sources",
            Self::ExtractSpectra => "extract_spectra",
            Self::Convert => "convert",
            Self::Verify => "verify",
        }
    }

    /// 1-based position in the chain.
    #[must_use]
    pub fn ordinal(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).map_or(0, |i| i + 1)
    }

    /// The state entered after this one passes.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.ordinal()).copied()
    }

    /// The retry budget of this state.
    #[must_use]
    pub fn retry_budget(self) -> RetryPolicy {
        match self {
            Self::PnEvents | Self::MosEvents => {
                RetryPolicy::new(2, RetryTrigger::LogMarker(markers::TOO_FEW_TCX_POINTS))
            }
            Self::MaskPointSources => RetryPolicy::new(3, RetryTrigger::MissingArtifact),
            _ => RetryPolicy::none(),
        }
    }

    /// States that are pointless without a live exposure.
    #[must_use]
    pub fn requires_active_exposures(self) -> bool {
        matches!(
            self,
            Self::MaskPointSources | Self::ExtractSpectra | Self::Convert
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
