//! Observation identity and terminal status.

use crate::errors::{FailureKind, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Earliest revolution whose data the calibration regime supports.
pub const MIN_REVOLUTION: u32 = 42;

/// A 10-digit observation catalog number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObservationId(String);

impl ObservationId {
    /// Returns the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ObservationId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 10 && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(s.to_string()))
        } else {
            Err(ParseError::new(s, "observation id must be exactly 10 digits"))
        }
    }
}

impl TryFrom<String> for ObservationId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObservationId> for String {
    fn from(id: ObservationId) -> Self {
        id.0
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of an observation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ObservationStatus {
    /// The controller has not entered any stage yet.
    Pending,
    /// A stage is running.
    InProgress {
        /// Name of the current stage.
        stage: String,
    },
    /// At least one converted product exists.
    Succeeded,
    /// The run stopped.
    Failed {
        /// Failure classification.
        kind: FailureKind,
        /// Human-readable reason.
        reason: String,
    },
}

impl ObservationStatus {
    /// Returns true for `Succeeded` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

impl fmt::Display for ObservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress { stage } => write!(f, "in progress ({stage})"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { kind, reason } => write!(f, "failed: {kind}: {reason}"),
        }
    }
}

/// The observation a controller instance owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Catalog number.
    pub id: ObservationId,
    /// Satellite revolution, once extracted.
    pub revolution: Option<u32>,
    /// Lifecycle status.
    pub status: ObservationStatus,
}

impl Observation {
    /// Creates a pending observation.
    #[must_use]
    pub fn new(id: ObservationId) -> Self {
        Self {
            id,
            revolution: None,
            status: ObservationStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_id_parse() {
        let id: ObservationId = "0123456789".parse().unwrap();
        assert_eq!(id.as_str(), "0123456789");
        assert!("012345678".parse::<ObservationId>().is_err());
        assert!("01234567890".parse::<ObservationId>().is_err());
        assert!("01234X6789".parse::<ObservationId>().is_err());
    }

    #[test]
    fn test_observation_id_serde() {
        let id: ObservationId = serde_json::from_str(r#""0100000101""#).unwrap();
        assert_eq!(id.to_string(), "0100000101");
        assert!(serde_json::from_str::<ObservationId>(r#""abc""#).is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(!ObservationStatus::Pending.is_terminal());
        assert!(ObservationStatus::Succeeded.is_terminal());
        let failed = ObservationStatus::Failed {
            kind: FailureKind::FatalValidation,
            reason: "revolution 41 predates 42".to_string(),
        };
        assert!(failed.is_terminal());
        assert!(failed.to_string().contains("revolution 41"));
    }
}
