//! Error types for the epicflow pipeline controller.
//!
//! Two layers live here: the Rust error enums returned by fallible
//! operations, and [`FailureKind`], the taxonomy the controller uses to
//! decide whether a condition aborts the observation and which working data
//! must be discarded when it does.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for epicflow operations.
#[derive(Debug, Error)]
pub enum EpicflowError {
    /// Text produced by an external tool could not be parsed.
    #[error("{0}")]
    Parse(#[from] ParseError),

    /// An external tool could not be run.
    #[error("{0}")]
    Tool(#[from] ToolError),

    /// The pipeline configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A stage gate stopped the observation.
    #[error("{kind}: {reason}")]
    Gate {
        /// Classification of the failure.
        kind: FailureKind,
        /// Human-readable reason.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EpicflowError {
    /// Creates a gate failure.
    #[must_use]
    pub fn gate(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::Gate {
            kind,
            reason: reason.into(),
        }
    }

    /// Returns the failure classification of this error.
    ///
    /// Errors that did not originate from a gate are treated as fatal
    /// validation failures: the controller cannot trust anything produced
    /// after an IO or parse error.
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Gate { kind, .. } => *kind,
            Self::Parse(_) | Self::Tool(_) | Self::Config(_) | Self::Io(_) => {
                FailureKind::FatalValidation
            }
        }
    }
}

/// Error raised when tool output or a listing file does not match the
/// expected grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Parse error on '{input}': {reason}")]
pub struct ParseError {
    /// The offending input (a line, a token or a file name).
    pub input: String,
    /// Why it was rejected.
    pub reason: String,
}

impl ParseError {
    /// Creates a new parse error.
    #[must_use]
    pub fn new(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Errors related to running external tools.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool process could not be started.
    #[error("Failed to spawn {tool}: {source}")]
    Spawn {
        /// The logical tool name.
        tool: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the tool to exit failed.
    #[error("Failed waiting for {tool}: {source}")]
    Wait {
        /// The logical tool name.
        tool: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The captured log could not be created or read back.
    #[error("Failed to capture log for {tool} at {}: {source}", path.display())]
    LogCapture {
        /// The logical tool name.
        tool: String,
        /// The log file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The private tool installation could not be provisioned.
    #[error("Failed to provision tool installation at {}: {reason}", path.display())]
    Installation {
        /// Target directory.
        path: PathBuf,
        /// The reason for failure.
        reason: String,
    },
}

impl ToolError {
    /// Creates a spawn error.
    #[must_use]
    pub fn spawn(tool: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            tool: tool.into(),
            source,
        }
    }

    /// Creates a wait error.
    #[must_use]
    pub fn wait(tool: impl Into<String>, source: std::io::Error) -> Self {
        Self::Wait {
            tool: tool.into(),
            source,
        }
    }

    /// Creates a log capture error.
    #[must_use]
    pub fn log_capture(
        tool: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::LogCapture {
            tool: tool.into(),
            path: path.into(),
            source,
        }
    }

    /// Creates an installation error.
    #[must_use]
    pub fn installation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Installation {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        /// The config path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::config::PipelineConfig`].
    #[error("Invalid config: {0}")]
    Syntax(#[from] toml::de::Error),

    /// A value is present but unusable.
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid {
        /// The offending field.
        field: String,
        /// The reason.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid-value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Classification of every non-nominal condition the controller observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Protected data or an archive the fallback reconstruction could not repair.
    FatalAcquisition,
    /// Pre-threshold revolution, zero discovered exposures, unusable calibration.
    FatalValidation,
    /// Insufficient time-correlation data; handled by one rerun.
    RecoverableToolFailure,
    /// An expected output file is missing after a stage; the exposure is dropped.
    RecoverableArtifactFailure,
    /// Singular background fit; background estimation alone is skipped.
    DegradedEstimation,
    /// No converted output exists at the end of the run.
    TerminalVerification,
}

/// What the controller removes when an observation stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Leave the observation root untouched.
    None,
    /// Remove the downloaded archive and every working subdirectory.
    DiscardWorkingData,
    /// Remove intermediate subdirectories only.
    RemoveIntermediates,
}

impl FailureKind {
    /// Returns true if the condition terminates the observation.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::FatalAcquisition | Self::FatalValidation | Self::TerminalVerification
        )
    }

    /// Returns the cleanup the controller performs when this kind aborts a run.
    #[must_use]
    pub fn cleanup_policy(self) -> CleanupPolicy {
        match self {
            Self::FatalAcquisition => CleanupPolicy::None,
            Self::FatalValidation => CleanupPolicy::DiscardWorkingData,
            Self::RecoverableToolFailure
            | Self::RecoverableArtifactFailure
            | Self::DegradedEstimation
            | Self::TerminalVerification => CleanupPolicy::RemoveIntermediates,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FatalAcquisition => write!(f, "fatal acquisition"),
            Self::FatalValidation => write!(f, "fatal validation"),
            Self::RecoverableToolFailure => write!(f, "recoverable tool failure"),
            Self::RecoverableArtifactFailure => write!(f, "recoverable artifact failure"),
            Self::DegradedEstimation => write!(f, "degraded estimation"),
            Self::TerminalVerification => write!(f, "terminal verification"),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = EpicflowError> = std::result::Result<T, E>;
