//! # Epicflow
//!
//! A controller that reduces EPIC (PN and MOS) observation archives into
//! spectral products by driving an external analysis toolchain.
//!
//! Epicflow provides:
//!
//! - **A stage state machine**: acquisition, calibration, event generation,
//!   anomaly resolution, masking, extraction, conversion and verification
//! - **Artifact gates**: exposures leave the active set when an expected file
//!   is missing, never when a tool merely exits non-zero
//! - **Log inspection**: marker-driven retries, CCD anomaly vectors and
//!   masking decisions as pure functions over captured text
//! - **Isolated tool environments**: per-observation bindings and private
//!   installation copies so observations can run concurrently
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use epicflow::prelude::*;
//! use std::sync::Arc;
//!
//! let config = Arc::new(PipelineConfig::from_file("epicflow.toml")?);
//! let runner = Arc::new(ProcessToolRunner::new().with_timeout(config.stage_timeout()));
//! let report = PipelineController::new(config, "0100000101".parse()?, runner)
//!     .run()
//!     .await;
//! println!("{report}");
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod anomaly;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod inspect;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod summary;
pub mod testing;
pub mod tools;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{InstallationConfig, PipelineConfig, ToolSpec};
    pub use crate::core::{
        DetectorFamily, Exposure, ExposurePrefix, ExposureStatus, ObservationId,
        ObservationStatus, UsabilityVector,
    };
    pub use crate::errors::{EpicflowError, FailureKind};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{PipelineController, PipelineState, RunReport, StageOutcome};
    pub use crate::report::ReductionReport;
    pub use crate::tools::{
        IsolatedInstallation, ProcessToolRunner, ToolEnvironment, ToolRunner,
    };
}
