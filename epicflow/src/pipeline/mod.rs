//! The observation reduction pipeline.
//!
//! This module provides:
//! - The controller state machine and its states
//! - Declared retry budgets
//! - The on-disk layout of an observation
//! - Stage results and the run report

mod controller;
mod layout;
mod report;
mod result;
mod retry;
mod state;

#[cfg(test)]
mod integration_tests;

pub use controller::PipelineController;
pub use layout::{ObservationLayout, CCF_INDEX, ODF_DIR, ODF_SUMMARY_SUFFIX};
pub use report::RunReport;
pub use result::{InvocationRecord, StageOutcome, StageResult};
pub use retry::{should_retry, RetryDecision, RetryPolicy, RetryState, RetryTrigger};
pub use state::PipelineState;
