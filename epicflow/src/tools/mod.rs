//! External tool execution.
//!
//! This module provides:
//! - The [`ToolRunner`] seam and its process-backed implementation
//! - Invocation and captured-run types
//! - Per-instance tool environments and private installations

mod environment;
mod runner;

pub use environment::{
    IsolatedInstallation, ToolEnvironment, SAS_CCF, SAS_CCFPATH, SAS_DIR, SAS_ODF,
};
#[cfg(test)]
pub use runner::MockToolRunner;
pub use runner::{
    log_file_name, log_path, ProcessToolRunner, ToolInvocation, ToolRun, ToolRunner,
};
