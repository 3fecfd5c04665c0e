//! Testing utilities for epicflow controllers.
//!
//! This module provides:
//! - A tool runner driven by closures instead of processes
//! - A scripted observation that fakes every tool consistently

mod fixtures;
mod scripted;

pub use fixtures::{ObservationScript, TcxFault, MOS_CHAIN};
pub use scripted::{ScriptedCall, ScriptedOutput, ScriptedToolRunner};
