//! The per-observation audit file.
//!
//! Every line is either the exact command about to run or a literal status
//! message. Lines are flushed as they are written so a crashed run still
//! leaves its trail behind.

use crate::pipeline::{PipelineState, StageOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Terminal line written when the observation fails.
pub const FAILURE_LINE: &str = "Processing failed!";
/// Terminal line written when the observation succeeds.
pub const SUCCESS_LINE: &str = "Complete!";

/// What a summary line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Echo of a command line.
    Command,
    /// Literal status message.
    Status,
}

/// One appended line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    /// Stage that wrote the line; `None` for the terminal line.
    pub stage: Option<PipelineState>,
    /// Command echo or status.
    pub kind: EntryKind,
    /// The line as written.
    pub text: String,
    /// When it was written.
    pub at: DateTime<Utc>,
}

/// Append-only summary log.
#[derive(Debug)]
pub struct SummaryLog {
    path: PathBuf,
    file: File,
    entries: Vec<SummaryEntry>,
}

impl SummaryLog {
    /// Creates the log file, which must not exist yet.
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().append(true).create_new(true).open(&path)?;
        Ok(Self {
            path,
            file,
            entries: Vec::new(),
        })
    }

    /// Location of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Everything written so far.
    #[must_use]
    pub fn entries(&self) -> &[SummaryEntry] {
        &self.entries
    }

    /// Echoes a command line.
    pub fn command(&mut self, stage: PipelineState, command_line: &str) -> std::io::Result<()> {
        self.append(Some(stage), EntryKind::Command, command_line)
    }

    /// Writes a status message.
    pub fn status(&mut self, stage: PipelineState, message: &str) -> std::io::Result<()> {
        self.append(Some(stage), EntryKind::Status, message)
    }

    /// Writes the `Stage <name>: <outcome>` line closing a stage.
    pub fn stage_outcome(
        &mut self,
        stage: PipelineState,
        outcome: &StageOutcome,
    ) -> std::io::Result<()> {
        let line = format!("Stage {stage}: {outcome}");
        self.append(Some(stage), EntryKind::Status, &line)
    }

    /// Writes [`SUCCESS_LINE`] or [`FAILURE_LINE`].
    pub fn finish(&mut self, succeeded: bool) -> std::io::Result<()> {
        let line = if succeeded { SUCCESS_LINE } else { FAILURE_LINE };
        self.append(None, EntryKind::Status, line)
    }

    fn append(
        &mut self,
        stage: Option<PipelineState>,
        kind: EntryKind,
        text: &str,
    ) -> std::io::Result<()> {
        // Multi-line tool messages would break the one-entry-per-line contract.
        let text = text.replace('\n', " ");
        writeln!(self.file, "{text}")?;
        self.file.flush()?;

        let stage_name = stage.map_or("-", PipelineState::name);
        match kind {
            EntryKind::Command => info!(stage = stage_name, command = %text, "Running"),
            EntryKind::Status => info!(stage = stage_name, "{}", text),
        }

        self.entries.push(SummaryEntry {
            stage,
            kind,
            text,
            at: Utc::now(),
        });
        Ok(())
    }
}
