//! Running external tools and capturing their logs.

use super::environment::ToolEnvironment;
use crate::errors::ToolError;
use crate::inspect;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A fully resolved external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Logical tool name, used in log names and the summary.
    pub tool: String,
    /// Executable to run.
    pub program: String,
    /// Arguments in order.
    pub args: Vec<String>,
    /// Working directory; the tools discover inputs relative to it.
    pub cwd: PathBuf,
    /// Where stdout and stderr are captured.
    pub log_path: PathBuf,
}

impl ToolInvocation {
    /// Creates an invocation without arguments.
    #[must_use]
    pub fn new(
        tool: impl Into<String>,
        program: impl Into<String>,
        cwd: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            log_path: log_path.into(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The command line as echoed into the summary log.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote(word: &str) -> String {
    if !word.is_empty() && !word.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// What an invocation left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRun {
    /// Captured log location.
    pub log_path: PathBuf,
    /// Captured stdout and stderr, merged in write order.
    pub log_text: String,
    /// Exit code; `None` if killed or timed out.
    pub exit_code: Option<i32>,
    /// Whether the wall-clock limit expired.
    pub timed_out: bool,
    /// Wall-clock time spent.
    pub duration: Duration,
}

impl ToolRun {
    /// Exit-code verdict. Advisory only: the tools exit 0 on partial failure,
    /// so gates check artifacts and log markers instead.
    #[must_use]
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Substring test against the captured log.
    #[must_use]
    pub fn has_marker(&self, marker: &str) -> bool {
        inspect::has_marker(&self.log_text, marker)
    }

    /// Returns true if the run finished in time and `expected` exists.
    ///
    /// A timed-out run may have left a partial file, so its expected
    /// output always counts as absent.
    #[must_use]
    pub fn produced(&self, expected: &Path) -> bool {
        !self.timed_out && expected.is_file()
    }
}

/// Executes external tools.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs `invocation` with `env`, returning once the log is fully captured.
    async fn run(
        &self,
        invocation: &ToolInvocation,
        env: &ToolEnvironment,
    ) -> Result<ToolRun, ToolError>;
}

/// Runs tools as child processes with stdout and stderr sharing one log file.
#[derive(Debug, Clone, Default)]
pub struct ProcessToolRunner {
    timeout: Option<Duration>,
}

impl ProcessToolRunner {
    /// Creates a runner without a time limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a per-invocation wall-clock limit.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn open_log(invocation: &ToolInvocation) -> Result<(std::fs::File, std::fs::File), ToolError> {
        let capture = |source| ToolError::log_capture(&invocation.tool, &invocation.log_path, source);
        if let Some(parent) = invocation.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(capture)?;
        }
        let stdout = std::fs::File::create(&invocation.log_path).map_err(capture)?;
        let stderr = stdout.try_clone().map_err(capture)?;
        Ok((stdout, stderr))
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        env: &ToolEnvironment,
    ) -> Result<ToolRun, ToolError> {
        let (stdout, stderr) = Self::open_log(invocation)?;

        let mut command = tokio::process::Command::new(env.resolve_program(&invocation.program));
        command
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        for (key, value) in env.bindings() {
            command.env(key, value);
        }
        if let Some(path) = env.path_value() {
            command.env("PATH", path);
        }

        debug!(tool = %invocation.tool, cwd = %invocation.cwd.display(), "Spawning tool");
        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| ToolError::spawn(&invocation.tool, e))?;

        let (exit_code, timed_out) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => (
                    status.map_err(|e| ToolError::wait(&invocation.tool, e))?.code(),
                    false,
                ),
                Err(_) => {
                    warn!(
                        tool = %invocation.tool,
                        limit_secs = limit.as_secs(),
                        "Tool exceeded its time limit, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(tool = %invocation.tool, error = %e, "Failed to kill timed-out tool");
                    }
                    (None, true)
                }
            },
            None => (
                child
                    .wait()
                    .await
                    .map_err(|e| ToolError::wait(&invocation.tool, e))?
                    .code(),
                false,
            ),
        };

        let log_text = inspect::read_log(&invocation.log_path)
            .map_err(|e| ToolError::log_capture(&invocation.tool, &invocation.log_path, e))?;

        Ok(ToolRun {
            log_path: invocation.log_path.clone(),
            log_text,
            exit_code,
            timed_out,
            duration: started.elapsed(),
        })
    }
}

/// Deterministic log name: `<tool>[-<detpref>][-<variant>].log`.
#[must_use]
pub fn log_file_name(tool: &str, detpref: Option<&str>, variant: Option<&str>) -> String {
    let mut name = tool.to_string();
    for part in [detpref, variant].into_iter().flatten() {
        name.push('-');
        name.push_str(part);
    }
    name.push_str(".log");
    name
}

/// Joins [`log_file_name`] onto a directory.
#[must_use]
pub fn log_path(dir: &Path, tool: &str, detpref: Option<&str>, variant: Option<&str>) -> PathBuf {
    dir.join(log_file_name(tool, detpref, variant))
}
