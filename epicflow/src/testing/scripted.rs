//! A tool runner that fakes external tools with closures.

use crate::errors::ToolError;
use crate::tools::{ToolEnvironment, ToolInvocation, ToolRun, ToolRunner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// What a faked tool leaves behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptedOutput {
    /// Text written to the captured log.
    pub log: String,
    /// Files to create, relative to the invocation's working directory.
    pub files: Vec<(PathBuf, String)>,
    /// Exit code to report.
    pub exit_code: i32,
    /// Report the invocation as timed out.
    pub timed_out: bool,
}

impl ScriptedOutput {
    /// A run that prints nothing and creates nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A run that prints `log`.
    #[must_use]
    pub fn log(log: impl Into<String>) -> Self {
        Self {
            log: log.into(),
            ..Self::default()
        }
    }

    /// Also appends a line to the log.
    #[must_use]
    pub fn with_line(mut self, line: impl AsRef<str>) -> Self {
        self.log.push_str(line.as_ref());
        self.log.push('\n');
        self
    }

    /// Also creates a file.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.files.push((path.into(), contents.into()));
        self
    }

    /// Reports a non-zero exit code.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Reports a timeout.
    #[must_use]
    pub fn timed_out(mut self) -> Self {
        self.timed_out = true;
        self
    }
}

/// The context a behaviour sees.
#[derive(Debug, Clone, Copy)]
pub struct ScriptedCall<'a> {
    /// The invocation being faked.
    pub invocation: &'a ToolInvocation,
    /// The environment it was given.
    pub env: &'a ToolEnvironment,
    /// How many times this tool ran before (0 for the first call).
    pub previous_calls: usize,
}

impl ScriptedCall<'_> {
    /// Value of a `key=value` argument.
    #[must_use]
    pub fn arg_value(&self, key: &str) -> Option<&str> {
        self.invocation
            .args
            .iter()
            .find_map(|arg| arg.strip_prefix(key)?.strip_prefix('='))
    }

    /// Value following a `--flag` argument.
    #[must_use]
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let index = self.invocation.args.iter().position(|a| a == flag)?;
        self.invocation.args.get(index + 1).map(String::as_str)
    }

    /// Returns true if the exact argument is present.
    #[must_use]
    pub fn has_arg(&self, arg: &str) -> bool {
        self.invocation.args.iter().any(|a| a == arg)
    }
}

type Behaviour = Box<dyn Fn(&ScriptedCall<'_>) -> ScriptedOutput + Send + Sync>;

/// Fakes external tools by logical tool name.
///
/// Tools without a behaviour print nothing and exit 0. Every invocation is
/// recorded together with the environment it received.
#[derive(Default)]
pub struct ScriptedToolRunner {
    behaviours: HashMap<String, Behaviour>,
    calls: Mutex<Vec<(ToolInvocation, ToolEnvironment)>>,
}

impl fmt::Debug for ScriptedToolRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tools: Vec<&String> = self.behaviours.keys().collect();
        tools.sort();
        f.debug_struct("ScriptedToolRunner")
            .field("tools", &tools)
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

impl ScriptedToolRunner {
    /// Creates a runner with no behaviours.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets (or replaces) the behaviour of `tool`.
    #[must_use]
    pub fn on<F>(mut self, tool: impl Into<String>, behaviour: F) -> Self
    where
        F: Fn(&ScriptedCall<'_>) -> ScriptedOutput + Send + Sync + 'static,
    {
        self.behaviours.insert(tool.into(), Box::new(behaviour));
        self
    }

    /// Every invocation in order.
    #[must_use]
    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.calls.lock().iter().map(|(i, _)| i.clone()).collect()
    }

    /// Invocations of one tool in order.
    #[must_use]
    pub fn invocations_of(&self, tool: &str) -> Vec<ToolInvocation> {
        self.calls
            .lock()
            .iter()
            .filter(|(i, _)| i.tool == tool)
            .map(|(i, _)| i.clone())
            .collect()
    }

    /// Number of invocations of one tool.
    #[must_use]
    pub fn call_count(&self, tool: &str) -> usize {
        self.calls.lock().iter().filter(|(i, _)| i.tool == tool).count()
    }

    /// Tool names in invocation order.
    #[must_use]
    pub fn tool_sequence(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(i, _)| i.tool.clone()).collect()
    }

    /// The environment the most recent call of `tool` received.
    #[must_use]
    pub fn last_environment(&self, tool: &str) -> Option<ToolEnvironment> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|(i, _)| i.tool == tool)
            .map(|(_, env)| env.clone())
    }

    fn materialize(invocation: &ToolInvocation, output: &ScriptedOutput) -> std::io::Result<()> {
        for (relative, contents) in &output.files {
            let path = invocation.cwd.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
        }
        if let Some(parent) = invocation.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&invocation.log_path, &output.log)
    }
}

#[async_trait]
impl ToolRunner for ScriptedToolRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        env: &ToolEnvironment,
    ) -> Result<ToolRun, ToolError> {
        let previous_calls = self.call_count(&invocation.tool);
        self.calls.lock().push((invocation.clone(), env.clone()));

        let output = match self.behaviours.get(&invocation.tool) {
            Some(behaviour) => behaviour(&ScriptedCall {
                invocation,
                env,
                previous_calls,
            }),
            None => ScriptedOutput::empty(),
        };
        Self::materialize(invocation, &output)
            .map_err(|e| ToolError::log_capture(&invocation.tool, &invocation.log_path, e))?;

        Ok(ToolRun {
            log_path: invocation.log_path.clone(),
            log_text: output.log,
            exit_code: (!output.timed_out).then_some(output.exit_code),
            timed_out: output.timed_out,
            duration: Duration::ZERO,
        })
    }
}
