//! External command execution
//!
//! Destructive tools (partitioners, formatters) are described as
//! [`CommandSpec`] values first and executed through a [`CommandRunner`], so
//! callers can build and inspect a plan without running anything.

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::config::defaults::MAX_DIAGNOSTIC_BYTES;
use crate::error::ToolError;

/// One external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Text fed to the command's stdin
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Combined diagnostic text, tail-truncated
    pub fn diagnostics(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        if !self.stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(self.stderr.trim());
        }
        tail(&text, MAX_DIAGNOSTIC_BYTES).to_string()
    }

    /// Turn a non-zero exit into a [`ToolError`]
    pub fn check(self, program: &str) -> Result<Self, ToolError> {
        if self.success {
            Ok(self)
        } else {
            Err(ToolError::Failed {
                tool: program.to_string(),
                code: self.code,
                stderr: self.diagnostics(),
            })
        }
    }
}

/// Executes command specs
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError>;
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError> {
        debug!("Running: {}", spec);

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::Spawn {
                tool: spec.program.clone(),
                error: e.to_string(),
            })?;

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| ToolError::Spawn {
                    tool: spec.program.clone(),
                    error: format!("failed to feed stdin: {e}"),
                })?;
        }

        let output = child.wait_with_output().map_err(|e| ToolError::Spawn {
            tool: spec.program.clone(),
            error: e.to_string(),
        })?;

        Ok(CommandOutput {
            code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Last `max` bytes of `text`, cut on a char boundary
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
