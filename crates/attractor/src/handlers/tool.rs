//! Shell command execution through the injected [`ToolRunner`] seam.

use crate::handlers::{NodeHandler, StepContext};
use crate::{parse_duration_millis, AttractorError, ContextStore, Graph, Node, Outcome};
use async_trait::async_trait;
use serde_json::Value;
use std::fs;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, AttractorError>;
}

/// Runs commands through `sh -c` with the child killed on timeout or
/// cancellation.
#[derive(Debug, Default)]
pub struct ShellToolRunner;

#[async_trait]
impl ToolRunner for ShellToolRunner {
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, AttractorError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                AttractorError::Runtime(format!("failed to spawn tool command: {error}"))
            })?;

        let wait = child.wait_with_output();
        tokio::select! {
            result = tokio::time::timeout(timeout, wait) => match result {
                Ok(Ok(output)) => Ok(ToolOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code().unwrap_or(-1),
                }),
                Ok(Err(error)) => Err(AttractorError::Runtime(format!(
                    "tool command I/O failed: {error}"
                ))),
                Err(_) => Err(AttractorError::Runtime(format!(
                    "tool command timed out after {}ms",
                    timeout.as_millis()
                ))),
            },
            _ = cancel.cancelled() => Err(AttractorError::Runtime(
                "tool command cancelled".to_string(),
            )),
        }
    }
}

pub struct ToolHandler {
    runner: Arc<dyn ToolRunner>,
}

impl ToolHandler {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl NodeHandler for ToolHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &ContextStore,
        _graph: &Graph,
        step: &StepContext,
    ) -> Result<Outcome, AttractorError> {
        let command = node.extra_str("tool_command").unwrap_or_default().trim();
        if command.is_empty() {
            return Ok(Outcome::failure("No tool_command specified"));
        }

        let timeout = Duration::from_millis(
            parse_duration_millis(&node.timeout).unwrap_or(DEFAULT_TOOL_TIMEOUT_MS),
        );

        let output = match self.runner.exec(command, timeout, &step.cancel).await {
            Ok(output) => output,
            Err(error) => return Ok(Outcome::failure(error.to_string())),
        };

        if let Some(stage_dir) = step.stage_dir(&node.id) {
            write_tool_output(&stage_dir, &output)?;
        }

        let mut outcome = if output.exit_code == 0 {
            Outcome::success().with_notes(format!("Tool completed: {command}"))
        } else {
            Outcome::failure(format!("Command exited with code {}", output.exit_code))
        };
        outcome
            .context_updates
            .insert("tool.output".to_string(), Value::String(output.stdout));
        Ok(outcome)
    }
}

fn write_tool_output(
    stage_dir: &std::path::Path,
    output: &ToolOutput,
) -> Result<(), AttractorError> {
    fs::create_dir_all(stage_dir).map_err(io_error)?;
    let mut body = output.stdout.clone();
    if !output.stderr.is_empty() {
        body.push_str("\n--- STDERR ---\n");
        body.push_str(&output.stderr);
    }
    fs::write(stage_dir.join("tool_output.txt"), body).map_err(io_error)
}

fn io_error(error: std::io::Error) -> AttractorError {
    AttractorError::Runtime(format!("tool artifact I/O error: {error}"))
}
