//! The default handler for LLM task nodes. Expands the node's prompt,
//! delegates to the injected generative backend, and augments the outcome
//! with `last_stage` and a truncated `last_response`.

use crate::handlers::{NodeHandler, StepContext};
use crate::{AttractorError, ContextStore, ContextValues, Graph, Node, Outcome};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const RESPONSE_EXCERPT_CHARS: usize = 200;

/// A backend may answer with raw text (wrapped into a SUCCESS outcome) or a
/// fully formed outcome of its own.
pub enum BackendResult {
    Text(String),
    Outcome(Outcome),
}

/// The generative seam. `preamble_text` is the fidelity-resolved view of
/// prior execution; `cancel` must be honored for long calls.
#[async_trait]
pub trait CodergenBackend: Send + Sync {
    async fn run(
        &self,
        node: &Node,
        prompt: &str,
        context: &ContextValues,
        cancel: &CancellationToken,
    ) -> Result<BackendResult, AttractorError>;
}

pub struct CodergenHandler {
    backend: Option<Arc<dyn CodergenBackend>>,
}

impl CodergenHandler {
    pub fn new(backend: Option<Arc<dyn CodergenBackend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &ContextStore,
        graph: &Graph,
        step: &StepContext,
    ) -> Result<Outcome, AttractorError> {
        let prompt = build_prompt(node, graph, step);
        if let Some(stage_dir) = step.stage_dir(&node.id) {
            write_artifact(&stage_dir, "prompt.md", prompt.as_bytes())?;
        }

        let snapshot = context.snapshot()?;
        let (response_text, outcome) = match self.backend.as_ref() {
            Some(backend) => {
                match backend
                    .run(node, &prompt, &snapshot.values, &step.cancel)
                    .await
                {
                    Ok(BackendResult::Outcome(mut outcome)) => {
                        let response = outcome.notes.clone().unwrap_or_default();
                        augment_with_response(&mut outcome, node, &response);
                        (response, outcome)
                    }
                    Ok(BackendResult::Text(response)) => {
                        let outcome = response_outcome(node, &response);
                        (response, outcome)
                    }
                    Err(error) => {
                        let reason = error.to_string();
                        (reason.clone(), Outcome::failure(reason))
                    }
                }
            }
            None => {
                let response = format!("[Simulated] Response for stage: {}", node.id);
                let outcome = response_outcome(node, &response);
                (response, outcome)
            }
        };

        if let Some(stage_dir) = step.stage_dir(&node.id) {
            write_artifact(&stage_dir, "response.md", response_text.as_bytes())?;
            write_status(&stage_dir, &outcome)?;
        }
        Ok(outcome)
    }
}

fn build_prompt(node: &Node, graph: &Graph, step: &StepContext) -> String {
    let mut prompt = if node.prompt.trim().is_empty() {
        node.display_label().to_string()
    } else {
        node.prompt.clone()
    };
    // The variable-expansion transform normally ran already; substituting
    // again keeps handler behavior correct for graphs built in code.
    if !graph.goal.is_empty() {
        prompt = prompt.replace("$goal", &graph.goal);
    }

    if step.preamble.text.is_empty() {
        prompt
    } else {
        format!("{}\n\n{prompt}", step.preamble.text)
    }
}

fn response_outcome(node: &Node, response: &str) -> Outcome {
    let mut outcome = Outcome::success().with_notes(format!("Stage completed: {}", node.id));
    augment_with_response(&mut outcome, node, response);
    outcome
}

/// Every codergen outcome carries the just-completed stage id and a
/// truncated response excerpt; backend-supplied updates win.
fn augment_with_response(outcome: &mut Outcome, node: &Node, response: &str) {
    outcome
        .context_updates
        .entry("last_stage".to_string())
        .or_insert_with(|| Value::String(node.id.clone()));
    outcome
        .context_updates
        .entry("last_response".to_string())
        .or_insert_with(|| Value::String(response.chars().take(RESPONSE_EXCERPT_CHARS).collect()));
}

fn write_artifact(stage_dir: &Path, name: &str, bytes: &[u8]) -> Result<(), AttractorError> {
    fs::create_dir_all(stage_dir).map_err(io_error)?;
    fs::write(stage_dir.join(name), bytes).map_err(io_error)
}

fn write_status(stage_dir: &Path, outcome: &Outcome) -> Result<(), AttractorError> {
    let status = json!({
        "status": outcome.status.as_str(),
        "notes": outcome.notes,
        "failure_reason": outcome.failure_reason,
        "context_updates": outcome.context_updates,
        "preferred_label": outcome.preferred_label,
        "suggested_next_ids": outcome.suggested_next_ids,
    });
    let payload = serde_json::to_vec_pretty(&status)
        .map_err(|error| AttractorError::Runtime(format!("status serialization failed: {error}")))?;
    write_artifact(stage_dir, "status.json", &payload)
}

fn io_error(error: std::io::Error) -> AttractorError {
    AttractorError::Runtime(format!("codergen artifact I/O error: {error}"))
}
