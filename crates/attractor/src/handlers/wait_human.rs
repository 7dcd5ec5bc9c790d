//! Human gate: derives a multiple-choice question from outgoing edges and
//! routes along the selected one.

use crate::handlers::{NodeHandler, StepContext};
use crate::interviewer::{parse_accelerator_key, Answer, Choice, Interviewer, Question};
use crate::{AttractorError, ContextStore, Graph, Node, Outcome, StageStatus};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &ContextStore,
        graph: &Graph,
        _step: &StepContext,
    ) -> Result<Outcome, AttractorError> {
        let choices = derive_choices(node, graph);
        if choices.is_empty() {
            return Ok(Outcome::failure("No outgoing edges for human gate"));
        }

        let mut question = Question::multiple_choice(
            node.id.clone(),
            if node.label.trim().is_empty() {
                "Select an option:".to_string()
            } else {
                node.label.clone()
            },
            choices.clone(),
        );
        question.default_choice = node.extra_str("human.default_choice").map(ToOwned::to_owned);

        let answer = self.interviewer.ask(question).await;
        let selected = match answer {
            Answer::Selected(raw) => find_choice(&choices, &raw)
                .unwrap_or_else(|| choices[0].clone()),
            Answer::Yes => choices[0].clone(),
            Answer::No if choices.len() > 1 => choices[1].clone(),
            Answer::No => choices[0].clone(),
            Answer::Text(raw) => find_choice(&choices, &raw)
                .unwrap_or_else(|| choices[0].clone()),
            Answer::Timeout => {
                let default_choice = node
                    .extra_str("human.default_choice")
                    .and_then(|raw| find_choice(&choices, raw));
                match default_choice {
                    Some(choice) => choice,
                    None => {
                        return Ok(Outcome::retry("human gate timeout, no default"));
                    }
                }
            }
            Answer::Skipped => {
                return Ok(Outcome::failure("human skipped interaction"));
            }
        };

        let mut outcome = Outcome::with_status(StageStatus::Success)
            .with_notes(format!("human selected {}", selected.key));
        outcome.preferred_label = Some(selected.label.clone());
        outcome.suggested_next_ids = vec![selected.target.clone()];
        outcome.context_updates.insert(
            "human.gate.selected".to_string(),
            Value::String(selected.key.clone()),
        );
        outcome.context_updates.insert(
            "human.gate.label".to_string(),
            Value::String(selected.label.clone()),
        );
        Ok(outcome)
    }
}

/// One choice per outgoing edge; the accelerator prefix in the label
/// supplies the shortcut key.
fn derive_choices(node: &Node, graph: &Graph) -> Vec<Choice> {
    graph
        .outgoing_edges(&node.id)
        .map(|edge| {
            let label = if edge.label.trim().is_empty() {
                edge.target.clone()
            } else {
                edge.label.clone()
            };
            Choice {
                key: parse_accelerator_key(&label),
                label,
                target: edge.target.clone(),
            }
        })
        .collect()
}

fn find_choice(choices: &[Choice], raw: &str) -> Option<Choice> {
    let needle = raw.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|choice| {
            choice.key.to_ascii_lowercase() == needle
                || choice.label.to_ascii_lowercase() == needle
                || choice.target.to_ascii_lowercase() == needle
        })
        .cloned()
}
