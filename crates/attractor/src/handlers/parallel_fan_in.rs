//! Fan-in: consolidates the records a fan-out stored under
//! `parallel.results` and selects the best branch.

use crate::handlers::{NodeHandler, StepContext};
use crate::{AttractorError, ContextStore, Graph, Node, Outcome, StageStatus};
use async_trait::async_trait;
use serde_json::{json, Value};

#[derive(Clone, Debug)]
struct Candidate {
    id: String,
    status: StageStatus,
    score: f64,
}

#[derive(Debug, Default)]
pub struct FanInHandler;

#[async_trait]
impl NodeHandler for FanInHandler {
    async fn execute(
        &self,
        _node: &Node,
        context: &ContextStore,
        _graph: &Graph,
        _step: &StepContext,
    ) -> Result<Outcome, AttractorError> {
        let raw = context.get("parallel.results")?;
        let Some(results) = raw.as_ref().and_then(parse_results) else {
            return Ok(Outcome::failure("No parallel results to evaluate"));
        };

        let mut candidates: Vec<Candidate> =
            results.iter().filter_map(candidate_from_value).collect();
        if candidates.is_empty() {
            return Ok(Outcome::failure("No parseable parallel results to evaluate"));
        }

        // Rank: success class, then score descending, then id ascending.
        candidates.sort_by(|left, right| {
            status_rank(left.status)
                .cmp(&status_rank(right.status))
                .then_with(|| {
                    right
                        .score
                        .partial_cmp(&left.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| left.id.cmp(&right.id))
        });
        let best = candidates[0].clone();

        let status = match best.status {
            StageStatus::PartialSuccess => StageStatus::PartialSuccess,
            StageStatus::Success => StageStatus::Success,
            // Nothing success-class survived the fan-out.
            _ => StageStatus::Fail,
        };

        let mut outcome = Outcome::with_status(status).with_notes(format!(
            "Selected best candidate: {} ({})",
            best.id,
            best.status.as_str()
        ));
        outcome.context_updates.insert(
            "parallel.fan_in.best_id".to_string(),
            Value::String(best.id.clone()),
        );
        outcome.context_updates.insert(
            "parallel.fan_in.best_outcome".to_string(),
            Value::String(best.status.as_str().to_string()),
        );
        outcome
            .context_updates
            .insert("parallel.fan_in.best_score".to_string(), json!(best.score));
        Ok(outcome)
    }
}

/// `parallel.results` is stored as a JSON array; a JSON-encoded string is
/// accepted for interoperability with checkpoints written by other tools.
fn parse_results(raw: &Value) -> Option<Vec<Value>> {
    match raw {
        Value::Array(entries) if !entries.is_empty() => Some(entries.clone()),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(entries)) if !entries.is_empty() => Some(entries),
            _ => None,
        },
        _ => None,
    }
}

fn candidate_from_value(value: &Value) -> Option<Candidate> {
    let object = value.as_object()?;
    let id = object.get("id").and_then(Value::as_str)?.to_string();
    let status = object
        .get("status")
        .and_then(Value::as_str)
        .and_then(StageStatus::parse)
        .unwrap_or(StageStatus::Fail);
    let score = object.get("score").and_then(Value::as_f64).unwrap_or(0.0);
    Some(Candidate { id, status, score })
}

fn status_rank(status: StageStatus) -> u8 {
    match status {
        StageStatus::Success => 0,
        StageStatus::PartialSuccess => 1,
        StageStatus::Retry => 2,
        StageStatus::Fail => 3,
        StageStatus::Skipped => 4,
    }
}
