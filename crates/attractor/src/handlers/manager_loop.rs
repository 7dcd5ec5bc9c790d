//! Supervises a child pipeline by observing its status through the context
//! and optionally applying steering decisions. Consumes and emits outcomes
//! through the ordinary handler contract.

use crate::handlers::{NodeHandler, StepContext};
use crate::{
    evaluate_condition, parse_duration_millis, AttractorError, ContextStore, ContextValues, Graph,
    Node, Outcome,
};
use async_trait::async_trait;
use serde_json::{json, Value};

#[derive(Debug, Default)]
pub struct ManagerLoopHandler;

#[async_trait]
impl NodeHandler for ManagerLoopHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &ContextStore,
        _graph: &Graph,
        step: &StepContext,
    ) -> Result<Outcome, AttractorError> {
        let max_cycles = node
            .extra_str("manager.max_cycles")
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .unwrap_or(1000)
            .max(1);
        let poll_interval_ms = node
            .extra_str("manager.poll_interval")
            .and_then(parse_duration_millis)
            .unwrap_or(45_000);
        let stop_condition = node
            .extra_str("manager.stop_condition")
            .unwrap_or_default()
            .trim()
            .to_string();
        let actions = parse_actions(node);

        let snapshot = context.snapshot()?;
        let values = &snapshot.values;

        for cycle in 1..=max_cycles {
            if step.cancel.is_cancelled() {
                return Ok(Outcome::failure("manager loop cancelled"));
            }

            let (status, child_outcome) = if actions.observe {
                (
                    child_field_at_cycle(values, "stack.child.status", cycle),
                    child_field_at_cycle(values, "stack.child.outcome", cycle),
                )
            } else {
                (None, None)
            };

            if let Some(status) = status.as_deref() {
                if status == "completed" && child_outcome.as_deref() == Some("success") {
                    return Ok(cycle_outcome(cycle, poll_interval_ms, "Child completed"));
                }
                if status == "failed" {
                    return Ok(Outcome::failure("Child pipeline failed"));
                }
            }

            if !stop_condition.is_empty() {
                let marker = Outcome::success();
                if evaluate_condition(&stop_condition, &marker, values) {
                    return Ok(cycle_outcome(
                        cycle,
                        poll_interval_ms,
                        "Stop condition satisfied",
                    ));
                }
            }

            if actions.steer {
                if let Some(decision) = values
                    .get("stack.manager.steer_decision")
                    .and_then(Value::as_str)
                    .filter(|decision| !decision.trim().is_empty())
                {
                    let mut outcome = cycle_outcome(
                        cycle,
                        poll_interval_ms,
                        &format!("Steering decision applied: {decision}"),
                    );
                    outcome.context_updates.insert(
                        "stack.manager.last_steer".to_string(),
                        Value::String(decision.to_string()),
                    );
                    return Ok(outcome);
                }
            }
        }

        Ok(Outcome::failure(format!(
            "Max cycles exceeded ({max_cycles})"
        )))
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ManagerActions {
    observe: bool,
    steer: bool,
    wait: bool,
}

fn parse_actions(node: &Node) -> ManagerActions {
    let raw = node.extra_str("manager.actions").unwrap_or("observe,wait");
    let mut actions = ManagerActions::default();
    for action in raw.split(',').map(str::trim) {
        match action {
            "observe" => actions.observe = true,
            "steer" => actions.steer = true,
            "wait" => actions.wait = true,
            _ => {}
        }
    }
    if !actions.observe && !actions.steer && !actions.wait {
        actions.observe = true;
        actions.wait = true;
    }
    actions
}

fn cycle_outcome(cycle: usize, poll_interval_ms: u64, notes: &str) -> Outcome {
    let mut outcome = Outcome::success().with_notes(notes);
    outcome
        .context_updates
        .insert("stack.manager.cycles".to_string(), json!(cycle as u64));
    outcome.context_updates.insert(
        "stack.manager.poll_interval_ms".to_string(),
        json!(poll_interval_ms),
    );
    outcome
}

/// A `<key>_sequence` array in the context simulates the child's state over
/// successive observation cycles; a scalar value is a steady state.
fn child_field_at_cycle(values: &ContextValues, key: &str, cycle: usize) -> Option<String> {
    let sequence_key = format!("{key}_sequence");
    values
        .get(&sequence_key)
        .and_then(Value::as_array)
        .and_then(|entries| entries.get(cycle.saturating_sub(1)))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .or_else(|| {
            values
                .get(key)
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::registry::noop_step_context;
    use crate::StageStatus;

    fn manager_node(attrs: &[(&str, &str)]) -> Node {
        let mut node = Node::new("manager");
        node.shape = "house".to_string();
        for (key, value) in attrs {
            node.extra.insert((*key).to_string(), (*value).to_string());
        }
        node
    }

    #[tokio::test(flavor = "current_thread")]
    async fn manager_child_completion_expected_success_at_cycle() {
        let context = ContextStore::new();
        context
            .set(
                "stack.child.status_sequence",
                json!(["running", "completed"]),
            )
            .expect("set should succeed");
        context
            .set("stack.child.outcome_sequence", json!(["running", "success"]))
            .expect("set should succeed");

        let outcome = ManagerLoopHandler
            .execute(
                &manager_node(&[]),
                &context,
                &Graph::new("g"),
                &noop_step_context(),
            )
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome
                .context_updates
                .get("stack.manager.cycles")
                .and_then(Value::as_u64),
            Some(2)
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn manager_child_failure_expected_fail() {
        let context = ContextStore::new();
        context
            .set("stack.child.status", json!("failed"))
            .expect("set should succeed");

        let outcome = ManagerLoopHandler
            .execute(
                &manager_node(&[]),
                &context,
                &Graph::new("g"),
                &noop_step_context(),
            )
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn manager_stop_condition_expected_success() {
        let context = ContextStore::new();
        context
            .set("stack.ready", json!(true))
            .expect("set should succeed");

        let outcome = ManagerLoopHandler
            .execute(
                &manager_node(&[("manager.stop_condition", "context.stack.ready=true")]),
                &context,
                &Graph::new("g"),
                &noop_step_context(),
            )
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, StageStatus::Success);
        assert!(
            outcome
                .notes
                .as_deref()
                .unwrap_or_default()
                .contains("Stop condition")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn manager_max_cycles_expected_fail() {
        let outcome = ManagerLoopHandler
            .execute(
                &manager_node(&[("manager.max_cycles", "3")]),
                &ContextStore::new(),
                &Graph::new("g"),
                &noop_step_context(),
            )
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(
            outcome
                .failure_reason
                .as_deref()
                .unwrap_or_default()
                .contains("Max cycles")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn manager_steer_decision_expected_recorded() {
        let context = ContextStore::new();
        context
            .set("stack.manager.steer_decision", json!("pause"))
            .expect("set should succeed");

        let outcome = ManagerLoopHandler
            .execute(
                &manager_node(&[("manager.actions", "observe,steer")]),
                &context,
                &Graph::new("g"),
                &noop_step_context(),
            )
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome.context_updates.get("stack.manager.last_steer"),
            Some(&Value::String("pause".to_string()))
        );
    }
}
