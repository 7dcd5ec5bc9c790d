//! Fan-out: runs one isolated sub-traversal per outgoing edge with bounded
//! concurrency, then folds the branch results under the node's join and
//! error policies. Results land in context key `parallel.results` for the
//! downstream fan-in node.

use crate::handlers::{NodeHandler, StepContext};
use crate::{
    AttractorError, ContextStore, ContextValues, Graph, Node, Outcome, StageStatus,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_PARALLEL: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JoinPolicy {
    WaitAll,
    FirstSuccess,
    KOfN(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorPolicy {
    Continue,
    FailFast,
    Ignore,
}

/// One branch sub-run: starts at `target` and ends at the first fan-in
/// node, exit node, or failure with no route.
pub struct BranchRequest {
    pub branch_id: String,
    pub target: String,
    pub graph: Arc<Graph>,
    pub context: ContextStore,
    pub cancel: CancellationToken,
    pub logs_root: Option<PathBuf>,
}

#[async_trait]
pub trait BranchRunner: Send + Sync {
    async fn run_branch(&self, request: BranchRequest) -> Outcome;
}

/// Stand-in used when no engine is wired up: every branch reports SUCCESS
/// without executing anything.
#[derive(Debug, Default)]
pub struct SimulatedBranchRunner;

#[async_trait]
impl BranchRunner for SimulatedBranchRunner {
    async fn run_branch(&self, request: BranchRequest) -> Outcome {
        Outcome::success().with_notes(format!("Simulated: {}", request.target))
    }
}

#[derive(Clone, Debug)]
struct BranchRecord {
    id: String,
    target: String,
    status: StageStatus,
    notes: Option<String>,
    score: f64,
    context_updates: ContextValues,
}

impl BranchRecord {
    fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "target": self.target,
            "status": self.status.as_str(),
            "notes": self.notes,
            "score": self.score,
            "context_updates": self.context_updates,
        })
    }
}

pub struct ParallelHandler {
    branch_runner: Arc<dyn BranchRunner>,
    default_max_parallel: usize,
}

impl ParallelHandler {
    pub fn new(branch_runner: Arc<dyn BranchRunner>) -> Self {
        Self {
            branch_runner,
            default_max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.default_max_parallel = max_parallel.max(1);
        self
    }
}

#[async_trait]
impl NodeHandler for ParallelHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &ContextStore,
        graph: &Graph,
        step: &StepContext,
    ) -> Result<Outcome, AttractorError> {
        let branches: Vec<String> = graph
            .outgoing_edges(&node.id)
            .map(|edge| edge.target.clone())
            .collect();
        if branches.is_empty() {
            return Ok(Outcome::failure(format!(
                "parallel node '{}' has no outgoing branches",
                node.id
            )));
        }

        let join_policy = match parse_join_policy(node, branches.len()) {
            Ok(policy) => policy,
            Err(reason) => return Ok(Outcome::failure(reason)),
        };
        let error_policy = parse_error_policy(node);
        let max_parallel = node
            .extra_str("max_parallel")
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .unwrap_or(self.default_max_parallel)
            .max(1);

        let parent_snapshot = context.snapshot()?;
        let shared_graph = Arc::new(graph.clone());
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let group_cancel = step.cancel.child_token();

        let mut branch_tokens = Vec::with_capacity(branches.len());
        let mut join_set: JoinSet<(usize, BranchRecord)> = JoinSet::new();

        for (index, target) in branches.iter().enumerate() {
            let branch_cancel = group_cancel.child_token();
            branch_tokens.push(branch_cancel.clone());

            let branch_context = context.clone_isolated()?;
            let request = BranchRequest {
                branch_id: target.clone(),
                target: target.clone(),
                graph: Arc::clone(&shared_graph),
                context: branch_context.clone(),
                cancel: branch_cancel,
                logs_root: step.logs_root.clone(),
            };
            let runner = Arc::clone(&self.branch_runner);
            let semaphore = Arc::clone(&semaphore);
            let parent_values = parent_snapshot.values.clone();
            let target = target.clone();

            join_set.spawn(async move {
                let permit = semaphore.acquire_owned().await;
                if permit.is_err() {
                    let record = BranchRecord {
                        id: target.clone(),
                        target,
                        status: StageStatus::Fail,
                        notes: Some("branch semaphore closed".to_string()),
                        score: 0.0,
                        context_updates: ContextValues::new(),
                    };
                    return (index, record);
                }
                let outcome = runner.run_branch(request).await;
                let delta = branch_delta(&branch_context, &parent_values, &outcome);
                let record = BranchRecord {
                    id: target.clone(),
                    target,
                    status: outcome.status,
                    notes: outcome.notes.or(outcome.failure_reason),
                    score: extract_score(&delta),
                    context_updates: delta,
                };
                (index, record)
            });
        }

        let total = branches.len();
        let mut records: Vec<(usize, BranchRecord)> = Vec::with_capacity(total);
        let mut completed: BTreeSet<usize> = BTreeSet::new();
        let mut satisfied = false;
        let mut failed_fast = false;

        while let Some(joined) = join_set.join_next().await {
            let (index, record) = match joined {
                Ok(entry) => entry,
                Err(error) => {
                    return Err(AttractorError::Runtime(format!(
                        "parallel branch task failed: {error}"
                    )));
                }
            };
            completed.insert(index);

            let counted_success = counts_as_success(record.status, error_policy);
            let raw_failure = record.status == StageStatus::Fail;
            records.push((index, record));

            if !satisfied && !failed_fast {
                if error_policy == ErrorPolicy::FailFast && raw_failure {
                    failed_fast = true;
                    cancel_pending(&branch_tokens, &completed);
                } else if counted_success {
                    let successes = records
                        .iter()
                        .filter(|(_, record)| counts_as_success(record.status, error_policy))
                        .count();
                    let threshold_met = match join_policy {
                        JoinPolicy::FirstSuccess => true,
                        JoinPolicy::KOfN(k) => successes >= k,
                        JoinPolicy::WaitAll => false,
                    };
                    if threshold_met && completed.len() < total {
                        satisfied = true;
                        cancel_pending(&branch_tokens, &completed);
                    } else if threshold_met {
                        satisfied = true;
                    }
                }
            }
        }

        records.sort_by_key(|(index, _)| *index);
        let records: Vec<BranchRecord> = records.into_iter().map(|(_, record)| record).collect();

        let success_count = records
            .iter()
            .filter(|record| counts_as_success(record.status, error_policy))
            .count();
        let fail_count = records
            .iter()
            .filter(|record| record.status == StageStatus::Fail)
            .count();

        let (status, notes) = if failed_fast {
            (
                StageStatus::Fail,
                format!("fail_fast: {fail_count} of {total} branches failed"),
            )
        } else {
            match join_policy {
                JoinPolicy::WaitAll => {
                    if success_count == total {
                        (
                            StageStatus::Success,
                            format!("All {total} branches succeeded"),
                        )
                    } else {
                        (
                            StageStatus::PartialSuccess,
                            format!("{success_count}/{total} branches succeeded"),
                        )
                    }
                }
                JoinPolicy::FirstSuccess => {
                    if success_count > 0 {
                        (
                            StageStatus::Success,
                            "At least one branch succeeded".to_string(),
                        )
                    } else {
                        (StageStatus::Fail, "All branches failed".to_string())
                    }
                }
                JoinPolicy::KOfN(k) => {
                    if success_count >= k {
                        (
                            StageStatus::Success,
                            format!("{success_count}/{total} branches succeeded (required {k})"),
                        )
                    } else {
                        (
                            StageStatus::Fail,
                            format!("Only {success_count}/{total} succeeded (required {k})"),
                        )
                    }
                }
            }
        };

        let mut outcome = Outcome::with_status(status).with_notes(notes.clone());
        if status == StageStatus::Fail {
            outcome.failure_reason = Some(notes);
        }
        outcome.context_updates.insert(
            "parallel.results".to_string(),
            Value::Array(records.iter().map(BranchRecord::to_value).collect()),
        );
        outcome.context_updates.insert(
            "parallel.branch_count".to_string(),
            json!(records.len() as u64),
        );
        outcome.context_updates.insert(
            "parallel.success_count".to_string(),
            json!(success_count as u64),
        );
        outcome
            .context_updates
            .insert("parallel.fail_count".to_string(), json!(fail_count as u64));
        Ok(outcome)
    }
}

fn cancel_pending(branch_tokens: &[CancellationToken], completed: &BTreeSet<usize>) {
    for (index, token) in branch_tokens.iter().enumerate() {
        if !completed.contains(&index) {
            token.cancel();
        }
    }
}

fn counts_as_success(status: StageStatus, error_policy: ErrorPolicy) -> bool {
    status.is_success() || (error_policy == ErrorPolicy::Ignore && status == StageStatus::Fail)
}

fn parse_join_policy(node: &Node, branch_count: usize) -> Result<JoinPolicy, String> {
    match node.extra_str("join_policy").unwrap_or("wait_all").trim() {
        "" | "wait_all" => Ok(JoinPolicy::WaitAll),
        "first_success" => Ok(JoinPolicy::FirstSuccess),
        "k_of_n" => {
            let raw = node.extra_str("k").unwrap_or_default().trim().to_string();
            let k = raw
                .parse::<usize>()
                .ok()
                .filter(|k| *k >= 1)
                .ok_or_else(|| {
                    format!("join_policy=k_of_n requires a positive integer 'k', got '{raw}'")
                })?;
            Ok(JoinPolicy::KOfN(k.min(branch_count)))
        }
        other => Err(format!("unknown join_policy '{other}'")),
    }
}

fn parse_error_policy(node: &Node) -> ErrorPolicy {
    match node.extra_str("error_policy").unwrap_or("continue").trim() {
        "fail_fast" => ErrorPolicy::FailFast,
        "ignore" => ErrorPolicy::Ignore,
        _ => ErrorPolicy::Continue,
    }
}

/// The branch's final context delta relative to the parent at fan-out time,
/// including the outcome's own updates.
fn branch_delta(
    branch_context: &ContextStore,
    parent_values: &ContextValues,
    outcome: &Outcome,
) -> ContextValues {
    let mut delta = ContextValues::new();
    if let Ok(snapshot) = branch_context.snapshot() {
        for (key, value) in &snapshot.values {
            if parent_values.get(key) != Some(value) {
                delta.insert(key.clone(), value.clone());
            }
        }
    }
    for (key, value) in &outcome.context_updates {
        delta.insert(key.clone(), value.clone());
    }
    delta
}

fn extract_score(delta: &ContextValues) -> f64 {
    delta
        .get("branch.score")
        .or_else(|| delta.get("score"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::registry::noop_step_context;
    use crate::parse_dot;

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_simulated_expected_success_and_results() {
        let graph = parse_dot(
            r#"
            digraph G {
                p [shape=component]
                p -> a
                p -> b
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.node("p").expect("node should exist");
        let handler = ParallelHandler::new(Arc::new(SimulatedBranchRunner));

        let outcome = handler
            .execute(node, &ContextStore::new(), &graph, &noop_step_context())
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, StageStatus::Success);
        let results = outcome
            .context_updates
            .get("parallel.results")
            .and_then(Value::as_array)
            .expect("results should be an array");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].get("id"), Some(&json!("a")));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_no_branches_expected_fail() {
        let graph = parse_dot("digraph G { p [shape=component] }").expect("graph should parse");
        let node = graph.node("p").expect("node should exist");
        let handler = ParallelHandler::new(Arc::new(SimulatedBranchRunner));

        let outcome = handler
            .execute(node, &ContextStore::new(), &graph, &noop_step_context())
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_k_of_n_missing_k_expected_fail() {
        let graph = parse_dot(
            r#"
            digraph G {
                p [shape=component, join_policy="k_of_n"]
                p -> a
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.node("p").expect("node should exist");
        let handler = ParallelHandler::new(Arc::new(SimulatedBranchRunner));

        let outcome = handler
            .execute(node, &ContextStore::new(), &graph, &noop_step_context())
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(
            outcome
                .failure_reason
                .as_deref()
                .unwrap_or_default()
                .contains("k_of_n")
        );
    }
}
