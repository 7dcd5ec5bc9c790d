use async_trait::async_trait;
use attractor::handlers::codergen::{BackendResult, CodergenBackend};
use attractor::handlers::{NodeHandler, StepContext};
use attractor::{
    AttractorError, ContextStore, ContextValues, EngineConfig, EventKind, Graph, Node, Outcome,
    PipelineEngine, RetryBackoff, StageStatus,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

fn engine_with_backend(backend: Arc<dyn CodergenBackend>) -> PipelineEngine {
    PipelineEngine::new(EngineConfig {
        codergen_backend: Some(backend),
        backoff: RetryBackoff {
            initial_delay_ms: 1,
            factor: 1.0,
            max_delay_ms: 1,
        },
        ..EngineConfig::default()
    })
}

fn event_kinds(engine: &PipelineEngine) -> Vec<(EventKind, Option<String>)> {
    engine
        .events()
        .into_iter()
        .map(|event| (event.kind, event.node_id))
        .collect()
}

/// Replies with a fixed text for every stage.
struct TextBackend(&'static str);

#[async_trait]
impl CodergenBackend for TextBackend {
    async fn run(
        &self,
        _node: &Node,
        _prompt: &str,
        _context: &ContextValues,
        _cancel: &CancellationToken,
    ) -> Result<BackendResult, AttractorError> {
        Ok(BackendResult::Text(self.0.to_string()))
    }
}

/// Replies with per-node scripted outcomes, consuming one entry per call.
#[derive(Default)]
struct ScriptedBackend {
    script: Mutex<BTreeMap<String, Vec<Outcome>>>,
}

impl ScriptedBackend {
    fn with(mut self, node_id: &str, outcomes: Vec<Outcome>) -> Self {
        self.script
            .get_mut()
            .expect("script mutex should lock")
            .insert(node_id.to_string(), outcomes);
        self
    }
}

#[async_trait]
impl CodergenBackend for ScriptedBackend {
    async fn run(
        &self,
        node: &Node,
        _prompt: &str,
        _context: &ContextValues,
        _cancel: &CancellationToken,
    ) -> Result<BackendResult, AttractorError> {
        let mut script = self.script.lock().expect("script mutex should lock");
        match script.get_mut(&node.id) {
            Some(outcomes) if !outcomes.is_empty() => {
                Ok(BackendResult::Outcome(outcomes.remove(0)))
            }
            _ => Ok(BackendResult::Text("ok".to_string())),
        }
    }
}

#[tokio::test(flavor = "current_thread")]
async fn linear_pipeline_expected_event_trace_and_context() {
    let engine = engine_with_backend(Arc::new(TextBackend("ok")));
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                graph [goal="G"]
                Start [shape=Mdiamond]
                A [shape=box, prompt="do the work"]
                Exit [shape=Msquare]
                Start -> A -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.outcome.status, StageStatus::Success);
    assert_eq!(
        result.completed_nodes,
        vec!["Start".to_string(), "A".to_string(), "Exit".to_string()]
    );

    let expected = vec![
        (EventKind::PipelineStart, None),
        (EventKind::NodeStart, Some("Start".to_string())),
        (EventKind::NodeComplete, Some("Start".to_string())),
        (EventKind::NodeStart, Some("A".to_string())),
        (EventKind::NodeComplete, Some("A".to_string())),
        (EventKind::NodeStart, Some("Exit".to_string())),
        (EventKind::NodeComplete, Some("Exit".to_string())),
        (EventKind::PipelineComplete, Some("Exit".to_string())),
        (EventKind::PipelineFinalize, None),
    ];
    assert_eq!(event_kinds(&engine), expected);

    assert_eq!(result.context.get("pipeline.goal"), Some(&json!("G")));
    assert_eq!(result.context.get("goal"), Some(&json!("G")));
    assert_eq!(result.context.get("outcome"), Some(&json!("success")));
    assert_eq!(result.context.get("last_stage"), Some(&json!("A")));
    assert_eq!(result.context.get("last_response"), Some(&json!("ok")));
}

#[tokio::test(flavor = "current_thread")]
async fn conditional_routing_expected_outcome_directed_route() {
    let dot = r#"
        digraph demo {
            Start [shape=Mdiamond]
            Check [shape=box, prompt="verify"]
            Pass [shape=box, prompt="pass lane"]
            Fail [shape=box, prompt="fail lane"]
            Exit [shape=Msquare]
            Start -> Check
            Check -> Pass [condition="outcome=success"]
            Check -> Fail [condition="outcome=fail"]
            Pass -> Exit
            Fail -> Exit
        }
    "#;

    let engine = engine_with_backend(Arc::new(TextBackend("fine")));
    let result = engine.run_dot(dot).await.expect("run should succeed");
    assert!(result.completed_nodes.contains(&"Pass".to_string()));
    assert!(!result.completed_nodes.contains(&"Fail".to_string()));

    let backend = ScriptedBackend::default().with("Check", vec![Outcome::failure("broken")]);
    let engine = engine_with_backend(Arc::new(backend));
    let result = engine.run_dot(dot).await.expect("run should succeed");
    assert!(result.completed_nodes.contains(&"Fail".to_string()));
    assert!(!result.completed_nodes.contains(&"Pass".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn conditional_node_expected_own_success_routes() {
    // A diamond node is a no-op whose own SUCCESS outcome drives selection.
    let engine = engine_with_backend(Arc::new(TextBackend("ok")));
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                Start [shape=Mdiamond]
                Gate [shape=diamond]
                Yes [shape=box, prompt="y"]
                No [shape=box, prompt="n"]
                Exit [shape=Msquare]
                Start -> Gate
                Gate -> Yes [condition="outcome=success"]
                Gate -> No [condition="outcome=fail"]
                Yes -> Exit
                No -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");
    assert!(result.completed_nodes.contains(&"Yes".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn goal_gate_retry_expected_jump_and_second_visit() {
    let backend = ScriptedBackend::default().with(
        "Impl",
        vec![Outcome::failure("first attempt broke"), Outcome::success()],
    );
    let engine = engine_with_backend(Arc::new(backend));
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                Start [shape=Mdiamond]
                Plan [shape=box, prompt="plan"]
                Impl [shape=box, prompt="implement", goal_gate=true, retry_target="Plan"]
                Exit [shape=Msquare]
                Start -> Plan -> Impl -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.outcome.status, StageStatus::Success);

    let events = engine.events();
    let gate_retries: Vec<_> = events
        .iter()
        .filter(|event| event.kind == EventKind::GoalGateRetry)
        .collect();
    assert_eq!(gate_retries.len(), 1);
    assert_eq!(gate_retries[0].node_id.as_deref(), Some("Impl"));
    assert_eq!(gate_retries[0].data.get("target"), Some(&json!("Plan")));

    let impl_visits = events
        .iter()
        .filter(|event| {
            event.kind == EventKind::NodeStart && event.node_id.as_deref() == Some("Impl")
        })
        .count();
    assert_eq!(impl_visits, 2);
    assert_eq!(
        events.last().map(|event| event.kind),
        Some(EventKind::PipelineFinalize)
    );
    assert!(events
        .iter()
        .any(|event| event.kind == EventKind::PipelineComplete));
}

#[tokio::test(flavor = "current_thread")]
async fn goal_gate_without_retry_target_expected_pipeline_error() {
    let backend = ScriptedBackend::default().with("Impl", vec![Outcome::failure("broke")]);
    let engine = engine_with_backend(Arc::new(backend));
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                Start [shape=Mdiamond]
                Impl [shape=box, prompt="implement", goal_gate=true]
                Exit [shape=Msquare]
                Start -> Impl -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.outcome.status, StageStatus::Fail);
    let events = engine.events();
    assert!(events
        .iter()
        .any(|event| event.kind == EventKind::PipelineError
            && event.node_id.as_deref() == Some("Impl")));
    assert_eq!(
        events.last().map(|event| event.kind),
        Some(EventKind::PipelineFinalize)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn weighted_edges_expected_highest_then_lexical() {
    let dot = r#"
        digraph demo {
            Start [shape=Mdiamond]
            A [shape=box, prompt="a"]
            Heavy [shape=box, prompt="h"]
            Light [shape=box, prompt="l"]
            Exit [shape=Msquare]
            Start -> A
            A -> Light [condition="outcome=success", weight=5]
            A -> Heavy [condition="outcome=success", weight=10]
            Light -> Exit
            Heavy -> Exit
        }
    "#;
    let engine = engine_with_backend(Arc::new(TextBackend("ok")));
    let result = engine.run_dot(dot).await.expect("run should succeed");
    assert!(result.completed_nodes.contains(&"Heavy".to_string()));

    let tied = r#"
        digraph demo {
            Start [shape=Mdiamond]
            A [shape=box, prompt="a"]
            Bravo [shape=box, prompt="b"]
            Alpha [shape=box, prompt="a2"]
            Exit [shape=Msquare]
            Start -> A
            A -> Bravo [condition="outcome=success", weight=5]
            A -> Alpha [condition="outcome=success", weight=5]
            Bravo -> Exit
            Alpha -> Exit
        }
    "#;
    let engine = engine_with_backend(Arc::new(TextBackend("ok")));
    let result = engine.run_dot(tied).await.expect("run should succeed");
    assert!(result.completed_nodes.contains(&"Alpha".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn loop_restart_expected_state_reset_and_seed_context() {
    struct RestartOnceBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CodergenBackend for RestartOnceBackend {
        async fn run(
            &self,
            node: &Node,
            _prompt: &str,
            _context: &ContextValues,
            _cancel: &CancellationToken,
        ) -> Result<BackendResult, AttractorError> {
            if node.id == "A" && self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut outcome = Outcome::success();
                outcome
                    .context_updates
                    .insert("restart_pending".to_string(), json!(true));
                outcome
                    .context_updates
                    .insert("scratch".to_string(), json!("first pass"));
                return Ok(BackendResult::Outcome(outcome));
            }
            Ok(BackendResult::Text("ok".to_string()))
        }
    }

    let engine = engine_with_backend(Arc::new(RestartOnceBackend {
        calls: AtomicUsize::new(0),
    }));
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                graph [goal="G"]
                Start [shape=Mdiamond]
                A [shape=box, prompt="work"]
                B [shape=box, prompt="more work"]
                C [shape=box, prompt="wrap"]
                Exit [shape=Msquare]
                Start -> A -> B -> C
                C -> A [condition="restart_pending=true", loop_restart=true]
                C -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.outcome.status, StageStatus::Success);

    let events = engine.events();
    let restarts: Vec<_> = events
        .iter()
        .filter(|event| event.kind == EventKind::LoopRestart)
        .collect();
    assert_eq!(restarts.len(), 1);
    assert_eq!(restarts[0].data.get("target"), Some(&json!("A")));

    // The first pass was wiped: only the second pass remains on record.
    assert_eq!(
        result.completed_nodes,
        vec![
            "A".to_string(),
            "B".to_string(),
            "C".to_string(),
            "Exit".to_string()
        ]
    );
    // The restart cleared the first pass's scratch state and re-seeded.
    assert_eq!(result.context.get("scratch"), None);
    assert_eq!(result.context.get("restart_pending"), None);
    assert_eq!(result.context.get("pipeline.goal"), Some(&json!("G")));
}

#[tokio::test(flavor = "current_thread")]
async fn retry_outcome_expected_retry_events_then_success() {
    let backend = ScriptedBackend::default().with(
        "Flaky",
        vec![
            Outcome::retry("not yet"),
            Outcome::retry("still not"),
            Outcome::success(),
        ],
    );
    let engine = engine_with_backend(Arc::new(backend));
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                Start [shape=Mdiamond]
                Flaky [shape=box, prompt="flaky", max_retries=5]
                Exit [shape=Msquare]
                Start -> Flaky -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.outcome.status, StageStatus::Success);
    let retries = engine
        .events()
        .into_iter()
        .filter(|event| event.kind == EventKind::NodeRetry)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test(flavor = "current_thread")]
async fn retry_exhaustion_expected_allow_partial_distinction() {
    let always_retry = |attempts: usize| {
        let mut outcomes = Vec::new();
        for _ in 0..attempts {
            outcomes.push(Outcome::retry("wedged"));
        }
        outcomes
    };

    let dot_partial = r#"
        digraph demo {
            Start [shape=Mdiamond]
            Wedged [shape=box, prompt="w", max_retries=1, allow_partial=true]
            Exit [shape=Msquare]
            Start -> Wedged -> Exit
        }
    "#;
    let backend = ScriptedBackend::default().with("Wedged", always_retry(5));
    let engine = engine_with_backend(Arc::new(backend));
    let result = engine.run_dot(dot_partial).await.expect("run should succeed");
    assert_eq!(
        result
            .node_outcomes
            .get("Wedged")
            .expect("outcome recorded")
            .status,
        StageStatus::PartialSuccess
    );

    let dot_strict = r#"
        digraph demo {
            Start [shape=Mdiamond]
            Wedged [shape=box, prompt="w", max_retries=1]
            Exit [shape=Msquare]
            Start -> Wedged
            Start -> Exit [weight=-1]
            Wedged -> Exit
        }
    "#;
    let backend = ScriptedBackend::default().with("Wedged", always_retry(5));
    let engine = engine_with_backend(Arc::new(backend));
    let result = engine.run_dot(dot_strict).await.expect("run should succeed");
    assert_eq!(
        result
            .node_outcomes
            .get("Wedged")
            .expect("outcome recorded")
            .status,
        StageStatus::Fail
    );
}

#[tokio::test(flavor = "current_thread")]
async fn fail_with_allow_partial_expected_not_coerced() {
    // allow_partial only softens RETRY exhaustion; a FAIL stays a FAIL.
    let backend =
        ScriptedBackend::default().with("Broken", vec![Outcome::failure("unrecoverable")]);
    let engine = engine_with_backend(Arc::new(backend));
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                Start [shape=Mdiamond]
                Broken [shape=box, prompt="b", allow_partial=true]
                Exit [shape=Msquare]
                Start -> Broken -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");
    assert_eq!(
        result
            .node_outcomes
            .get("Broken")
            .expect("outcome recorded")
            .status,
        StageStatus::Fail
    );
}

#[tokio::test(flavor = "current_thread")]
async fn node_without_route_expected_pipeline_error() {
    let engine = engine_with_backend(Arc::new(TextBackend("ok")));
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                Start [shape=Mdiamond]
                DeadEnd [shape=box, prompt="d"]
                Exit [shape=Msquare]
                Start -> DeadEnd [weight=1]
                Start -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.outcome.status, StageStatus::Fail);
    assert!(engine
        .events()
        .iter()
        .any(|event| event.kind == EventKind::PipelineError
            && event.node_id.as_deref() == Some("DeadEnd")));
}

#[tokio::test(flavor = "current_thread")]
async fn step_limit_expected_pipeline_error() {
    let engine = PipelineEngine::new(EngineConfig {
        codergen_backend: Some(Arc::new(TextBackend("ok"))),
        max_steps: 4,
        ..EngineConfig::default()
    });
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                Start [shape=Mdiamond]
                Ping [shape=box, prompt="p"]
                Pong [shape=box, prompt="q"]
                Exit [shape=Msquare]
                Start -> Ping
                Ping -> Pong
                Pong -> Ping [weight=1]
                Pong -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.outcome.status, StageStatus::Fail);
    assert_eq!(result.steps, 4);
    assert!(engine
        .events()
        .iter()
        .any(|event| event.kind == EventKind::PipelineError));
}

#[tokio::test(flavor = "current_thread")]
async fn node_timeout_expected_fail_with_timeout_reason() {
    struct SleepyHandler;

    #[async_trait]
    impl NodeHandler for SleepyHandler {
        async fn execute(
            &self,
            _node: &Node,
            _context: &ContextStore,
            _graph: &Graph,
            _step: &StepContext,
        ) -> Result<Outcome, AttractorError> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(Outcome::success())
        }
    }

    let engine = PipelineEngine::new(EngineConfig {
        extra_handlers: vec![("sleepy".to_string(), Arc::new(SleepyHandler))],
        ..EngineConfig::default()
    });
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                Start [shape=Mdiamond]
                Slow [shape=box, type="sleepy", timeout=50ms, prompt="s"]
                Exit [shape=Msquare]
                Start -> Slow -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");

    let slow = result.node_outcomes.get("Slow").expect("outcome recorded");
    assert_eq!(slow.status, StageStatus::Fail);
    assert_eq!(slow.failure_reason.as_deref(), Some("timeout"));
}

#[tokio::test(flavor = "current_thread")]
async fn cancellation_expected_checkpointless_finalize_marker() {
    struct WaitForCancelHandler;

    #[async_trait]
    impl NodeHandler for WaitForCancelHandler {
        async fn execute(
            &self,
            _node: &Node,
            _context: &ContextStore,
            _graph: &Graph,
            step: &StepContext,
        ) -> Result<Outcome, AttractorError> {
            step.cancel.cancelled().await;
            Ok(Outcome::success().with_notes("interrupted"))
        }
    }

    let engine = PipelineEngine::new(EngineConfig {
        extra_handlers: vec![("waiter".to_string(), Arc::new(WaitForCancelHandler))],
        ..EngineConfig::default()
    });
    let cancel = engine.cancel_token();

    let graph = attractor::parse_dot(
        r#"
        digraph demo {
            Start [shape=Mdiamond]
            Wait [shape=box, type="waiter", prompt="w"]
            Exit [shape=Msquare]
            Start -> Wait -> Exit
        }
        "#,
    )
    .expect("graph should parse");

    let (result, ()) = tokio::join!(engine.run(&graph), async {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
    });
    let result = result.expect("run should succeed");

    assert!(result.cancelled);
    let events = engine.events();
    let last = events.last().expect("events should not be empty");
    assert_eq!(last.kind, EventKind::PipelineFinalize);
    assert_eq!(last.data.get("cancelled"), Some(&json!(true)));
    assert!(!events
        .iter()
        .any(|event| event.kind == EventKind::PipelineComplete));
}

#[tokio::test(flavor = "current_thread")]
async fn dry_run_expected_no_backend_calls() {
    struct PanickyBackend;

    #[async_trait]
    impl CodergenBackend for PanickyBackend {
        async fn run(
            &self,
            _node: &Node,
            _prompt: &str,
            _context: &ContextValues,
            _cancel: &CancellationToken,
        ) -> Result<BackendResult, AttractorError> {
            Err(AttractorError::Runtime(
                "backend must not run in dry-run mode".to_string(),
            ))
        }
    }

    let engine = PipelineEngine::new(EngineConfig {
        codergen_backend: Some(Arc::new(PanickyBackend)),
        dry_run: true,
        ..EngineConfig::default()
    });
    let result = engine
        .run_dot(
            r#"
            digraph demo {
                Start [shape=Mdiamond]
                A [shape=box, prompt="a"]
                Exit [shape=Msquare]
                Start -> A -> Exit
            }
            "#,
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.outcome.status, StageStatus::Success);
    let a_outcome = result.node_outcomes.get("A").expect("outcome recorded");
    assert!(a_outcome.notes.as_deref().unwrap_or_default().contains("[dry-run]"));
}

#[tokio::test(flavor = "current_thread")]
async fn authoring_error_expected_no_events() {
    let engine = engine_with_backend(Arc::new(TextBackend("ok")));
    let error = engine
        .run_dot("digraph demo { island [shape=box, prompt=\"x\"] }")
        .await
        .expect_err("validation should fail");
    assert!(matches!(error, AttractorError::Validation(_)));
    assert!(engine.events().is_empty());
}
