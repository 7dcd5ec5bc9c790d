//! Graph validation: ten built-in rules. Error-severity findings block
//! execution; warnings are advisory.

use crate::{is_valid_fidelity_mode, Graph, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

impl Diagnostic {
    pub fn new(rule: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message: message.into(),
            node_id: None,
            edge: None,
            fix: None,
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edge = Some((source.into(), target.into()));
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Caller-supplied lint rules run after the built-in set.
pub trait LintRule {
    fn name(&self) -> &str;
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic>;
}

pub fn validate(graph: &Graph, extra_rules: &[&dyn LintRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_start_node(graph));
    diagnostics.extend(rule_terminal_node(graph));
    diagnostics.extend(rule_edge_target_exists(graph));
    diagnostics.extend(rule_start_no_incoming(graph));
    diagnostics.extend(rule_exit_no_outgoing(graph));
    diagnostics.extend(rule_reachability(graph));
    diagnostics.extend(rule_fidelity_valid(graph));
    diagnostics.extend(rule_retry_target_exists(graph));
    diagnostics.extend(rule_goal_gate_has_retry(graph));
    diagnostics.extend(rule_prompt_on_llm_nodes(graph));

    for rule in extra_rules {
        diagnostics.extend(rule.apply(graph));
    }

    diagnostics
}

pub fn validate_or_raise(
    graph: &Graph,
    extra_rules: &[&dyn LintRule],
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(graph, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

fn rule_start_node(graph: &Graph) -> Vec<Diagnostic> {
    let starts = graph.start_nodes();
    if starts.len() == 1 {
        return Vec::new();
    }
    vec![
        Diagnostic::new(
            "start_node",
            Severity::Error,
            format!(
                "pipeline must have exactly one start node (shape=Mdiamond); found {}",
                starts.len()
            ),
        )
        .with_fix("add a single node with shape=Mdiamond"),
    ]
}

fn rule_terminal_node(graph: &Graph) -> Vec<Diagnostic> {
    if graph.exit_nodes().is_empty() {
        return vec![
            Diagnostic::new(
                "terminal_node",
                Severity::Error,
                "pipeline must have at least one terminal node (shape=Msquare)",
            )
            .with_fix("add a node with shape=Msquare"),
        ];
    }
    Vec::new()
}

fn rule_edge_target_exists(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        if !graph.has_node(&edge.source) {
            diagnostics.push(
                Diagnostic::new(
                    "edge_target_exists",
                    Severity::Error,
                    format!("edge source '{}' does not exist", edge.source),
                )
                .with_edge(edge.source.clone(), edge.target.clone()),
            );
        }
        if !graph.has_node(&edge.target) {
            diagnostics.push(
                Diagnostic::new(
                    "edge_target_exists",
                    Severity::Error,
                    format!("edge target '{}' does not exist", edge.target),
                )
                .with_edge(edge.source.clone(), edge.target.clone()),
            );
        }
    }
    diagnostics
}

fn rule_start_no_incoming(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for start in graph.start_nodes() {
        let incoming = graph.incoming_edges(&start.id).count();
        if incoming > 0 {
            diagnostics.push(
                Diagnostic::new(
                    "start_no_incoming",
                    Severity::Error,
                    format!(
                        "start node '{}' must have no incoming edges, found {incoming}",
                        start.id
                    ),
                )
                .with_node_id(start.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_exit_no_outgoing(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for exit in graph.exit_nodes() {
        let outgoing = graph.outgoing_edges(&exit.id).count();
        if outgoing > 0 {
            diagnostics.push(
                Diagnostic::new(
                    "exit_no_outgoing",
                    Severity::Error,
                    format!(
                        "exit node '{}' must have no outgoing edges, found {outgoing}",
                        exit.id
                    ),
                )
                .with_node_id(exit.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_reachability(graph: &Graph) -> Vec<Diagnostic> {
    let Some(start) = graph.start_node() else {
        // start_node already reported the problem.
        return Vec::new();
    };

    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut stack = vec![start.id.as_str()];
    while let Some(node_id) = stack.pop() {
        if !visited.insert(node_id) {
            continue;
        }
        for edge in graph.outgoing_edges(node_id) {
            if graph.has_node(&edge.target) {
                stack.push(edge.target.as_str());
            }
        }
    }

    graph
        .nodes
        .iter()
        .filter(|node| !visited.contains(node.id.as_str()))
        .map(|node| {
            Diagnostic::new(
                "reachability",
                Severity::Error,
                format!("node '{}' is unreachable from start", node.id),
            )
            .with_node_id(node.id.clone())
        })
        .collect()
}

fn rule_fidelity_valid(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if !graph.default_fidelity.is_empty() && !is_valid_fidelity_mode(&graph.default_fidelity) {
        diagnostics.push(Diagnostic::new(
            "fidelity_valid",
            Severity::Warning,
            format!(
                "graph default_fidelity '{}' is not a recognized mode",
                graph.default_fidelity
            ),
        ));
    }
    for node in &graph.nodes {
        if !node.fidelity.is_empty() && !is_valid_fidelity_mode(&node.fidelity) {
            diagnostics.push(
                Diagnostic::new(
                    "fidelity_valid",
                    Severity::Warning,
                    format!("node fidelity '{}' is not a recognized mode", node.fidelity),
                )
                .with_node_id(node.id.clone()),
            );
        }
    }
    for edge in &graph.edges {
        if !edge.fidelity.is_empty() && !is_valid_fidelity_mode(&edge.fidelity) {
            diagnostics.push(
                Diagnostic::new(
                    "fidelity_valid",
                    Severity::Warning,
                    format!("edge fidelity '{}' is not a recognized mode", edge.fidelity),
                )
                .with_edge(edge.source.clone(), edge.target.clone()),
            );
        }
    }
    diagnostics
}

fn rule_retry_target_exists(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    for (key, target) in [
        ("retry_target", &graph.retry_target),
        ("fallback_retry_target", &graph.fallback_retry_target),
    ] {
        if !target.is_empty() && !graph.has_node(target) {
            diagnostics.push(Diagnostic::new(
                "retry_target_exists",
                Severity::Warning,
                format!("graph {key} references missing node '{target}'"),
            ));
        }
    }

    for node in &graph.nodes {
        for (key, target) in [
            ("retry_target", &node.retry_target),
            ("fallback_retry_target", &node.fallback_retry_target),
        ] {
            if !target.is_empty() && !graph.has_node(target) {
                diagnostics.push(
                    Diagnostic::new(
                        "retry_target_exists",
                        Severity::Warning,
                        format!("node {key} references missing node '{target}'"),
                    )
                    .with_node_id(node.id.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_goal_gate_has_retry(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .goal_gated_nodes()
        .filter(|node| node.retry_target.is_empty() && node.fallback_retry_target.is_empty())
        .map(|node| {
            Diagnostic::new(
                "goal_gate_has_retry",
                Severity::Warning,
                "goal_gate node should define retry_target or fallback_retry_target",
            )
            .with_node_id(node.id.clone())
            .with_fix("add a retry_target attribute")
        })
        .collect()
}

fn rule_prompt_on_llm_nodes(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes
        .iter()
        .filter(|node| {
            node.handler_type() == "codergen" && node.prompt.is_empty() && node.label.is_empty()
        })
        .map(|node| {
            Diagnostic::new(
                "prompt_on_llm_nodes",
                Severity::Warning,
                format!(
                    "node '{}' resolves to the codergen handler but has no prompt or label",
                    node.id
                ),
            )
            .with_node_id(node.id.clone())
        })
        .collect()
}
