//! Fidelity resolution: how much prior execution state flows to the next
//! node, and under which conversation thread.

use crate::{value_to_string, ContextSnapshot, Edge, Graph, Node, StageStatus};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FidelityMode {
    Full,
    Truncate,
    #[default]
    Compact,
    SummaryLow,
    SummaryMedium,
    SummaryHigh,
}

impl FidelityMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "full" => Some(Self::Full),
            "truncate" => Some(Self::Truncate),
            "compact" => Some(Self::Compact),
            "summary:low" => Some(Self::SummaryLow),
            "summary:medium" => Some(Self::SummaryMedium),
            "summary:high" => Some(Self::SummaryHigh),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Truncate => "truncate",
            Self::Compact => "compact",
            Self::SummaryLow => "summary:low",
            Self::SummaryMedium => "summary:medium",
            Self::SummaryHigh => "summary:high",
        }
    }
}

pub fn is_valid_fidelity_mode(value: &str) -> bool {
    FidelityMode::parse(value).is_some()
}

/// Precedence chain: traversed edge, target node, graph default, then
/// `compact`. The first non-empty, recognized value wins.
pub fn resolve_fidelity(graph: &Graph, node: &Node, incoming_edge: Option<&Edge>) -> FidelityMode {
    let candidates = [
        incoming_edge.map(|edge| edge.fidelity.as_str()).unwrap_or(""),
        node.fidelity.as_str(),
        graph.default_fidelity.as_str(),
    ];
    for candidate in candidates {
        if let Some(mode) = FidelityMode::parse(candidate) {
            return mode;
        }
    }
    FidelityMode::Compact
}

/// Thread id chain: edge override, node override, derived subgraph class,
/// then the previous node's id (or the node's own id at the start).
pub fn resolve_thread_id(
    graph: &Graph,
    node: &Node,
    incoming_edge: Option<&Edge>,
    previous_node_id: Option<&str>,
) -> String {
    if let Some(edge) = incoming_edge {
        if !edge.thread_id.trim().is_empty() {
            return edge.thread_id.trim().to_string();
        }
    }
    if !node.thread_id.trim().is_empty() {
        return node.thread_id.trim().to_string();
    }
    if let Some(subgraph) = graph.subgraph(&node.subgraph) {
        let derived = subgraph.derived_class();
        if !derived.is_empty() {
            return derived;
        }
    }
    previous_node_id
        .filter(|id| !id.is_empty())
        .unwrap_or(&node.id)
        .to_string()
}

/// The fidelity-resolved view of prior execution handed to a handler.
#[derive(Clone, Debug, PartialEq)]
pub struct Preamble {
    pub fidelity: FidelityMode,
    pub thread_id: String,
    pub text: String,
}

/// Assemble the preamble text for a mode from the current execution state.
pub fn build_preamble(
    graph: &Graph,
    completed_nodes: &[String],
    node_statuses: &BTreeMap<String, StageStatus>,
    snapshot: &ContextSnapshot,
    fidelity: FidelityMode,
    thread_id: &str,
) -> Preamble {
    let mut lines = vec![
        format!("Pipeline: {}", graph.name),
        format!("Goal: {}", graph.goal),
    ];

    match fidelity {
        FidelityMode::Truncate => {}
        FidelityMode::Full => {
            lines.push(format!("Thread: {thread_id}"));
            push_stage_lines(&mut lines, "Completed stages:", completed_nodes, node_statuses);
            push_context_lines(&mut lines, "Context:", snapshot, usize::MAX);
        }
        FidelityMode::Compact => {
            push_stage_lines(&mut lines, "Completed stages:", completed_nodes, node_statuses);
            push_context_lines(&mut lines, "Context:", snapshot, 20);
        }
        FidelityMode::SummaryLow => {
            lines.push(String::new());
            lines.push(format!("Completed {} stages.", completed_nodes.len()));
        }
        FidelityMode::SummaryMedium => {
            let recent = tail(completed_nodes, 5);
            push_stage_lines(&mut lines, "Recent stages:", recent, node_statuses);
        }
        FidelityMode::SummaryHigh => {
            let recent = tail(completed_nodes, 10);
            push_stage_lines(&mut lines, "Recent stages:", recent, node_statuses);
            push_context_lines(&mut lines, "Active context:", snapshot, 30);
        }
    }

    Preamble {
        fidelity,
        thread_id: thread_id.to_string(),
        text: lines.join("\n"),
    }
}

fn tail(completed_nodes: &[String], count: usize) -> &[String] {
    let start = completed_nodes.len().saturating_sub(count);
    &completed_nodes[start..]
}

fn push_stage_lines(
    lines: &mut Vec<String>,
    header: &str,
    nodes: &[String],
    node_statuses: &BTreeMap<String, StageStatus>,
) {
    if nodes.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(header.to_string());
    for node_id in nodes {
        let status = node_statuses
            .get(node_id)
            .map(|status| status.as_str())
            .unwrap_or("unknown");
        lines.push(format!("  - {node_id}: {status}"));
    }
}

fn push_context_lines(lines: &mut Vec<String>, header: &str, snapshot: &ContextSnapshot, limit: usize) {
    let entries = snapshot.ordered_entries();
    if entries.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(header.to_string());
    for (key, value) in entries.into_iter().take(limit) {
        lines.push(format!("  {key}: {}", value_to_string(value)));
    }
}
