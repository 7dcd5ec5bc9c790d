//! Five-step edge selection: condition matches, preferred label, suggested
//! next ids, unconditional weight, then any edge. Deterministic given a
//! fixed outcome and context snapshot.

use crate::{evaluate_condition, ContextValues, Edge, Graph, Outcome};

/// Select exactly one outgoing edge for the node just completed, or `None`
/// when the node has no outgoing edges.
pub fn select_edge<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    outcome: &Outcome,
    context: &ContextValues,
) -> Option<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from_node_id).collect();
    if edges.is_empty() {
        return None;
    }

    // Step 1: edges whose non-empty condition evaluates true.
    let condition_matched: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            !edge.condition.trim().is_empty()
                && evaluate_condition(&edge.condition, outcome, context)
        })
        .collect();
    if !condition_matched.is_empty() {
        return best_by_weight_then_target(condition_matched);
    }

    // Step 2: label matching the outcome's preferred label after
    // normalization.
    if let Some(preferred) = outcome
        .preferred_label
        .as_deref()
        .filter(|label| !label.is_empty())
    {
        let normalized = normalize_label(preferred);
        let label_matched: Vec<&Edge> = edges
            .iter()
            .copied()
            .filter(|edge| normalize_label(&edge.label) == normalized)
            .collect();
        if !label_matched.is_empty() {
            return best_by_weight_then_target(label_matched);
        }
    }

    // Step 3: first edge whose target appears in the suggestion list,
    // honoring suggestion order.
    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = edges.iter().copied().find(|edge| edge.target == *suggested) {
            return Some(edge);
        }
    }

    // Step 4: unconditional edges by weight.
    let unconditional: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| edge.condition.trim().is_empty())
        .collect();
    if !unconditional.is_empty() {
        return best_by_weight_then_target(unconditional);
    }

    // Step 5: any edge.
    best_by_weight_then_target(edges)
}

/// Highest weight wins; ties break by target id ascending.
fn best_by_weight_then_target<'a>(edges: Vec<&'a Edge>) -> Option<&'a Edge> {
    edges.into_iter().max_by(|left, right| {
        left.weight
            .cmp(&right.weight)
            .then_with(|| right.target.cmp(&left.target))
    })
}

/// Normalize a label for comparison: strip one leading accelerator prefix
/// (`[X] `, `X) `, or `X - `), lowercase, collapse whitespace.
pub fn normalize_label(label: &str) -> String {
    let trimmed = label.trim();
    let stripped = strip_accelerator_prefix(trimmed);
    stripped
        .to_ascii_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_accelerator_prefix(label: &str) -> &str {
    let bytes = label.as_bytes();

    // [X] Label
    if let Some(rest) = label.strip_prefix('[') {
        if let Some((key, tail)) = rest.split_once(']') {
            if key.chars().count() == 1 && tail.starts_with(' ') {
                return tail.trim_start();
            }
        }
    }
    // X) Label
    if bytes.len() >= 3 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b')' && bytes[2] == b' '
    {
        return label[2..].trim_start();
    }
    // X - Label
    if bytes.len() >= 4
        && bytes[0].is_ascii_alphanumeric()
        && bytes[1] == b' '
        && bytes[2] == b'-'
        && bytes[3] == b' '
    {
        return label[3..].trim_start();
    }
    label
}
