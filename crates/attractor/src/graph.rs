use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default per-pipeline retry ceiling applied when a node has no
/// `max_retries` of its own.
pub const DEFAULT_MAX_RETRY: u32 = 50;

/// Fixed shape-to-handler mapping used when a node has no explicit `type`.
pub fn handler_type_for_shape(shape: &str) -> &'static str {
    match shape {
        "Mdiamond" => "start",
        "Msquare" => "exit",
        "box" => "codergen",
        "hexagon" => "wait.human",
        "diamond" => "conditional",
        "component" => "parallel",
        "tripleoctagon" => "parallel.fan_in",
        "parallelogram" => "tool",
        "house" => "stack.manager_loop",
        _ => "codergen",
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub shape: String,
    /// Explicit handler type; overrides shape-based dispatch when non-empty.
    pub node_type: String,
    pub prompt: String,
    pub max_retries: u32,
    pub goal_gate: bool,
    pub retry_target: String,
    pub fallback_retry_target: String,
    pub fidelity: String,
    pub thread_id: String,
    pub classes: Vec<String>,
    /// Raw duration string, e.g. `30s` or `5m`.
    pub timeout: String,
    pub llm_model: Option<String>,
    pub llm_provider: Option<String>,
    /// `None` means "unset but defaulted to high"; a stylesheet rule applies
    /// iff the node did not set the property.
    pub reasoning_effort: Option<String>,
    pub auto_status: bool,
    pub allow_partial: bool,
    /// Name of the containing subgraph, if any.
    pub subgraph: String,
    pub extra: BTreeMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            shape: "box".to_string(),
            node_type: String::new(),
            prompt: String::new(),
            max_retries: 0,
            goal_gate: false,
            retry_target: String::new(),
            fallback_retry_target: String::new(),
            fidelity: String::new(),
            thread_id: String::new(),
            classes: Vec::new(),
            timeout: String::new(),
            llm_model: None,
            llm_provider: None,
            reasoning_effort: None,
            auto_status: false,
            allow_partial: false,
            subgraph: String::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn handler_type(&self) -> &str {
        if !self.node_type.is_empty() {
            return &self.node_type;
        }
        handler_type_for_shape(&self.shape)
    }

    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }

    pub fn effective_reasoning_effort(&self) -> &str {
        self.reasoning_effort.as_deref().unwrap_or("high")
    }

    pub fn timeout_millis(&self) -> Option<u64> {
        parse_duration_millis(&self.timeout)
    }

    /// Look up an extra attribute by its dotted name or its underscored
    /// DOT-safe spelling (`human.default_choice` / `human_default_choice`).
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.extra.get(key) {
            return Some(value.as_str());
        }
        if key.contains('.') {
            return self.extra.get(&key.replace('.', "_")).map(String::as_str);
        }
        None
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub label: String,
    pub condition: String,
    pub weight: i64,
    pub fidelity: String,
    pub thread_id: String,
    pub loop_restart: bool,
    pub extra: BTreeMap<String, String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: String::new(),
            condition: String::new(),
            weight: 0,
            fidelity: String::new(),
            thread_id: String::new(),
            loop_restart: false,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Subgraph {
    pub name: String,
    pub label: String,
    pub node_ids: Vec<String>,
}

impl Subgraph {
    /// Derive a class name from the label: lowercase, spaces become hyphens,
    /// everything outside `[a-z0-9-]` is stripped.
    pub fn derived_class(&self) -> String {
        let mut out = String::new();
        let mut prev_dash = false;
        for ch in self.label.trim().to_ascii_lowercase().chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch);
                prev_dash = false;
            } else if ch.is_ascii_whitespace() || ch == '-' {
                if !prev_dash && !out.is_empty() {
                    out.push('-');
                    prev_dash = true;
                }
            }
        }
        if out.ends_with('-') {
            out.pop();
        }
        out
    }
}

/// A parsed pipeline description. Nodes and edges preserve declaration
/// order; the engine and validators rely on that ordering.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    pub goal: String,
    pub label: String,
    pub model_stylesheet: String,
    pub default_max_retry: u32,
    pub retry_target: String,
    pub fallback_retry_target: String,
    pub default_fidelity: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub subgraphs: Vec<Subgraph>,
    pub extra: BTreeMap<String, String>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_max_retry: DEFAULT_MAX_RETRY,
            ..Self::default()
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.id == node_id)
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.node(node_id).is_some()
    }

    /// Outgoing edges of a node in insertion order.
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.source == node_id)
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.target == node_id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|node| node.handler_type() == "start")
    }

    pub fn start_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|node| node.handler_type() == "start")
            .collect()
    }

    pub fn exit_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|node| node.handler_type() == "exit")
            .collect()
    }

    /// Goal-gated nodes in declaration order.
    pub fn goal_gated_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.goal_gate)
    }

    pub fn subgraph(&self, name: &str) -> Option<&Subgraph> {
        self.subgraphs.iter().find(|subgraph| subgraph.name == name)
    }
}

/// Parse a duration literal like `250ms`, `30s`, `5m`, `2h`, or `1d` into
/// milliseconds. A bare number is taken as milliseconds.
pub fn parse_duration_millis(raw: &str) -> Option<u64> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    let split_at = text
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split_at);
    let amount = digits.parse::<u64>().ok()?;
    let factor = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    Some(amount.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_type_explicit_type_expected_override() {
        let mut node = Node::new("n1");
        node.shape = "hexagon".to_string();
        node.node_type = "tool".to_string();
        assert_eq!(node.handler_type(), "tool");
    }

    #[test]
    fn handler_type_unknown_shape_expected_codergen() {
        let mut node = Node::new("n1");
        node.shape = "trapezium".to_string();
        assert_eq!(node.handler_type(), "codergen");
    }

    #[test]
    fn derived_class_label_expected_normalized() {
        let subgraph = Subgraph {
            name: "cluster_loop".to_string(),
            label: "Loop A (v2)".to_string(),
            node_ids: Vec::new(),
        };
        assert_eq!(subgraph.derived_class(), "loop-a-v2");
    }

    #[test]
    fn goal_gated_nodes_expected_declaration_order() {
        let mut graph = Graph::new("g");
        for id in ["b", "a", "c"] {
            let mut node = Node::new(id);
            node.goal_gate = id != "a";
            graph.nodes.push(node);
        }
        let gated: Vec<&str> = graph
            .goal_gated_nodes()
            .map(|node| node.id.as_str())
            .collect();
        assert_eq!(gated, vec!["b", "c"]);
    }

    #[test]
    fn parse_duration_millis_units_expected_values() {
        assert_eq!(parse_duration_millis("250ms"), Some(250));
        assert_eq!(parse_duration_millis("30s"), Some(30_000));
        assert_eq!(parse_duration_millis("5m"), Some(300_000));
        assert_eq!(parse_duration_millis("2h"), Some(7_200_000));
        assert_eq!(parse_duration_millis("oops"), None);
        assert_eq!(parse_duration_millis(""), None);
    }
}
