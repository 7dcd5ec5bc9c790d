//! DOT front end: lowers the `graphviz_rust` AST into the typed [`Graph`]
//! model. Supported subset: non-strict digraphs, plain and quoted
//! attributes, subgraph clusters with node/edge defaults, chained edges.
//! HTML labels, ports, and undirected edges are rejected.

use crate::{AttractorError, Edge, Graph, Node, Subgraph, parse_duration_millis};
use graphviz_rust::dot_structures::{
    Attribute, Edge as DotEdge, EdgeTy, Graph as DotGraph, GraphAttributes, Id, Node as DotNode,
    NodeId, Stmt, Subgraph as DotSubgraph, Vertex,
};
use std::collections::BTreeMap;

type RawAttrs = BTreeMap<String, String>;

#[derive(Clone, Debug, Default)]
struct Scope {
    node_defaults: RawAttrs,
    edge_defaults: RawAttrs,
    subgraph: Option<String>,
}

pub fn parse_dot(source: &str) -> Result<Graph, AttractorError> {
    if has_undirected_edge_token(source) {
        return Err(AttractorError::InvalidGraph(
            "undirected edge token '--' is not supported".to_string(),
        ));
    }

    let normalized = normalize_duration_literals(source);
    let dot_graph = graphviz_rust::parse(&normalized).map_err(AttractorError::DotParse)?;
    convert_graph(dot_graph)
}

fn convert_graph(dot_graph: DotGraph) -> Result<Graph, AttractorError> {
    let (id, strict, is_digraph, stmts) = match dot_graph {
        DotGraph::DiGraph { id, strict, stmts } => (id, strict, true, stmts),
        DotGraph::Graph { id, strict, stmts } => (id, strict, false, stmts),
    };
    if !is_digraph {
        return Err(AttractorError::InvalidGraph(
            "only 'digraph' is supported".to_string(),
        ));
    }
    if strict {
        return Err(AttractorError::InvalidGraph(
            "'strict' graphs are not supported".to_string(),
        ));
    }

    let mut graph = Graph::new(id_to_string(&id)?);
    process_statements(&mut graph, &stmts, &Scope::default(), true)?;
    Ok(graph)
}

fn process_statements(
    graph: &mut Graph,
    stmts: &[Stmt],
    parent_scope: &Scope,
    top_level: bool,
) -> Result<(), AttractorError> {
    let mut scope = parent_scope.clone();

    for stmt in stmts {
        match stmt {
            Stmt::GAttribute(group) => match group {
                GraphAttributes::Node(attrs) => {
                    merge_attrs(&mut scope.node_defaults, attrs)?;
                }
                GraphAttributes::Edge(attrs) => {
                    merge_attrs(&mut scope.edge_defaults, attrs)?;
                }
                GraphAttributes::Graph(attrs) => {
                    if top_level {
                        for attr in attrs {
                            let (key, value) = parse_attribute(attr)?;
                            apply_graph_attr(graph, &key, &value)?;
                        }
                    }
                }
            },
            Stmt::Attribute(attr) => {
                // Inside a subgraph a bare `label=...` names the cluster and
                // is handled by the pre-scan; at top level it is a graph attr.
                if top_level {
                    let (key, value) = parse_attribute(attr)?;
                    apply_graph_attr(graph, &key, &value)?;
                }
            }
            Stmt::Node(node) => process_node_stmt(graph, node, &scope)?,
            Stmt::Edge(edge) => process_edge_stmt(graph, edge, &scope)?,
            Stmt::Subgraph(subgraph) => process_subgraph_stmt(graph, subgraph, &scope)?,
        }
    }

    Ok(())
}

fn process_subgraph_stmt(
    graph: &mut Graph,
    subgraph: &DotSubgraph,
    parent_scope: &Scope,
) -> Result<(), AttractorError> {
    let name = match &subgraph.id {
        Id::Anonymous(_) => format!("subgraph_{}", graph.subgraphs.len()),
        other => id_to_string(other)?,
    };
    let label = scan_subgraph_label(&subgraph.stmts)?;

    if graph.subgraph(&name).is_none() {
        graph.subgraphs.push(Subgraph {
            name: name.clone(),
            label,
            node_ids: Vec::new(),
        });
    }

    let mut scope = parent_scope.clone();
    scope.subgraph = Some(name);
    process_statements(graph, &subgraph.stmts, &scope, false)
}

/// The cluster label can appear anywhere in the block, so scan before
/// processing members.
fn scan_subgraph_label(stmts: &[Stmt]) -> Result<String, AttractorError> {
    let mut label = String::new();
    for stmt in stmts {
        match stmt {
            Stmt::Attribute(Attribute(key, value)) => {
                if id_to_string(key)? == "label" {
                    label = id_to_string(value)?;
                }
            }
            Stmt::GAttribute(GraphAttributes::Graph(attrs)) => {
                for attr in attrs {
                    let (key, value) = parse_attribute(attr)?;
                    if key == "label" {
                        label = value;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(label)
}

fn process_node_stmt(
    graph: &mut Graph,
    node: &DotNode,
    scope: &Scope,
) -> Result<(), AttractorError> {
    let node_id = parse_node_id(&node.id)?;
    ensure_node(graph, &node_id, scope)?;

    let mut attrs = RawAttrs::new();
    merge_attrs(&mut attrs, &node.attributes)?;
    let entry = graph
        .node_mut(&node_id)
        .ok_or_else(|| AttractorError::InvalidGraph(format!("node '{node_id}' vanished")))?;
    for (key, value) in &attrs {
        apply_node_attr(entry, key, value)?;
    }
    Ok(())
}

fn process_edge_stmt(
    graph: &mut Graph,
    edge: &DotEdge,
    scope: &Scope,
) -> Result<(), AttractorError> {
    let vertices = match &edge.ty {
        EdgeTy::Pair(from, to) => vec![parse_vertex(from)?, parse_vertex(to)?],
        EdgeTy::Chain(chain) => {
            let mut out = Vec::with_capacity(chain.len());
            for vertex in chain {
                out.push(parse_vertex(vertex)?);
            }
            out
        }
    };
    if vertices.len() < 2 {
        return Err(AttractorError::InvalidGraph(
            "edge chain must contain at least two vertices".to_string(),
        ));
    }

    for node_id in &vertices {
        ensure_node(graph, node_id, scope)?;
    }

    let mut attrs = scope.edge_defaults.clone();
    merge_attrs(&mut attrs, &edge.attributes)?;

    for pair in vertices.windows(2) {
        let mut parsed = Edge::new(pair[0].clone(), pair[1].clone());
        for (key, value) in &attrs {
            apply_edge_attr(&mut parsed, key, value)?;
        }
        graph.edges.push(parsed);
    }
    Ok(())
}

/// Create a node on first sight, seeding it with the scope's node defaults
/// and subgraph membership. Later statements refine it without re-applying
/// defaults.
fn ensure_node(graph: &mut Graph, node_id: &str, scope: &Scope) -> Result<(), AttractorError> {
    if graph.has_node(node_id) {
        return Ok(());
    }

    let mut node = Node::new(node_id);
    for (key, value) in &scope.node_defaults {
        apply_node_attr(&mut node, key, value)?;
    }

    if let Some(subgraph_name) = &scope.subgraph {
        node.subgraph = subgraph_name.clone();
        if let Some(subgraph) = graph
            .subgraphs
            .iter_mut()
            .find(|subgraph| subgraph.name == *subgraph_name)
        {
            if !subgraph.node_ids.iter().any(|id| id == node_id) {
                subgraph.node_ids.push(node_id.to_string());
            }
            let derived = subgraph.derived_class();
            if !derived.is_empty() && !node.classes.contains(&derived) {
                node.classes.push(derived);
            }
        }
    }

    graph.nodes.push(node);
    Ok(())
}

fn apply_graph_attr(graph: &mut Graph, key: &str, value: &str) -> Result<(), AttractorError> {
    match key {
        "name" => graph.name = value.to_string(),
        "goal" => graph.goal = value.to_string(),
        "label" => graph.label = value.to_string(),
        "model_stylesheet" => graph.model_stylesheet = value.to_string(),
        "default_max_retry" => graph.default_max_retry = parse_u32(key, value)?,
        "retry_target" => graph.retry_target = value.to_string(),
        "fallback_retry_target" => graph.fallback_retry_target = value.to_string(),
        "default_fidelity" => graph.default_fidelity = value.to_string(),
        _ => {
            graph.extra.insert(key.to_string(), value.to_string());
        }
    }
    Ok(())
}

fn apply_node_attr(node: &mut Node, key: &str, value: &str) -> Result<(), AttractorError> {
    match key {
        "label" => node.label = value.to_string(),
        "shape" => node.shape = value.to_string(),
        "type" => node.node_type = value.to_string(),
        "prompt" => node.prompt = value.to_string(),
        "max_retries" => node.max_retries = parse_u32(key, value)?,
        "goal_gate" => node.goal_gate = parse_bool(value),
        "retry_target" => node.retry_target = value.to_string(),
        "fallback_retry_target" => node.fallback_retry_target = value.to_string(),
        "fidelity" => node.fidelity = value.to_string(),
        "thread_id" => node.thread_id = value.to_string(),
        "class" => {
            for class in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
                if !node.classes.iter().any(|existing| existing == class) {
                    node.classes.push(class.to_string());
                }
            }
        }
        "timeout" => node.timeout = value.to_string(),
        "llm_model" => node.llm_model = Some(value.to_string()),
        "llm_provider" => node.llm_provider = Some(value.to_string()),
        "reasoning_effort" => node.reasoning_effort = Some(value.to_string()),
        "auto_status" => node.auto_status = parse_bool(value),
        "allow_partial" => node.allow_partial = parse_bool(value),
        _ => {
            node.extra.insert(key.to_string(), value.to_string());
        }
    }
    Ok(())
}

fn apply_edge_attr(edge: &mut Edge, key: &str, value: &str) -> Result<(), AttractorError> {
    match key {
        "label" => edge.label = value.to_string(),
        "condition" => edge.condition = value.to_string(),
        "weight" => {
            edge.weight = value.parse::<i64>().map_err(|_| {
                AttractorError::InvalidGraph(format!("edge weight '{value}' is not an integer"))
            })?;
        }
        "fidelity" => edge.fidelity = value.to_string(),
        "thread_id" => edge.thread_id = value.to_string(),
        "loop_restart" => edge.loop_restart = parse_bool(value),
        _ => {
            edge.extra.insert(key.to_string(), value.to_string());
        }
    }
    Ok(())
}

fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn parse_u32(key: &str, value: &str) -> Result<u32, AttractorError> {
    value.trim().parse::<u32>().map_err(|_| {
        AttractorError::InvalidGraph(format!(
            "attribute '{key}' value '{value}' is not a non-negative integer"
        ))
    })
}

fn merge_attrs(target: &mut RawAttrs, attrs: &[Attribute]) -> Result<(), AttractorError> {
    for attr in attrs {
        let (key, value) = parse_attribute(attr)?;
        target.insert(key, value);
    }
    Ok(())
}

fn parse_attribute(attr: &Attribute) -> Result<(String, String), AttractorError> {
    Ok((id_to_string(&attr.0)?, id_to_string(&attr.1)?))
}

fn parse_vertex(vertex: &Vertex) -> Result<String, AttractorError> {
    match vertex {
        Vertex::N(node_id) => parse_node_id(node_id),
        Vertex::S(_) => Err(AttractorError::InvalidGraph(
            "subgraph vertices in edge statements are not supported".to_string(),
        )),
    }
}

fn parse_node_id(node_id: &NodeId) -> Result<String, AttractorError> {
    if node_id.1.is_some() {
        return Err(AttractorError::InvalidGraph(
            "ports in node identifiers are not supported".to_string(),
        ));
    }
    id_to_string(&node_id.0)
}

fn id_to_string(id: &Id) -> Result<String, AttractorError> {
    match id {
        Id::Plain(value) | Id::Anonymous(value) => Ok(value.clone()),
        Id::Escaped(value) => {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|inner| inner.strip_suffix('"'))
                .ok_or_else(|| {
                    AttractorError::InvalidGraph(format!(
                        "escaped string '{value}' is missing quotes"
                    ))
                })?;
            Ok(unescape_dot_string(unquoted))
        }
        Id::Html(_) => Err(AttractorError::InvalidGraph(
            "HTML labels are not supported".to_string(),
        )),
    }
}

fn unescape_dot_string(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => output.push('\n'),
            Some('t') => output.push('\t'),
            Some('"') => output.push('"'),
            Some('\\') => output.push('\\'),
            Some(other) => output.push(other),
            None => output.push('\\'),
        }
    }
    output
}

/// Detect `--` outside strings and comments before handing the source to
/// the DOT grammar, which would otherwise report a less useful error.
fn has_undirected_edge_token(source: &str) -> bool {
    let bytes = source.as_bytes();
    let mut index = 0;
    let mut in_string = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while index < bytes.len() {
        let current = bytes[index] as char;
        let next = bytes.get(index + 1).map(|byte| *byte as char);

        if in_line_comment {
            if current == '\n' {
                in_line_comment = false;
            }
            index += 1;
            continue;
        }
        if in_block_comment {
            if current == '*' && next == Some('/') {
                in_block_comment = false;
                index += 2;
            } else {
                index += 1;
            }
            continue;
        }
        if in_string {
            if current == '\\' {
                index += 2;
                continue;
            }
            if current == '"' {
                in_string = false;
            }
            index += 1;
            continue;
        }

        match (current, next) {
            ('/', Some('/')) => {
                in_line_comment = true;
                index += 2;
            }
            ('/', Some('*')) => {
                in_block_comment = true;
                index += 2;
            }
            ('"', _) => {
                in_string = true;
                index += 1;
            }
            ('-', Some('-')) => return true,
            _ => index += 1,
        }
    }
    false
}

/// Quote bare duration literals (`timeout=900s`) so the DOT grammar accepts
/// them; quoted values and comments pass through untouched.
fn normalize_duration_literals(source: &str) -> String {
    let mut output = String::with_capacity(source.len() + 16);
    let bytes = source.as_bytes();
    let mut index = 0;
    let mut in_string = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while index < bytes.len() {
        let current = bytes[index] as char;
        let next = bytes.get(index + 1).map(|byte| *byte as char);

        if in_line_comment {
            output.push(current);
            if current == '\n' {
                in_line_comment = false;
            }
            index += 1;
            continue;
        }
        if in_block_comment {
            output.push(current);
            if current == '*' && next == Some('/') {
                output.push('/');
                in_block_comment = false;
                index += 2;
            } else {
                index += 1;
            }
            continue;
        }
        if in_string {
            output.push(current);
            if current == '\\' {
                if let Some(escaped) = next {
                    output.push(escaped);
                    index += 2;
                    continue;
                }
            }
            if current == '"' {
                in_string = false;
            }
            index += 1;
            continue;
        }

        match (current, next) {
            ('/', Some('/')) => {
                output.push_str("//");
                in_line_comment = true;
                index += 2;
                continue;
            }
            ('/', Some('*')) => {
                output.push_str("/*");
                in_block_comment = true;
                index += 2;
                continue;
            }
            ('"', _) => {
                output.push('"');
                in_string = true;
                index += 1;
                continue;
            }
            ('=', _) => {
                output.push('=');
                index += 1;
                while index < bytes.len() && (bytes[index] as char).is_whitespace() {
                    output.push(bytes[index] as char);
                    index += 1;
                }
                if index >= bytes.len() || bytes[index] as char == '"' {
                    continue;
                }
                let token_start = index;
                while index < bytes.len() && (bytes[index] as char).is_ascii_alphanumeric() {
                    index += 1;
                }
                let token = &source[token_start..index];
                if !token.is_empty()
                    && token.chars().next().is_some_and(|ch| ch.is_ascii_digit())
                    && token.chars().any(|ch| ch.is_ascii_alphabetic())
                    && parse_duration_millis(token).is_some()
                {
                    output.push('"');
                    output.push_str(token);
                    output.push('"');
                } else {
                    output.push_str(token);
                }
                continue;
            }
            _ => {
                output.push(current);
                index += 1;
            }
        }
    }

    output
}
