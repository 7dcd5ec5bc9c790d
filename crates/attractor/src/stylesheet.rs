//! CSS-like model stylesheet: `SELECTOR { prop: value; ... }` rules that
//! assign per-node LLM configuration. Selectors are `*` (specificity 0),
//! `.class` (1), and `#id` (2); later and more specific rules win, and a
//! property the node set explicitly is never overwritten.

use crate::{AttractorError, Graph, Node};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    Universal,
    Class(String),
    NodeId(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyleRule {
    pub selector: Selector,
    pub declarations: Vec<(String, String)>,
    pub order: usize,
}

impl StyleRule {
    pub fn specificity(&self) -> usize {
        match self.selector {
            Selector::Universal => 0,
            Selector::Class(_) => 1,
            Selector::NodeId(_) => 2,
        }
    }

    fn matches(&self, node: &Node, subgraph_class: Option<&str>) -> bool {
        match &self.selector {
            Selector::Universal => true,
            Selector::NodeId(id) => *id == node.id,
            Selector::Class(name) => {
                node.classes.iter().any(|class| class == name)
                    || subgraph_class.is_some_and(|derived| derived == name)
            }
        }
    }
}

const RECOGNIZED_PROPERTIES: [&str; 3] = ["llm_model", "llm_provider", "reasoning_effort"];

pub fn parse_stylesheet(input: &str) -> Result<Vec<StyleRule>, AttractorError> {
    let mut rules = Vec::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        let Some(open) = rest.find('{') else {
            return Err(AttractorError::StylesheetParse(
                "missing '{' after selector".to_string(),
            ));
        };
        let selector = parse_selector(rest[..open].trim())?;
        rest = &rest[open + 1..];

        let Some(close) = rest.find('}') else {
            return Err(AttractorError::StylesheetParse(
                "missing closing '}' for stylesheet rule".to_string(),
            ));
        };
        let declarations = parse_declarations(&rest[..close])?;
        rest = &rest[close + 1..];

        rules.push(StyleRule {
            selector,
            declarations,
            order: rules.len(),
        });
    }

    Ok(rules)
}

fn parse_selector(raw: &str) -> Result<Selector, AttractorError> {
    if raw == "*" {
        return Ok(Selector::Universal);
    }
    if let Some(name) = raw.strip_prefix('#') {
        if name.is_empty() {
            return Err(AttractorError::StylesheetParse(
                "empty node id selector '#'".to_string(),
            ));
        }
        return Ok(Selector::NodeId(name.to_string()));
    }
    if let Some(name) = raw.strip_prefix('.') {
        if name.is_empty() {
            return Err(AttractorError::StylesheetParse(
                "empty class selector '.'".to_string(),
            ));
        }
        return Ok(Selector::Class(name.to_string()));
    }
    Err(AttractorError::StylesheetParse(format!(
        "unsupported selector '{raw}'"
    )))
}

fn parse_declarations(block: &str) -> Result<Vec<(String, String)>, AttractorError> {
    let mut declarations = Vec::new();
    for raw in block.split(';') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let Some((property, value)) = raw.split_once(':') else {
            return Err(AttractorError::StylesheetParse(format!(
                "declaration '{raw}' is missing ':'"
            )));
        };
        let property = property.trim();
        let value = unquote(value.trim());
        // Unknown properties are ignored, not errors.
        if RECOGNIZED_PROPERTIES.contains(&property) {
            declarations.push((property.to_string(), value));
        }
    }
    Ok(declarations)
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// Apply the graph's `model_stylesheet` to every node. Matching rules are
/// applied in (specificity, declaration order) ascending, so later and more
/// specific rules overwrite earlier ones; node-explicit values always win.
pub fn apply_stylesheet(graph: &mut Graph) -> Result<(), AttractorError> {
    if graph.model_stylesheet.trim().is_empty() {
        return Ok(());
    }
    let rules = parse_stylesheet(&graph.model_stylesheet)?;

    let subgraph_classes: Vec<(String, String)> = graph
        .subgraphs
        .iter()
        .map(|subgraph| (subgraph.name.clone(), subgraph.derived_class()))
        .collect();

    for node in &mut graph.nodes {
        let subgraph_class = subgraph_classes
            .iter()
            .find(|(name, _)| *name == node.subgraph)
            .map(|(_, class)| class.as_str())
            .filter(|class| !class.is_empty());

        // Applying matches in (specificity, order) ascending with later
        // writes overwriting earlier ones reduces to: the highest-ranked
        // declaration of each property wins.
        for property in RECOGNIZED_PROPERTIES {
            let winner = rules
                .iter()
                .filter(|rule| rule.matches(node, subgraph_class))
                .filter_map(|rule| {
                    rule.declarations
                        .iter()
                        .rev()
                        .find(|(declared, _)| declared == property)
                        .map(|(_, value)| (rule.specificity(), rule.order, value))
                })
                .max_by_key(|(specificity, order, _)| (*specificity, *order));
            if let Some((_, _, value)) = winner {
                apply_property(node, property, value);
            }
        }
    }

    Ok(())
}

/// A property the node set explicitly is never overwritten; for
/// `reasoning_effort`, `None` means "unset but defaulted to high", so the
/// rule applies iff the node did not set the property itself.
fn apply_property(node: &mut Node, property: &str, value: &str) {
    match property {
        "llm_model" => {
            if node.llm_model.is_none() {
                node.llm_model = Some(value.to_string());
            }
        }
        "llm_provider" => {
            if node.llm_provider.is_none() {
                node.llm_provider = Some(value.to_string());
            }
        }
        "reasoning_effort" => {
            if node.reasoning_effort.is_none() {
                node.reasoning_effort = Some(value.to_string());
            }
        }
        _ => {}
    }
}
