//! Edge condition expressions: `&&`-joined clauses of `key=value`,
//! `key!=value`, or a bare key truthiness test, evaluated against the
//! just-produced outcome and a context snapshot. Pure and idempotent.

use crate::{value_to_string, ContextValues, Outcome};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Truthy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Clause<'a> {
    key: &'a str,
    operator: Operator,
    value: &'a str,
}

/// Evaluate a condition expression. An empty condition is true.
pub fn evaluate_condition(condition: &str, outcome: &Outcome, context: &ContextValues) -> bool {
    parse_clauses(condition)
        .iter()
        .all(|clause| evaluate_clause(clause, outcome, context))
}

fn parse_clauses(condition: &str) -> Vec<Clause<'_>> {
    let mut clauses = Vec::new();
    for raw in condition.split("&&") {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        if let Some((left, right)) = raw.split_once("!=") {
            clauses.push(Clause {
                key: left.trim(),
                operator: Operator::Ne,
                value: right.trim(),
            });
        } else if let Some((left, right)) = raw.split_once('=') {
            clauses.push(Clause {
                key: left.trim(),
                operator: Operator::Eq,
                value: right.trim(),
            });
        } else {
            clauses.push(Clause {
                key: raw,
                operator: Operator::Truthy,
                value: "",
            });
        }
    }
    clauses
}

fn evaluate_clause(clause: &Clause<'_>, outcome: &Outcome, context: &ContextValues) -> bool {
    let resolved = resolve_key(clause.key, outcome, context);
    match clause.operator {
        Operator::Truthy => is_truthy(resolved.as_ref()),
        Operator::Eq => resolved_to_string(resolved) == clause.value,
        Operator::Ne => resolved_to_string(resolved) != clause.value,
    }
}

/// Resolve a clause key. `outcome` and `preferred_label` bind to the
/// outcome; `context.KEY` looks up the full key first and then the suffix
/// after the dot (pipeline authors store keys both ways); any other key is
/// a direct context lookup. Missing keys resolve to the empty string.
fn resolve_key(key: &str, outcome: &Outcome, context: &ContextValues) -> Option<Value> {
    match key {
        "outcome" => Some(Value::String(outcome.status.as_str().to_string())),
        "preferred_label" => Some(Value::String(
            outcome.preferred_label.clone().unwrap_or_default(),
        )),
        _ => {
            if let Some(suffix) = key.strip_prefix("context.") {
                return context
                    .get(key)
                    .cloned()
                    .or_else(|| context.get(suffix).cloned());
            }
            context.get(key).cloned()
        }
    }
}

fn resolved_to_string(value: Option<Value>) -> String {
    value.as_ref().map(value_to_string).unwrap_or_default()
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(inner)) => *inner,
        Some(Value::String(inner)) => !inner.is_empty(),
        Some(Value::Number(inner)) => inner.as_f64().is_some_and(|number| number != 0.0),
        Some(Value::Array(inner)) => !inner.is_empty(),
        Some(Value::Object(inner)) => !inner.is_empty(),
    }
}
