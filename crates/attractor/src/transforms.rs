//! Structural transforms applied after parsing and before validation.

use crate::{apply_stylesheet, parse_dot, validate, AttractorError, Diagnostic, Graph, LintRule};

pub trait Transform: Send + Sync {
    fn apply(&self, graph: &mut Graph) -> Result<(), AttractorError>;
}

/// Expands `$goal` in node prompts with the graph's goal. Idempotent.
#[derive(Clone, Copy, Debug, Default)]
pub struct VariableExpansionTransform;

impl Transform for VariableExpansionTransform {
    fn apply(&self, graph: &mut Graph) -> Result<(), AttractorError> {
        if graph.goal.is_empty() {
            return Ok(());
        }
        let goal = graph.goal.clone();
        for node in &mut graph.nodes {
            if node.prompt.contains("$goal") {
                node.prompt = node.prompt.replace("$goal", &goal);
            }
        }
        Ok(())
    }
}

/// Resolves per-node LLM configuration from the graph's model stylesheet.
#[derive(Clone, Copy, Debug, Default)]
pub struct StylesheetTransform;

impl Transform for StylesheetTransform {
    fn apply(&self, graph: &mut Graph) -> Result<(), AttractorError> {
        apply_stylesheet(graph)
    }
}

pub fn apply_builtin_transforms(graph: &mut Graph) -> Result<(), AttractorError> {
    VariableExpansionTransform.apply(graph)?;
    StylesheetTransform.apply(graph)?;
    Ok(())
}

/// Parse, transform, and validate a DOT source. Returns the prepared graph
/// together with all diagnostics; the caller decides whether warnings block.
pub fn prepare_pipeline(
    dot_source: &str,
    custom_transforms: &[&dyn Transform],
    extra_rules: &[&dyn LintRule],
) -> Result<(Graph, Vec<Diagnostic>), AttractorError> {
    let mut graph = parse_dot(dot_source)?;
    apply_builtin_transforms(&mut graph)?;
    for transform in custom_transforms {
        transform.apply(&mut graph)?;
    }
    let diagnostics = validate(&graph, extra_rules);
    Ok((graph, diagnostics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_expansion_expected_goal_substituted() {
        let mut graph = parse_dot(
            r#"
            digraph G {
                graph [goal="Ship feature"]
                plan [prompt="Plan for $goal"]
            }
            "#,
        )
        .expect("graph should parse");

        VariableExpansionTransform
            .apply(&mut graph)
            .expect("transform should apply");
        assert_eq!(
            graph.node("plan").expect("plan should exist").prompt,
            "Plan for Ship feature"
        );
    }

    #[test]
    fn variable_expansion_twice_expected_idempotent() {
        let mut graph = parse_dot(
            r#"
            digraph G {
                graph [goal="G1"]
                plan [prompt="Do $goal now"]
            }
            "#,
        )
        .expect("graph should parse");

        VariableExpansionTransform
            .apply(&mut graph)
            .expect("first apply should succeed");
        let once = graph.clone();
        VariableExpansionTransform
            .apply(&mut graph)
            .expect("second apply should succeed");
        assert_eq!(graph, once);
    }

    #[test]
    fn prepare_pipeline_expected_graph_and_diagnostics() {
        let (graph, diagnostics) = prepare_pipeline(
            r#"
            digraph G {
                graph [goal="ship", model_stylesheet="* { llm_model: m1; }"]
                start [shape=Mdiamond]
                plan [prompt="for $goal"]
                exit [shape=Msquare]
                start -> plan -> exit
            }
            "#,
            &[],
            &[],
        )
        .expect("pipeline should prepare");

        assert!(diagnostics.iter().all(|d| !d.is_error()));
        let plan = graph.node("plan").expect("plan should exist");
        assert_eq!(plan.prompt, "for ship");
        assert_eq!(plan.llm_model.as_deref(), Some("m1"));
    }
}
