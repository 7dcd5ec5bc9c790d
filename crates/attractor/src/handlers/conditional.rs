use crate::handlers::{NodeHandler, StepContext};
use crate::{AttractorError, ContextStore, Graph, Node, Outcome};
use async_trait::async_trait;

/// No-op for diamond nodes. The routing decision lives in the engine's edge
/// selector; this handler only returns SUCCESS so selection can run.
#[derive(Debug, Default)]
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &ContextStore,
        _graph: &Graph,
        _step: &StepContext,
    ) -> Result<Outcome, AttractorError> {
        Ok(Outcome::success().with_notes(format!("Conditional node evaluated: {}", node.id)))
    }
}
