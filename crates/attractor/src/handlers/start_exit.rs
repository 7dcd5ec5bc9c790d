use crate::handlers::{NodeHandler, StepContext};
use crate::{AttractorError, ContextStore, Graph, Node, Outcome};
use async_trait::async_trait;

/// Pipeline entry marker. No-op; the engine does the traversal.
#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    async fn execute(
        &self,
        _node: &Node,
        _context: &ContextStore,
        _graph: &Graph,
        _step: &StepContext,
    ) -> Result<Outcome, AttractorError> {
        Ok(Outcome::success())
    }
}

/// Terminal marker. Goal-gate checks run in the engine after this returns.
#[derive(Debug, Default)]
pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    async fn execute(
        &self,
        _node: &Node,
        _context: &ContextStore,
        _graph: &Graph,
        _step: &StepContext,
    ) -> Result<Outcome, AttractorError> {
        Ok(Outcome::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::registry::noop_step_context;
    use crate::StageStatus;

    #[tokio::test(flavor = "current_thread")]
    async fn start_and_exit_expected_success() {
        let graph = Graph::new("g");
        let node = Node::new("n");
        let context = ContextStore::new();
        let step = noop_step_context();

        let start = StartHandler
            .execute(&node, &context, &graph, &step)
            .await
            .expect("start should succeed");
        assert_eq!(start.status, StageStatus::Success);

        let exit = ExitHandler
            .execute(&node, &context, &graph, &step)
            .await
            .expect("exit should succeed");
        assert_eq!(exit.status, StageStatus::Success);
    }
}
