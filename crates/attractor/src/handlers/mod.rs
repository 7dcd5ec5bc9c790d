//! Node handlers: the behavior bound to each node type. The engine wraps
//! every invocation with retry, timeout, and event emission; handlers
//! communicate back only through the returned [`Outcome`].

use crate::{AttractorError, ContextStore, Graph, Node, Outcome, Preamble};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod codergen;
pub mod conditional;
pub mod manager_loop;
pub mod parallel;
pub mod parallel_fan_in;
pub mod registry;
pub mod start_exit;
pub mod tool;
pub mod wait_human;

/// Per-invocation inputs the engine computes for a handler: the
/// fidelity-resolved preamble, a fresh cancellation token (already a child
/// of the run-level token), and the artifact directory root.
#[derive(Clone, Debug)]
pub struct StepContext {
    pub preamble: Preamble,
    pub cancel: CancellationToken,
    pub logs_root: Option<PathBuf>,
}

impl StepContext {
    pub fn stage_dir(&self, node_id: &str) -> Option<PathBuf> {
        self.logs_root.as_ref().map(|root| root.join(node_id))
    }
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        context: &ContextStore,
        graph: &Graph,
        step: &StepContext,
    ) -> Result<Outcome, AttractorError>;
}

pub type SharedNodeHandler = Arc<dyn NodeHandler>;
