use crate::handlers::{SharedNodeHandler, StepContext};
use crate::{handler_type_for_shape, AttractorError, Node};
use std::collections::BTreeMap;

const DEFAULT_HANDLER_TYPE: &str = "codergen";

/// Maps handler type strings to handler instances. Dispatch order: the
/// node's explicit `type`, then its shape, then the default type.
/// External handlers register by inserting into the map.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers_by_type: BTreeMap<String, SharedNodeHandler>,
    shape_overrides: BTreeMap<String, String>,
    default_handler_type: String,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers_by_type: BTreeMap::new(),
            shape_overrides: BTreeMap::new(),
            default_handler_type: DEFAULT_HANDLER_TYPE.to_string(),
        }
    }

    pub fn register(
        &mut self,
        handler_type: impl Into<String>,
        handler: SharedNodeHandler,
    ) -> Option<SharedNodeHandler> {
        self.handlers_by_type.insert(handler_type.into(), handler)
    }

    pub fn register_shape(
        &mut self,
        shape: impl Into<String>,
        handler_type: impl Into<String>,
    ) -> Option<String> {
        self.shape_overrides.insert(shape.into(), handler_type.into())
    }

    pub fn set_default_handler_type(&mut self, handler_type: impl Into<String>) {
        self.default_handler_type = handler_type.into();
    }

    pub fn resolve_handler_type(&self, node: &Node) -> String {
        let explicit = node.node_type.trim();
        if !explicit.is_empty() {
            return explicit.to_string();
        }
        if let Some(mapped) = self.shape_overrides.get(&node.shape) {
            return mapped.clone();
        }
        handler_type_for_shape(&node.shape).to_string()
    }

    pub fn resolve(&self, node: &Node) -> Option<SharedNodeHandler> {
        let handler_type = self.resolve_handler_type(node);
        self.handlers_by_type.get(&handler_type).cloned().or_else(|| {
            self.handlers_by_type
                .get(&self.default_handler_type)
                .cloned()
        })
    }

    pub fn resolve_or_err(&self, node: &Node) -> Result<SharedNodeHandler, AttractorError> {
        self.resolve(node).ok_or_else(|| {
            AttractorError::Runtime(format!(
                "no handler registered for type '{}' (node '{}')",
                self.resolve_handler_type(node),
                node.id
            ))
        })
    }
}

/// A `StepContext` suitable for unit tests and simulation paths.
pub fn noop_step_context() -> StepContext {
    StepContext {
        preamble: crate::Preamble {
            fidelity: crate::FidelityMode::Compact,
            thread_id: String::new(),
            text: String::new(),
        },
        cancel: tokio_util::sync::CancellationToken::new(),
        logs_root: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::NodeHandler;
    use crate::{ContextStore, Graph, Outcome};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct SuccessHandler;

    #[async_trait]
    impl NodeHandler for SuccessHandler {
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

    fn node_with(shape: &str, node_type: &str) -> Node {
        let mut node = Node::new("n1");
        node.shape = shape.to_string();
        node.node_type = node_type.to_string();
        node
    }

    #[test]
    fn resolve_handler_type_explicit_type_expected_precedence() {
        let registry = HandlerRegistry::new();
        assert_eq!(
            registry.resolve_handler_type(&node_with("diamond", "tool")),
            "tool"
        );
    }

    #[test]
    fn resolve_handler_type_shape_mapping_expected_fixed_table() {
        let registry = HandlerRegistry::new();
        for (shape, expected) in [
            ("Mdiamond", "start"),
            ("Msquare", "exit"),
            ("box", "codergen"),
            ("hexagon", "wait.human"),
            ("diamond", "conditional"),
            ("component", "parallel"),
            ("tripleoctagon", "parallel.fan_in"),
            ("parallelogram", "tool"),
            ("house", "stack.manager_loop"),
            ("mystery", "codergen"),
        ] {
            assert_eq!(registry.resolve_handler_type(&node_with(shape, "")), expected);
        }
    }

    #[test]
    fn resolve_handler_type_shape_override_expected_used() {
        let mut registry = HandlerRegistry::new();
        registry.register_shape("box", "tool");
        assert_eq!(registry.resolve_handler_type(&node_with("box", "")), "tool");
    }

    #[test]
    fn resolve_unregistered_type_expected_default_handler() {
        let mut registry = HandlerRegistry::new();
        let fallback: SharedNodeHandler = Arc::new(SuccessHandler);
        registry.register("codergen", fallback.clone());

        let resolved = registry
            .resolve(&node_with("box", "custom.handler"))
            .expect("default handler should resolve");
        assert!(Arc::ptr_eq(&resolved, &fallback));
    }

    #[test]
    fn resolve_or_err_missing_default_expected_error() {
        let mut registry = HandlerRegistry::new();
        registry.set_default_handler_type("missing");
        let error = match registry.resolve_or_err(&node_with("box", "")) {
            Err(error) => error,
            Ok(_) => panic!("resolution should fail"),
        };
        assert!(matches!(error, AttractorError::Runtime(_)));
    }
}
