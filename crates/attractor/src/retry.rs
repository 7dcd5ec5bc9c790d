//! Retry policy resolution and backoff pacing for handler invocations.

use crate::{Graph, Node};
use std::time::Duration;

/// Exponential backoff between handler retry attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryBackoff {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 10,
            factor: 2.0,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryBackoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let delay = (self.initial_delay_ms as f64) * self.factor.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64).round() as u64)
    }
}

/// The node's `max_retries` when set above zero, else the graph default.
pub fn effective_max_retries(node: &Node, graph: &Graph) -> u32 {
    if node.max_retries > 0 {
        node.max_retries
    } else {
        graph.default_max_retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_for_attempt_expected_exponential_capped() {
        let backoff = RetryBackoff {
            initial_delay_ms: 100,
            factor: 2.0,
            max_delay_ms: 500,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn effective_max_retries_expected_node_override_then_graph_default() {
        let mut graph = Graph::new("g");
        graph.default_max_retry = 7;
        let mut node = Node::new("n");
        assert_eq!(effective_max_retries(&node, &graph), 7);
        node.max_retries = 2;
        assert_eq!(effective_max_retries(&node, &graph), 2);
    }
}
