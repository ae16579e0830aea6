//! Loop node: a controller marker.
//!
//! The scheduler drives the iterations itself, running the body node once
//! per item with `item` and `index` bound in the template environment; this
//! executor only validates the spec.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::types::{ExecCtx, ExecError, NodeExecutor};
use crate::workflow::{Node, NodeKind};

pub struct LoopExecutor;

#[async_trait]
impl NodeExecutor for LoopExecutor {
    fn node_type(&self) -> &str {
        "loop"
    }

    fn validate_spec(&self, node: &Node) -> Vec<String> {
        let mut errors = Vec::new();
        if let NodeKind::Loop(spec) = &node.kind {
            if spec.items.trim().is_empty() {
                errors.push("items cannot be empty".to_string());
            }
        }
        errors
    }

    async fn execute(&self, node: &Node, _ctx: &ExecCtx) -> Result<Value, ExecError> {
        let NodeKind::Loop(spec) = &node.kind else {
            return Err(ExecError::permanent("node is not a loop node"));
        };
        Ok(json!({ "node": spec.node }))
    }

    fn description(&self) -> &str {
        "Run a node once per item of a list"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testutil::make_node;
    use crate::workflow::LoopSpec;

    #[test]
    fn test_empty_items_rejected() {
        let node = make_node(
            "each",
            NodeKind::Loop(LoopSpec {
                items: " ".to_string(),
                node: "body".to_string(),
            }),
        );
        assert_eq!(LoopExecutor.validate_spec(&node).len(), 1);
    }
}
