//! Parallel node: a grouping marker.
//!
//! Children are ordinary nodes gated on the group; the scheduler releases
//! them when the group starts and completes the group when every child is
//! terminal. Executing the marker itself does no work.

use async_trait::async_trait;
use serde_json::Value;

use super::types::{ExecCtx, ExecError, NodeExecutor};
use crate::workflow::{Node, NodeKind};

pub struct ParallelExecutor;

#[async_trait]
impl NodeExecutor for ParallelExecutor {
    fn node_type(&self) -> &str {
        "parallel"
    }

    fn validate_spec(&self, node: &Node) -> Vec<String> {
        let mut errors = Vec::new();
        if let NodeKind::Parallel(spec) = &node.kind {
            let mut seen = std::collections::HashSet::new();
            for child in &spec.nodes {
                if !seen.insert(child.as_str()) {
                    errors.push(format!("child '{}' listed more than once", child));
                }
            }
        }
        errors
    }

    async fn execute(&self, node: &Node, _ctx: &ExecCtx) -> Result<Value, ExecError> {
        let NodeKind::Parallel(_) = &node.kind else {
            return Err(ExecError::permanent("node is not a parallel node"));
        };
        // The scheduler records the real output (one entry per child).
        Ok(Value::Array(Vec::new()))
    }

    fn description(&self) -> &str {
        "Group nodes to run concurrently"
    }
}
