//! Conditional node: evaluates its condition and names the branch to run.
//!
//! The scheduler reads the output to skip the losing branch; this executor
//! only decides.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::types::{ExecCtx, ExecError, NodeExecutor};
use crate::template;
use crate::workflow::{Node, NodeKind};

pub struct ConditionalExecutor;

#[async_trait]
impl NodeExecutor for ConditionalExecutor {
    fn node_type(&self) -> &str {
        "conditional"
    }

    fn validate_spec(&self, node: &Node) -> Vec<String> {
        let mut errors = Vec::new();
        if let NodeKind::Conditional(spec) = &node.kind {
            if spec.condition.trim().is_empty() {
                errors.push("condition cannot be empty".to_string());
            }
            if spec.else_node.as_deref() == Some(spec.then_node.as_str()) {
                errors.push("then and else cannot name the same node".to_string());
            }
        }
        errors
    }

    async fn execute(&self, node: &Node, ctx: &ExecCtx) -> Result<Value, ExecError> {
        let NodeKind::Conditional(spec) = &node.kind else {
            return Err(ExecError::permanent("node is not a conditional node"));
        };

        // A condition that cannot evaluate is a hard failure, unlike `when`.
        let result = template::eval_condition_strict(&spec.condition, ctx.env())
            .map_err(|e| ExecError::permanent(e.to_string()))?;

        Ok(json!({
            "condition": spec.condition,
            "result": result,
            "then": spec.then_node,
            "else": spec.else_node,
        }))
    }

    fn description(&self) -> &str {
        "Route to one of two branches based on a condition"
    }
}
