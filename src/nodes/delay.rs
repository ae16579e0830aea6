//! Delay node: sleeps for a fixed duration.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::types::{ExecCtx, ExecError, NodeExecutor};
use crate::workflow::{Node, NodeKind};

pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    fn node_type(&self) -> &str {
        "delay"
    }

    async fn execute(&self, node: &Node, ctx: &ExecCtx) -> Result<Value, ExecError> {
        let NodeKind::Delay(spec) = &node.kind else {
            return Err(ExecError::permanent("node is not a delay node"));
        };

        tokio::select! {
            _ = tokio::time::sleep(spec.duration) => {}
            _ = ctx.cancel.cancelled() => {
                return Err(ExecError::Cancelled {
                    reason: ctx.cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
                });
            }
        }

        Ok(json!({ "slept_ms": spec.duration.as_millis() as u64 }))
    }

    fn description(&self) -> &str {
        "Pause the workflow for a fixed duration"
    }
}
