//! Executor trait and the execution-time error model.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::context::{CancelToken, ErrorCategory, RunContext};
use crate::template::Environment;
use crate::workflow::Node;

/// Failure of a single execution attempt.
///
/// Transient failures and timeouts are eligible for retry under the node's
/// retry policy; permanent failures and cancellation are not.
#[derive(Debug, Clone)]
pub enum ExecError {
    Transient {
        message: String,
        /// Server-requested backoff, e.g. from a Retry-After header.
        retry_after: Option<Duration>,
    },
    Permanent {
        message: String,
    },
    Timeout {
        after: Duration,
    },
    Cancelled {
        reason: String,
    },
}

impl ExecError {
    pub fn transient(message: impl Into<String>) -> Self {
        ExecError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ExecError::Permanent {
            message: message.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, ExecError::Transient { .. } | ExecError::Timeout { .. })
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ExecError::Transient { .. } => ErrorCategory::Transient,
            ExecError::Permanent { .. } => ErrorCategory::Permanent,
            ExecError::Timeout { .. } => ErrorCategory::Timeout,
            ExecError::Cancelled { .. } => ErrorCategory::Cancelled,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExecError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Transient { message, .. } => write!(f, "{}", message),
            ExecError::Permanent { message } => write!(f, "{}", message),
            ExecError::Timeout { after } => {
                write!(f, "timed out after {}ms", after.as_millis())
            }
            ExecError::Cancelled { reason } => write!(f, "cancelled: {}", reason),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<crate::error::TemplateError> for ExecError {
    fn from(e: crate::error::TemplateError) -> Self {
        ExecError::permanent(e.to_string())
    }
}

/// Everything an executor sees for one attempt.
///
/// The environment is snapshotted at eligibility time; executors enforce
/// their own deadline from `timeout` and watch `cancel` for early exit.
pub struct ExecCtx {
    pub run_id: String,
    pub node_id: String,
    pub ctx: Arc<RunContext>,
    pub env: Environment,
    pub cancel: CancelToken,
    pub timeout: Option<Duration>,
}

impl ExecCtx {
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Emit a node-scoped log line onto the run's event stream.
    pub fn log(&self, message: impl Into<String>) {
        self.ctx.log(&self.node_id, message);
    }
}

/// A node type: validates its spec at load time and runs attempts.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// The `type` string this executor claims in workflow YAML.
    fn node_type(&self) -> &str;

    /// Spec problems beyond what parsing catches. Empty means valid.
    fn validate_spec(&self, _node: &Node) -> Vec<String> {
        Vec::new()
    }

    /// Run one attempt. The returned value becomes `outputs.<id>`.
    async fn execute(&self, node: &Node, ctx: &ExecCtx) -> Result<Value, ExecError>;

    fn description(&self) -> &str {
        ""
    }
}
