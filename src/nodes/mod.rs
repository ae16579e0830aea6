//! Built-in node executors and the registry that dispatches on `type`.

pub mod claude;
pub mod conditional;
pub mod delay;
pub mod file;
pub mod http;
pub mod loop_node;
pub mod parallel;
pub mod registry;
pub mod shell;
pub mod types;

pub use registry::ExecutorRegistry;
pub use types::{ExecCtx, ExecError, NodeExecutor};

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::rate_limiter::ModelLimits;

pub const DEFAULT_CLAUDE_BASE_URL: &str = "https://api.anthropic.com";

/// Shared configuration handed to the built-in executors.
#[derive(Clone)]
pub struct ExecutorConfig {
    /// Secret material (API keys) kept out of workflow YAML.
    pub secrets: HashMap<String, String>,
    /// Claude API endpoint; overridable for tests.
    pub claude_base_url: String,
    /// Per-model request budgets shared across runs.
    pub limits: Arc<ModelLimits>,
}

impl ExecutorConfig {
    pub fn api_key(&self) -> Option<&str> {
        self.secrets.get("ANTHROPIC_API_KEY").map(|s| s.as_str())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            secrets: HashMap::new(),
            claude_base_url: DEFAULT_CLAUDE_BASE_URL.to_string(),
            limits: Arc::new(ModelLimits::new()),
        }
    }
}
