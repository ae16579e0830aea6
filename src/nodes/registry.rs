//! Executor registry: maps `type` strings to executors.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::NodeExecutor;
use super::ExecutorConfig;

/// Registry of node executors, keyed by node type.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// Registry with every built-in executor installed.
    pub fn new(config: ExecutorConfig) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(super::shell::ShellExecutor::new()));
        registry.register(Arc::new(super::http::HttpExecutor::new()));
        registry.register(Arc::new(super::claude::ClaudeExecutor::new(&config)));
        registry.register(Arc::new(super::conditional::ConditionalExecutor));
        registry.register(Arc::new(super::parallel::ParallelExecutor));
        registry.register(Arc::new(super::loop_node::LoopExecutor));
        registry.register(Arc::new(super::delay::DelayExecutor));
        registry.register(Arc::new(super::file::FileReadExecutor));
        registry.register(Arc::new(super::file::FileWriteExecutor));
        registry
    }

    /// Empty registry for composing custom executor sets.
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Default-configured registry for tests.
    pub fn for_tests() -> Self {
        Self::new(ExecutorConfig::default())
    }

    /// Install an executor, replacing any previous claim on its type.
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors
            .insert(executor.node_type().to_string(), executor);
    }

    pub fn has(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    /// Registered type names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    /// (type, description) pairs, sorted by type.
    pub fn descriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .executors
            .iter()
            .map(|(k, v)| (k.clone(), v.description().to_string()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ExecutorRegistry::for_tests();
        for node_type in [
            "shell",
            "http",
            "claude-api",
            "conditional",
            "parallel",
            "loop",
            "delay",
            "file-read",
            "file-write",
        ] {
            assert!(registry.has(node_type), "missing {}", node_type);
        }
        assert!(!registry.has("teleport"));
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = ExecutorRegistry::for_tests();
        let types = registry.list();
        let mut sorted = types.clone();
        sorted.sort();
        assert_eq!(types, sorted);
    }
}
