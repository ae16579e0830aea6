//! Workflow type definitions.
//!
//! A `Workflow` is immutable after parse + validation and shared read-only
//! across any number of concurrent runs.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// name: nightly-report
/// description: Build and upload the nightly report
///
/// inputs:
///   day:
///     type: string
///     required: true
///
/// nodes:
///   - id: build
///     type: shell
///     command: "make report DAY=${inputs.day}"
///
///   - id: upload
///     type: http
///     method: POST
///     url: https://api.example.com/reports
///     body: "${outputs.build.stdout}"
///     depends_on: [build]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    /// Unique workflow name (`^[a-z][a-z0-9-]*$`).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Version number (for tracking changes).
    pub version: u32,
    /// Declared inputs, in declaration order.
    pub inputs: Vec<InputSpec>,
    /// Trigger specs, opaque to the engine; surfaced to an external trigger
    /// subsystem.
    pub triggers: Vec<Trigger>,
    /// Nodes (steps), in declaration order.
    pub nodes: Vec<Node>,
    /// Global workflow settings.
    pub settings: WorkflowSettings,
}

impl Workflow {
    /// Get a node by ID.
    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Get a declared input spec by name.
    pub fn get_input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// All node types used in this workflow, sorted and deduplicated.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.nodes.iter().map(|n| n.kind.type_name()).collect();
        types.sort();
        types.dedup();
        types
    }
}

/// Declared workflow input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub input_type: InputType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: String,
}

/// Closed set of input types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Int,
    Float,
    Bool,
    List,
    Object,
}

impl InputType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(InputType::String),
            "int" => Some(InputType::Int),
            "float" => Some(InputType::Float),
            "bool" => Some(InputType::Bool),
            "list" => Some(InputType::List),
            "object" => Some(InputType::Object),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Int => "int",
            InputType::Float => "float",
            InputType::Bool => "bool",
            InputType::List => "list",
            InputType::Object => "object",
        }
    }

    /// Whether a JSON value inhabits this type. Ints are accepted for
    /// `float`.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Int => value.is_i64() || value.is_u64(),
            InputType::Float => value.is_number(),
            InputType::Bool => value.is_boolean(),
            InputType::List => value.is_array(),
            InputType::Object => value.is_object(),
        }
    }
}

/// Workflow trigger, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

/// A node (step) in the workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique node ID within this workflow.
    pub id: String,
    /// Type-specific payload.
    pub kind: NodeKind,
    /// Nodes that must reach a terminal state before this one starts.
    pub depends_on: Vec<String>,
    /// Condition expression; the node is skipped if it evaluates falsy.
    /// Missing references count as false here.
    pub when: Option<String>,
    /// Per-node timeout (overrides nothing; enforced on this node only).
    pub timeout: Option<Duration>,
    /// Retry configuration. Absent means a single attempt.
    pub retry: Option<RetryConfig>,
    /// What happens to the rest of the run when this node fails.
    pub on_error: OnError,
    /// Scheduling priority among simultaneously eligible nodes (higher
    /// first; ties break by declaration order).
    pub priority: i32,
}

/// Node variant payloads, tagged by `type` in YAML.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Shell(ShellSpec),
    Http(HttpSpec),
    ClaudeApi(ClaudeSpec),
    Conditional(ConditionalSpec),
    Parallel(ParallelSpec),
    Loop(LoopSpec),
    Delay(DelaySpec),
    FileRead(FileReadSpec),
    FileWrite(FileWriteSpec),
    /// A type claimed by a registered executor; config passed through.
    Custom { type_name: String, config: Value },
}

impl NodeKind {
    pub fn type_name(&self) -> &str {
        match self {
            NodeKind::Shell(_) => "shell",
            NodeKind::Http(_) => "http",
            NodeKind::ClaudeApi(_) => "claude-api",
            NodeKind::Conditional(_) => "conditional",
            NodeKind::Parallel(_) => "parallel",
            NodeKind::Loop(_) => "loop",
            NodeKind::Delay(_) => "delay",
            NodeKind::FileRead(_) => "file-read",
            NodeKind::FileWrite(_) => "file-write",
            NodeKind::Custom { type_name, .. } => type_name,
        }
    }
}

/// Shell command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellSpec {
    /// Command line, templated; run via `sh -c`.
    pub command: String,
    /// Extra environment variables (values templated).
    pub env: BTreeMap<String, String>,
    /// Working directory, templated.
    pub cwd: Option<String>,
    /// Whether a non-zero exit is retry-eligible.
    pub retry_on_nonzero_exit: bool,
}

/// HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Accepted status codes. Empty means default classification
    /// (2xx ok, 5xx transient, 4xx permanent).
    pub expect_status: Vec<u16>,
}

/// Anthropic messages API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeSpec {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub tools: Vec<Value>,
}

/// Conditional branch: evaluates `condition` and enables one of two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalSpec {
    pub condition: String,
    pub then_node: String,
    pub else_node: Option<String>,
}

/// Parallel group: the scheduler runs the listed child nodes concurrently
/// and collects their outputs into a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelSpec {
    pub nodes: Vec<String>,
}

/// Loop: the scheduler fans the child node out over the resolved items,
/// indexing outputs as `outputs.<id>[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Templated expression yielding a list.
    pub items: String,
    /// Child node ID executed once per item.
    pub node: String,
}

/// Sleep for a fixed duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelaySpec {
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReadSpec {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWriteSpec {
    pub path: String,
    pub content: String,
    pub append: bool,
}

/// Retry configuration for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Multiplier applied per subsequent retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Randomize delays by ±10%.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: true,
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

/// Failure policy for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Cancel the run; running nodes drain, pending nodes become cancelled.
    #[default]
    Fail,
    /// Dependents see this node as satisfied with null output.
    Continue,
    /// Transitive dependents are skipped; the rest of the graph proceeds.
    SkipDependents,
}

impl OnError {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fail" => Some(OnError::Fail),
            "continue" => Some(OnError::Continue),
            "skip_dependents" => Some(OnError::SkipDependents),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OnError::Fail => "fail",
            OnError::Continue => "continue",
            OnError::SkipDependents => "skip_dependents",
        }
    }
}

/// Global workflow settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSettings {
    /// Maximum run duration; on expiry the run ends `timed_out`.
    pub timeout: Option<Duration>,
    /// Cap on concurrently executing nodes.
    pub max_parallel_nodes: usize,
    /// Default failure policy for nodes without their own `on_error`.
    pub on_error: OnError,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            timeout: None,
            max_parallel_nodes: default_max_parallel(),
            on_error: OnError::Fail,
        }
    }
}

pub(crate) fn default_max_parallel() -> usize {
    10
}

/// Parse a duration literal: `"30s"`, `"5m"`, `"1h"`, `"250ms"`, `"1d"`, or
/// a bare integer (seconds).
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (num, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit())?);
    let n: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        "d" => Some(Duration::from_secs(n * 86_400)),
        _ => None,
    }
}

/// Canonical duration rendering for serialization.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("nope"), None);
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_format_duration_round_trips() {
        for d in [
            Duration::from_secs(30),
            Duration::from_secs(300),
            Duration::from_millis(250),
        ] {
            assert_eq!(parse_duration(&format_duration(d)), Some(d));
        }
    }

    #[test]
    fn test_input_type_matches() {
        assert!(InputType::String.matches(&json!("x")));
        assert!(InputType::Int.matches(&json!(3)));
        assert!(!InputType::Int.matches(&json!(3.5)));
        assert!(InputType::Float.matches(&json!(3)));
        assert!(InputType::Float.matches(&json!(3.5)));
        assert!(InputType::Bool.matches(&json!(true)));
        assert!(InputType::List.matches(&json!([1])));
        assert!(InputType::Object.matches(&json!({})));
        assert!(!InputType::Object.matches(&json!([1])));
    }

    #[test]
    fn test_on_error_parse() {
        assert_eq!(OnError::parse("fail"), Some(OnError::Fail));
        assert_eq!(OnError::parse("continue"), Some(OnError::Continue));
        assert_eq!(
            OnError::parse("skip_dependents"),
            Some(OnError::SkipDependents)
        );
        assert_eq!(OnError::parse("explode"), None);
    }

    #[test]
    fn test_retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.attempts, 3);
        assert_eq!(retry.backoff_initial_ms, 1000);
        assert_eq!(retry.backoff_multiplier, 2.0);
        assert_eq!(retry.max_backoff_ms, 60_000);
        assert!(retry.jitter);
    }
}
