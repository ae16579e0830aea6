//! Shared per-run state: node statuses, outputs, and cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use super::events::{EventSink, RunEvent};
use crate::template::Environment;

/// Cooperative cancellation handle shared by every task in a run.
///
/// The first caller to [`CancelToken::cancel`] wins; the recorded reason is
/// never overwritten.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    tx: watch::Sender<bool>,
    reason: Mutex<Option<String>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(CancelInner {
                tx,
                reason: Mutex::new(None),
            }),
        }
    }

    /// Request cancellation. Returns true if this call was the first.
    pub fn cancel(&self, reason: &str) -> bool {
        let mut guard = match self.inner.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return false;
        }
        *guard = Some(reason.to_string());
        // send() is lossy without a live receiver; send_replace always
        // records the value, so cancels issued before anyone subscribes
        // are still observed.
        self.inner.tx.send_replace(true);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.tx.borrow()
    }

    pub fn reason(&self) -> Option<String> {
        match self.inner.reason.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Resolve when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender kept alive by this token; unreachable in practice.
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        }
    }
}

/// Final outcome of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
        }
    }
}

/// Failure classification carried on a failed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Timeout,
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeError {
    pub category: ErrorCategory,
    pub message: String,
}

/// Recorded state of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    pub attempts: u32,
}

impl NodeState {
    fn new() -> Self {
        Self {
            status: NodeStatus::Pending,
            started_at: None,
            finished_at: None,
            value: None,
            error: None,
            attempts: 0,
        }
    }
}

/// Shared mutable state for one workflow run.
///
/// Status transitions are monotonic: a terminal status is final and later
/// writers lose. Lifecycle events are emitted inside the state lock so their
/// order matches the transition order.
pub struct RunContext {
    run_id: String,
    workflow: String,
    inputs: Value,
    env_vars: Value,
    states: Mutex<HashMap<String, NodeState>>,
    sink: Arc<dyn EventSink>,
    cancel: CancelToken,
}

impl RunContext {
    pub fn new(
        run_id: String,
        workflow: String,
        node_ids: impl IntoIterator<Item = String>,
        inputs: Value,
        env_vars: Value,
        sink: Arc<dyn EventSink>,
        cancel: CancelToken,
    ) -> Self {
        let states = node_ids
            .into_iter()
            .map(|id| (id, NodeState::new()))
            .collect();
        Self {
            run_id,
            workflow,
            inputs,
            env_vars,
            states: Mutex::new(states),
            sink,
            cancel,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<String, NodeState>> {
        match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Transition a node's status. Returns false if the node was already
    /// terminal (the existing status stands).
    pub fn set_status(&self, node_id: &str, status: NodeStatus) -> bool {
        let mut states = self.lock_states();
        let Some(state) = states.get_mut(node_id) else {
            return false;
        };
        if state.status.is_terminal() || state.status == status {
            return false;
        }
        let now = Utc::now();
        state.status = status;
        match status {
            NodeStatus::Running => {
                if state.started_at.is_none() {
                    state.started_at = Some(now);
                    self.sink.emit(RunEvent::NodeStarted {
                        run_id: self.run_id.clone(),
                        node: node_id.to_string(),
                        at: now,
                    });
                }
            }
            _ => {
                state.finished_at = Some(now);
                self.sink.emit(RunEvent::NodeFinished {
                    run_id: self.run_id.clone(),
                    node: node_id.to_string(),
                    status,
                    at: now,
                    attempts: state.attempts,
                    error: state.error.as_ref().map(|e| e.message.clone()),
                });
            }
        }
        true
    }

    /// Record a node's output. Ignored once the node is terminal.
    pub fn set_output(&self, node_id: &str, value: Value) {
        let mut states = self.lock_states();
        if let Some(state) = states.get_mut(node_id) {
            if !state.status.is_terminal() {
                state.value = Some(value);
            }
        }
    }

    /// Record a node's error. Ignored once the node is terminal.
    pub fn set_error(&self, node_id: &str, error: NodeError) {
        let mut states = self.lock_states();
        if let Some(state) = states.get_mut(node_id) {
            if !state.status.is_terminal() {
                state.error = Some(error);
            }
        }
    }

    pub fn record_attempt(&self, node_id: &str) {
        let mut states = self.lock_states();
        if let Some(state) = states.get_mut(node_id) {
            state.attempts += 1;
        }
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.lock_states().get(node_id).map(|s| s.status)
    }

    pub fn output(&self, node_id: &str) -> Option<Value> {
        self.lock_states().get(node_id).and_then(|s| s.value.clone())
    }

    pub fn attempts(&self, node_id: &str) -> u32 {
        self.lock_states().get(node_id).map(|s| s.attempts).unwrap_or(0)
    }

    pub fn emit(&self, event: RunEvent) {
        self.sink.emit(event);
    }

    pub fn log(&self, node_id: &str, message: impl Into<String>) {
        self.sink.emit(RunEvent::NodeLog {
            run_id: self.run_id.clone(),
            node: node_id.to_string(),
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// Build a template environment from the current outputs.
    ///
    /// Every node with a recorded value appears under `outputs`, keyed by
    /// node id; terminal nodes without a value resolve to null.
    pub fn snapshot_env(&self) -> Environment {
        let states = self.lock_states();
        let mut outputs = serde_json::Map::new();
        for (id, state) in states.iter() {
            if state.status.is_terminal() || state.value.is_some() {
                outputs.insert(id.clone(), state.value.clone().unwrap_or(Value::Null));
            }
        }
        Environment::new(
            self.inputs.clone(),
            Value::Object(outputs),
            self.env_vars.clone(),
            json!({ "id": self.run_id, "workflow": self.workflow }),
        )
    }

    pub fn snapshot_states(&self) -> HashMap<String, NodeState> {
        self.lock_states().clone()
    }
}
