//! The workflow scheduler.
//!
//! Runs a validated workflow to completion: nodes become eligible when
//! their dependencies (explicit `depends_on` plus implicit control edges)
//! reach a terminal status, wait in a FIFO ready queue for one of the
//! `max_parallel_nodes` executor slots, and run as tokio tasks. Conditional,
//! parallel, and loop controllers occupy no slot; a loop controller drives
//! its body node directly, one slot per iteration.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::context::{
    CancelToken, NodeError, NodeState, NodeStatus, RunContext, RunStatus,
};
use super::events::{EventSink, FanoutSink, NullSink, RunEvent, RunMeta, RunStore};
use crate::error::{Error, Result};
use crate::nodes::types::{ExecCtx, ExecError, NodeExecutor};
use crate::nodes::ExecutorRegistry;
use crate::template::{self, Environment};
use crate::workflow::{Node, NodeKind, OnError, RetryConfig, Workflow};
use crate::workflow::resolve_inputs;

/// Extra time a node task gets past its own deadline before the scheduler
/// gives up on it.
const TIMEOUT_SLACK: Duration = Duration::from_secs(2);

/// Per-run knobs; anything unset falls back to the workflow's settings.
#[derive(Default)]
pub struct RunOptions {
    pub inputs: Map<String, Value>,
    /// Values exposed under the `env` template namespace.
    pub env: BTreeMap<String, String>,
    pub max_parallel_nodes: Option<usize>,
    pub timeout: Option<Duration>,
    /// Persist the run (meta.json, events.ndjson) under this directory.
    pub run_dir: Option<PathBuf>,
    pub event_sink: Option<Arc<dyn EventSink>>,
}

/// Final report for one run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: HashMap<String, NodeState>,
    /// Id of the node whose failure decided the run, if any.
    pub first_failure: Option<String>,
}

impl RunResult {
    pub fn node(&self, id: &str) -> Option<&NodeState> {
        self.nodes.get(id)
    }

    pub fn output(&self, id: &str) -> Option<&Value> {
        self.nodes.get(id).and_then(|s| s.value.as_ref())
    }
}

/// Handle to a run started with [`Runner::spawn`].
pub struct RunHandle {
    cancel: CancelToken,
    ctx: Arc<OnceLock<Arc<RunContext>>>,
    join: tokio::task::JoinHandle<Result<RunResult>>,
}

impl RunHandle {
    pub fn cancel(&self, reason: &str) {
        self.cancel.cancel(reason);
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Current status of one node; None until the run context exists or if
    /// the id is unknown.
    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.ctx.get().and_then(|ctx| ctx.status(node_id))
    }

    /// Point-in-time copy of every node's state. Empty before input
    /// validation completes.
    pub fn snapshot(&self) -> HashMap<String, NodeState> {
        self.ctx
            .get()
            .map(|ctx| ctx.snapshot_states())
            .unwrap_or_default()
    }

    pub async fn wait(self) -> Result<RunResult> {
        self.join
            .await
            .map_err(|e| Error::Execution(format!("run task panicked: {}", e)))?
    }
}

/// Executes workflows against a fixed executor registry.
pub struct Runner {
    registry: Arc<ExecutorRegistry>,
}

impl Runner {
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Run a validated workflow to completion.
    pub async fn run(&self, workflow: Workflow, options: RunOptions) -> Result<RunResult> {
        run_inner(
            self.registry.clone(),
            Arc::new(workflow),
            options,
            CancelToken::new(),
            Arc::new(OnceLock::new()),
        )
        .await
    }

    /// Start a run in the background and return a cancellable handle.
    pub fn spawn(&self, workflow: Workflow, options: RunOptions) -> RunHandle {
        let cancel = CancelToken::new();
        let ctx = Arc::new(OnceLock::new());
        let join = tokio::spawn(run_inner(
            self.registry.clone(),
            Arc::new(workflow),
            options,
            cancel.clone(),
            ctx.clone(),
        ));
        RunHandle { cancel, ctx, join }
    }
}

/// Implicit release conditions beyond `depends_on`.
#[derive(Debug, Clone, Copy)]
enum Gate {
    /// Wait for this dependency to reach a terminal status.
    Dep(usize),
    /// Wait for this conditional to succeed and choose us.
    Branch { controller: usize },
    /// Wait for this parallel group to start.
    Child { controller: usize },
}

enum Decision {
    Wait,
    Run,
    Skip,
}

struct Scheduler {
    workflow: Arc<Workflow>,
    registry: Arc<ExecutorRegistry>,
    ctx: Arc<RunContext>,
    cancel: CancelToken,
    sem: Arc<Semaphore>,
    gates: Vec<Vec<Gate>>,
    /// Body nodes driven directly by a loop controller.
    loop_children: HashMap<usize, usize>,
    scheduled: Vec<bool>,
    ready: VecDeque<usize>,
    tasks: JoinSet<(usize, std::result::Result<Value, ExecError>)>,
    first_cause: Option<RunStatus>,
    first_failure: Option<String>,
}

impl Scheduler {
    fn new(
        workflow: Arc<Workflow>,
        registry: Arc<ExecutorRegistry>,
        ctx: Arc<RunContext>,
        cancel: CancelToken,
        max_parallel: usize,
    ) -> Self {
        let n = workflow.nodes.len();
        let index_of: HashMap<&str, usize> = workflow
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.as_str(), i))
            .collect();

        let mut gates: Vec<Vec<Gate>> = vec![Vec::new(); n];
        let mut loop_children = HashMap::new();
        for (idx, node) in workflow.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                if let Some(&d) = index_of.get(dep.as_str()) {
                    gates[idx].push(Gate::Dep(d));
                }
            }
            match &node.kind {
                NodeKind::Conditional(spec) => {
                    if let Some(&t) = index_of.get(spec.then_node.as_str()) {
                        gates[t].push(Gate::Branch { controller: idx });
                    }
                    if let Some(e) = &spec.else_node {
                        if let Some(&e) = index_of.get(e.as_str()) {
                            gates[e].push(Gate::Branch { controller: idx });
                        }
                    }
                }
                NodeKind::Parallel(spec) => {
                    for child in &spec.nodes {
                        if let Some(&c) = index_of.get(child.as_str()) {
                            gates[c].push(Gate::Child { controller: idx });
                        }
                    }
                }
                NodeKind::Loop(spec) => {
                    if let Some(&c) = index_of.get(spec.node.as_str()) {
                        loop_children.insert(c, idx);
                    }
                }
                _ => {}
            }
        }

        Self {
            workflow,
            registry,
            ctx,
            cancel,
            sem: Arc::new(Semaphore::new(max_parallel)),
            gates,
            loop_children,
            scheduled: vec![false; n],
            ready: VecDeque::new(),
            tasks: JoinSet::new(),
            first_cause: None,
            first_failure: None,
        }
    }

    fn status(&self, idx: usize) -> NodeStatus {
        self.ctx
            .status(&self.workflow.nodes[idx].id)
            .unwrap_or(NodeStatus::Pending)
    }

    fn all_done(&self) -> bool {
        self.tasks.is_empty()
            && self
                .workflow
                .nodes
                .iter()
                .enumerate()
                .all(|(idx, _)| self.status(idx).is_terminal())
    }

    fn decide(&self, idx: usize) -> Decision {
        let node = &self.workflow.nodes[idx];
        for gate in &self.gates[idx] {
            match *gate {
                Gate::Dep(d) => match self.status(d) {
                    NodeStatus::Pending | NodeStatus::Running => return Decision::Wait,
                    NodeStatus::Succeeded => {}
                    NodeStatus::Failed => match self.workflow.nodes[d].on_error {
                        OnError::Continue => {}
                        OnError::SkipDependents => return Decision::Skip,
                        // Global cancellation is already underway; the
                        // pending-node sweep will pick this node up.
                        OnError::Fail => return Decision::Wait,
                    },
                    NodeStatus::Skipped | NodeStatus::Cancelled => return Decision::Skip,
                },
                Gate::Branch { controller } => match self.status(controller) {
                    NodeStatus::Pending | NodeStatus::Running => return Decision::Wait,
                    NodeStatus::Succeeded => {
                        let chosen = self
                            .ctx
                            .output(&self.workflow.nodes[controller].id)
                            .and_then(|v| {
                                let key = if v["result"] == json!(true) { "then" } else { "else" };
                                v[key].as_str().map(|s| s.to_string())
                            });
                        if chosen.as_deref() != Some(node.id.as_str()) {
                            return Decision::Skip;
                        }
                    }
                    _ => return Decision::Skip,
                },
                Gate::Child { controller } => match self.status(controller) {
                    NodeStatus::Pending => return Decision::Wait,
                    NodeStatus::Running => {}
                    _ => return Decision::Skip,
                },
            }
        }
        Decision::Run
    }

    /// Advance every node that can move, repeating until a fixpoint.
    fn pass(&mut self) {
        loop {
            let mut changed = false;

            for idx in 0..self.workflow.nodes.len() {
                if self.scheduled[idx] || self.status(idx) != NodeStatus::Pending {
                    continue;
                }
                let id = self.workflow.nodes[idx].id.clone();

                // Loop bodies are driven by their controller.
                if let Some(&controller) = self.loop_children.get(&idx) {
                    if self.status(controller).is_terminal() {
                        changed |= self.ctx.set_status(&id, NodeStatus::Skipped);
                    }
                    continue;
                }

                if self.cancel.is_cancelled() {
                    changed |= self.ctx.set_status(&id, NodeStatus::Cancelled);
                    continue;
                }

                match self.decide(idx) {
                    Decision::Wait => {}
                    Decision::Skip => {
                        changed |= self.ctx.set_status(&id, NodeStatus::Skipped);
                    }
                    Decision::Run => {
                        changed |= self.release(idx);
                    }
                }
            }

            changed |= self.complete_parallel_groups();

            if !changed {
                break;
            }
        }
    }

    /// A node's gates are satisfied; apply `when` and hand it off.
    fn release(&mut self, idx: usize) -> bool {
        let workflow = self.workflow.clone();
        let node = &workflow.nodes[idx];
        let id = node.id.clone();

        if let Some(when) = &node.when {
            let env = self.ctx.snapshot_env();
            match template::eval_condition(when, &env) {
                Ok(false) => {
                    return self.ctx.set_status(&id, NodeStatus::Skipped);
                }
                Ok(true) => {}
                Err(e) => {
                    self.fail_node(idx, &ExecError::permanent(format!("when: {}", e)));
                    return true;
                }
            }
        }

        match &node.kind {
            NodeKind::Parallel(_) => self.ctx.set_status(&id, NodeStatus::Running),
            NodeKind::Loop(_) => {
                self.scheduled[idx] = true;
                self.ctx.set_status(&id, NodeStatus::Running);
                self.spawn_loop(idx);
                true
            }
            _ => {
                self.scheduled[idx] = true;
                // Keep declaration order within a batch; priority is
                // handled by draining higher-priority entries first.
                let priority = node.priority;
                let pos = self
                    .ready
                    .iter()
                    .position(|&other| self.workflow.nodes[other].priority < priority)
                    .unwrap_or(self.ready.len());
                self.ready.insert(pos, idx);
                true
            }
        }
    }

    /// Finish any running parallel group whose children are all terminal.
    /// The group takes the worst child status: failed beats cancelled beats
    /// succeeded; skipped children count as fine.
    fn complete_parallel_groups(&mut self) -> bool {
        let workflow = self.workflow.clone();
        let mut changed = false;
        for idx in 0..workflow.nodes.len() {
            let NodeKind::Parallel(spec) = &workflow.nodes[idx].kind else {
                continue;
            };
            if self.status(idx) != NodeStatus::Running {
                continue;
            }
            let done = spec.nodes.iter().all(|child| {
                self.ctx
                    .status(child)
                    .map(|s| s.is_terminal())
                    .unwrap_or(true)
            });
            if !done {
                continue;
            }

            let id = workflow.nodes[idx].id.clone();
            let collected: Vec<Value> = spec
                .nodes
                .iter()
                .map(|child| {
                    let status = self
                        .ctx
                        .status(child)
                        .map(|s| s.as_str())
                        .unwrap_or("pending");
                    json!({
                        "node": child,
                        "status": status,
                        "output": self.ctx.output(child).unwrap_or(Value::Null),
                    })
                })
                .collect();
            self.ctx.set_output(&id, Value::Array(collected));

            let failed_child = spec
                .nodes
                .iter()
                .find(|child| self.ctx.status(child) == Some(NodeStatus::Failed))
                .cloned();
            let any_cancelled = spec
                .nodes
                .iter()
                .any(|child| self.ctx.status(child) == Some(NodeStatus::Cancelled));
            if let Some(child) = failed_child {
                self.fail_node(
                    idx,
                    &ExecError::permanent(format!("child '{}' failed", child)),
                );
                changed = true;
            } else if any_cancelled {
                changed |= self.ctx.set_status(&id, NodeStatus::Cancelled);
            } else {
                changed |= self.ctx.set_status(&id, NodeStatus::Succeeded);
            }
        }
        changed
    }

    /// Pop the next ready node, highest priority first.
    fn next_ready(&mut self) -> Option<usize> {
        self.ready.pop_front()
    }

    fn spawn_node(&mut self, idx: usize, permit: OwnedSemaphorePermit) {
        let node = self.workflow.nodes[idx].clone();
        let Some(executor) = self.registry.get(node.kind.type_name()) else {
            self.fail_node(
                idx,
                &ExecError::permanent(format!("no executor for type '{}'", node.kind.type_name())),
            );
            return;
        };

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        ctx.set_status(&node.id, NodeStatus::Running);
        let env = ctx.snapshot_env();

        self.tasks.spawn(async move {
            let _permit = permit;
            let result = run_attempts(executor, &node, env, ctx, cancel).await;
            (idx, result)
        });
    }

    fn spawn_loop(&mut self, idx: usize) {
        let child = self
            .loop_children
            .iter()
            .find(|(_, &controller)| controller == idx)
            .map(|(&child, _)| child);
        let Some(child_idx) = child else {
            self.fail_node(idx, &ExecError::permanent("loop body is missing"));
            return;
        };

        let workflow = self.workflow.clone();
        let registry = self.registry.clone();
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let sem = self.sem.clone();

        self.tasks.spawn(async move {
            let result = run_loop(workflow, idx, child_idx, registry, ctx, cancel, sem).await;
            (idx, result)
        });
    }

    /// Record a task's outcome and apply the node's error policy.
    fn complete(&mut self, idx: usize, result: std::result::Result<Value, ExecError>) {
        let id = self.workflow.nodes[idx].id.clone();
        match result {
            Ok(value) => {
                self.ctx.set_output(&id, value);
                self.ctx.set_status(&id, NodeStatus::Succeeded);
            }
            Err(e) => match e {
                ExecError::Cancelled { .. } => {
                    self.ctx.set_status(&id, NodeStatus::Cancelled);
                }
                other => self.fail_node(idx, &other),
            },
        }
    }

    fn fail_node(&mut self, idx: usize, error: &ExecError) {
        let workflow = self.workflow.clone();
        let node = &workflow.nodes[idx];
        let id = node.id.clone();
        self.ctx.set_error(
            &id,
            NodeError {
                category: error.category(),
                message: error.to_string(),
            },
        );
        self.ctx.set_status(&id, NodeStatus::Failed);
        if self.first_failure.is_none() {
            self.first_failure = Some(id.clone());
        }
        if node.on_error == OnError::Fail {
            if self.first_cause.is_none() {
                self.first_cause = Some(RunStatus::Failed);
            }
            self.cancel.cancel(&format!("node '{}' failed", id));
        }
    }
}

/// Run one node with its retry policy. Only transient failures and timeouts
/// retry; a server-requested backoff extends the computed delay.
#[tracing::instrument(
    name = "node.execute",
    skip(executor, node, env, ctx, cancel),
    fields(run_id = %ctx.run_id(), node_id = %node.id, node_type = %node.kind.type_name())
)]
async fn run_attempts(
    executor: Arc<dyn NodeExecutor>,
    node: &Node,
    env: Environment,
    ctx: Arc<RunContext>,
    cancel: CancelToken,
) -> std::result::Result<Value, ExecError> {
    let attempts = node.retry.as_ref().map(|r| r.attempts).unwrap_or(1).max(1);
    let mut last = ExecError::permanent("no attempts were made");

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled {
                reason: cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
            });
        }
        ctx.record_attempt(&node.id);
        if attempt > 1 {
            ctx.log(&node.id, format!("attempt {} of {}", attempt, attempts));
        }

        let exec_ctx = ExecCtx {
            run_id: ctx.run_id().to_string(),
            node_id: node.id.clone(),
            ctx: ctx.clone(),
            env: env.clone(),
            cancel: cancel.clone(),
            timeout: node.timeout,
        };

        let result = match node.timeout {
            Some(node_timeout) => {
                match tokio::time::timeout(
                    node_timeout + TIMEOUT_SLACK,
                    executor.execute(node, &exec_ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ExecError::Timeout {
                        after: node_timeout,
                    }),
                }
            }
            None => executor.execute(node, &exec_ctx).await,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.retryable() || attempt == attempts {
                    return Err(e);
                }
                let delay = match &node.retry {
                    Some(retry) => backoff_delay(retry, attempt, e.retry_after()),
                    None => Duration::ZERO,
                };
                ctx.log(
                    &node.id,
                    format!("transient failure, retrying in {}ms: {}", delay.as_millis(), e),
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(ExecError::Cancelled {
                            reason: cancel
                                .reason()
                                .unwrap_or_else(|| "run cancelled".to_string()),
                        });
                    }
                }
                last = e;
            }
        }
    }
    Err(last)
}

/// Exponential backoff before retry `attempt + 1`.
fn backoff_delay(retry: &RetryConfig, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30) as i32;
    let mut millis =
        (retry.backoff_initial_ms as f64) * retry.backoff_multiplier.powi(exponent);
    millis = millis.min(retry.max_backoff_ms as f64);
    if retry.jitter {
        millis *= 0.9 + 0.2 * rand::random::<f64>();
    }
    let delay = Duration::from_millis(millis.max(0.0) as u64);
    match retry_after {
        Some(requested) => delay.max(requested),
        None => delay,
    }
}

/// Drive a loop: run the body once per item, sequentially, each iteration
/// holding one executor slot. Body outputs collect into a list under the
/// body node's id.
async fn run_loop(
    workflow: Arc<Workflow>,
    controller_idx: usize,
    child_idx: usize,
    registry: Arc<ExecutorRegistry>,
    ctx: Arc<RunContext>,
    cancel: CancelToken,
    sem: Arc<Semaphore>,
) -> std::result::Result<Value, ExecError> {
    let controller = &workflow.nodes[controller_idx];
    let NodeKind::Loop(spec) = &controller.kind else {
        return Err(ExecError::permanent("node is not a loop node"));
    };
    let child = workflow.nodes[child_idx].clone();
    let Some(executor) = registry.get(child.kind.type_name()) else {
        return Err(ExecError::permanent(format!(
            "no executor for type '{}'",
            child.kind.type_name()
        )));
    };

    let items = match template::render_str(&spec.items, &ctx.snapshot_env()) {
        Ok(Value::Array(items)) => items,
        Ok(other) => {
            return Err(ExecError::permanent(format!(
                "items evaluated to {} instead of a list",
                match other {
                    Value::Null => "null",
                    Value::Bool(_) => "a boolean",
                    Value::Number(_) => "a number",
                    Value::String(_) => "a string",
                    Value::Object(_) => "an object",
                    Value::Array(_) => "a list",
                }
            )));
        }
        Err(e) => return Err(ExecError::permanent(e.to_string())),
    };

    if items.is_empty() {
        ctx.set_status(&child.id, NodeStatus::Running);
        ctx.set_output(&child.id, json!([]));
        ctx.set_status(&child.id, NodeStatus::Succeeded);
        return Ok(json!({ "node": child.id, "iterations": 0 }));
    }

    ctx.set_status(&child.id, NodeStatus::Running);
    let mut results = Vec::with_capacity(items.len());
    let total = items.len();

    for (index, item) in items.into_iter().enumerate() {
        let permit = tokio::select! {
            permit = sem.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(ExecError::permanent("executor slots closed")),
            },
            _ = cancel.cancelled() => {
                ctx.set_status(&child.id, NodeStatus::Cancelled);
                return Err(ExecError::Cancelled {
                    reason: cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
                });
            }
        };

        let env = ctx.snapshot_env().with_item(item, index);
        let result = run_attempts(executor.clone(), &child, env, ctx.clone(), cancel.clone()).await;
        drop(permit);

        match result {
            Ok(value) => results.push(value),
            Err(ExecError::Cancelled { reason }) => {
                ctx.set_status(&child.id, NodeStatus::Cancelled);
                return Err(ExecError::Cancelled { reason });
            }
            Err(e) => {
                ctx.set_error(
                    &child.id,
                    NodeError {
                        category: e.category(),
                        message: format!("iteration {} of {}: {}", index + 1, total, e),
                    },
                );
                ctx.set_status(&child.id, NodeStatus::Failed);
                return Err(e);
            }
        }
    }

    ctx.set_output(&child.id, Value::Array(results));
    ctx.set_status(&child.id, NodeStatus::Succeeded);
    Ok(json!({ "node": child.id, "iterations": total }))
}

async fn wait_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[tracing::instrument(
    name = "workflow.run",
    skip(registry, workflow, options, cancel, ctx_slot),
    fields(workflow_name = %workflow.name)
)]
async fn run_inner(
    registry: Arc<ExecutorRegistry>,
    workflow: Arc<Workflow>,
    options: RunOptions,
    cancel: CancelToken,
    ctx_slot: Arc<OnceLock<Arc<RunContext>>>,
) -> Result<RunResult> {
    let inputs = resolve_inputs(&workflow.inputs, &options.inputs)?;
    let run_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();

    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    if let Some(sink) = options.event_sink {
        sinks.push(sink);
    }
    let store = match &options.run_dir {
        Some(dir) => {
            let store = Arc::new(RunStore::create(dir, &run_id)?);
            sinks.push(store.clone());
            Some(store)
        }
        None => None,
    };
    let sink: Arc<dyn EventSink> = match sinks.len() {
        0 => Arc::new(NullSink),
        1 => sinks.remove(0),
        _ => Arc::new(FanoutSink::new(sinks)),
    };

    if let Some(store) = &store {
        store.write_meta(&RunMeta {
            run_id: run_id.clone(),
            workflow: workflow.name.clone(),
            started_at,
            finished_at: None,
            status: None,
        })?;
    }

    let env_vars: Map<String, Value> = options
        .env
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let ctx = Arc::new(RunContext::new(
        run_id.clone(),
        workflow.name.clone(),
        workflow.nodes.iter().map(|n| n.id.clone()),
        Value::Object(inputs),
        Value::Object(env_vars),
        sink.clone(),
        cancel.clone(),
    ));
    let _ = ctx_slot.set(ctx.clone());

    sink.emit(RunEvent::RunStarted {
        run_id: run_id.clone(),
        workflow: workflow.name.clone(),
        at: started_at,
    });
    tracing::info!(run = %run_id, workflow = %workflow.name, "run started");

    let max_parallel = options
        .max_parallel_nodes
        .unwrap_or(workflow.settings.max_parallel_nodes)
        .max(1);
    let timeout = options.timeout.or(workflow.settings.timeout);
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

    let mut sched = Scheduler::new(
        workflow.clone(),
        registry,
        ctx.clone(),
        cancel.clone(),
        max_parallel,
    );
    let sem = sched.sem.clone();
    let mut cancel_seen = false;
    let mut timed_out = false;

    sched.pass();
    while !sched.all_done() {
        if sched.ready.is_empty() && sched.tasks.is_empty() {
            // Nothing in flight and the eligibility pass could not move;
            // only possible once cancellation has swept the stragglers.
            tracing::error!(run = %run_id, "scheduler stalled with work remaining");
            break;
        }
        tokio::select! {
            Ok(permit) = sem.clone().acquire_owned(), if !sched.ready.is_empty() => {
                match sched.next_ready() {
                    Some(idx) => sched.spawn_node(idx, permit),
                    None => drop(permit),
                }
            }
            Some(joined) = sched.tasks.join_next(), if !sched.tasks.is_empty() => {
                match joined {
                    Ok((idx, result)) => sched.complete(idx, result),
                    Err(e) => tracing::error!(run = %run_id, "node task failed to join: {}", e),
                }
            }
            _ = cancel.cancelled(), if !cancel_seen => {
                cancel_seen = true;
                if sched.first_cause.is_none() {
                    sched.first_cause = Some(RunStatus::Cancelled);
                }
            }
            _ = wait_deadline(deadline), if deadline.is_some() && !timed_out => {
                timed_out = true;
                if sched.first_cause.is_none() {
                    sched.first_cause = Some(RunStatus::TimedOut);
                }
                cancel.cancel("workflow timeout");
            }
        }
        sched.pass();
    }

    let nodes = ctx.snapshot_states();
    let any_failed = nodes.values().any(|s| s.status == NodeStatus::Failed);
    let status = match sched.first_cause {
        Some(status) => status,
        None if any_failed => RunStatus::Failed,
        None => RunStatus::Succeeded,
    };
    let first_failure = sched.first_failure.clone().or_else(|| {
        nodes
            .iter()
            .find(|(_, s)| s.status == NodeStatus::Failed)
            .map(|(id, _)| id.clone())
    });
    let finished_at = Utc::now();

    sink.emit(RunEvent::RunFinished {
        run_id: run_id.clone(),
        status,
        at: finished_at,
    });
    if let Some(store) = &store {
        store.write_meta(&RunMeta {
            run_id: run_id.clone(),
            workflow: workflow.name.clone(),
            started_at,
            finished_at: Some(finished_at),
            status: Some(status),
        })?;
    }
    tracing::info!(run = %run_id, status = status.as_str(), "run finished");

    Ok(RunResult {
        run_id,
        status,
        started_at,
        finished_at,
        nodes,
        first_failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(attempts: u32, initial: u64, multiplier: f64, max: u64, jitter: bool) -> RetryConfig {
        RetryConfig {
            attempts,
            backoff_initial_ms: initial,
            backoff_multiplier: multiplier,
            max_backoff_ms: max,
            jitter,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = retry(5, 100, 2.0, 300, false);
        assert_eq!(backoff_delay(&config, 1, None), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2, None), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3, None), Duration::from_millis(300));
        assert_eq!(backoff_delay(&config, 4, None), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let config = retry(3, 1000, 2.0, 60_000, true);
        for _ in 0..50 {
            let d = backoff_delay(&config, 1, None).as_millis() as u64;
            assert!((900..=1100).contains(&d), "jittered delay {} out of band", d);
        }
    }

    #[test]
    fn test_backoff_honors_retry_after() {
        let config = retry(3, 10, 2.0, 1000, false);
        let d = backoff_delay(&config, 1, Some(Duration::from_secs(5)));
        assert_eq!(d, Duration::from_secs(5));
    }
}
