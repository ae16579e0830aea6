//! Scheduler integration tests: whole workflows through the public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use flowpilot::engine::{ChannelSink, NodeStatus, RunEvent, RunOptions, RunStatus, Runner};
use flowpilot::nodes::{ExecCtx, ExecError, NodeExecutor};
use flowpilot::workflow::{self, Node, Workflow};
use flowpilot::ExecutorRegistry;

fn load(yaml: &str) -> Workflow {
    workflow::load(yaml, &ExecutorRegistry::for_tests()).unwrap()
}

fn runner() -> Runner {
    Runner::new(ExecutorRegistry::for_tests())
}

fn inputs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("inputs must be an object: {:?}", other),
    }
}

fn status_of(result: &flowpilot::engine::RunResult, id: &str) -> NodeStatus {
    result.node(id).unwrap_or_else(|| panic!("no node {}", id)).status
}

#[tokio::test]
async fn test_linear_chain_passes_outputs_in_order() {
    let wf = load(
        r#"
name: linear
nodes:
  - id: a
    type: shell
    command: echo A
  - id: b
    type: shell
    command: "printf '%s' \"${outputs.a.stdout}\""
    depends_on: [a]
  - id: c
    type: shell
    command: echo done
    depends_on: [b]
"#,
    );

    let (sink, mut rx) = ChannelSink::new();
    let options = RunOptions {
        event_sink: Some(Arc::new(sink)),
        ..Default::default()
    };
    let result = runner().run(wf, options).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.output("a").unwrap()["stdout"], "A\n");
    assert_eq!(result.output("b").unwrap()["stdout"], "A\n");

    let mut started = Vec::new();
    let mut first = None;
    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        if first.is_none() {
            first = Some(matches!(event, RunEvent::RunStarted { .. }));
        }
        if let RunEvent::NodeStarted { node, .. } = &event {
            started.push(node.clone());
        }
        last = Some(matches!(event, RunEvent::RunFinished { .. }));
    }
    assert_eq!(started, vec!["a", "b", "c"]);
    assert_eq!(first, Some(true));
    assert_eq!(last, Some(true));
}

#[tokio::test]
async fn test_fan_out_runs_concurrently() {
    let wf = load(
        r#"
name: fan
nodes:
  - id: seed
    type: shell
    command: echo go
  - id: left
    type: shell
    command: sleep 0.3
    depends_on: [seed]
  - id: right
    type: shell
    command: sleep 0.3
    depends_on: [seed]
  - id: join
    type: shell
    command: echo joined
    depends_on: [left, right]
"#,
    );

    let start = Instant::now();
    let result = runner().run(wf, RunOptions::default()).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(status_of(&result, "join"), NodeStatus::Succeeded);
    // left and right overlapped; run in series they would need 600ms.
    assert!(elapsed < Duration::from_millis(550), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_parallelism_cap_serializes_work() {
    let wf = load(
        r#"
name: capped
settings:
  max_parallel_nodes: 1
nodes:
  - id: left
    type: shell
    command: sleep 0.15
  - id: right
    type: shell
    command: sleep 0.15
"#,
    );

    let start = Instant::now();
    let result = runner().run(wf, RunOptions::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_conditional_routes_both_ways() {
    let yaml = r#"
name: branchy
inputs:
  x:
    type: int
    required: true
nodes:
  - id: gate
    type: conditional
    condition: "${inputs.x} > 0"
    then: pos
    else: neg
  - id: pos
    type: shell
    command: echo positive
  - id: neg
    type: shell
    command: echo negative
"#;

    let options = RunOptions {
        inputs: inputs(json!({"x": 3})),
        ..Default::default()
    };
    let result = runner().run(load(yaml), options).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.output("gate").unwrap()["result"], true);
    assert_eq!(status_of(&result, "pos"), NodeStatus::Succeeded);
    assert_eq!(status_of(&result, "neg"), NodeStatus::Skipped);

    let options = RunOptions {
        inputs: inputs(json!({"x": -1})),
        ..Default::default()
    };
    let result = runner().run(load(yaml), options).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(status_of(&result, "pos"), NodeStatus::Skipped);
    assert_eq!(status_of(&result, "neg"), NodeStatus::Succeeded);
}

/// Fails transiently a fixed number of times, then succeeds.
struct FlakyExecutor {
    failures_left: AtomicU32,
}

#[async_trait]
impl NodeExecutor for FlakyExecutor {
    fn node_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _node: &Node, _ctx: &ExecCtx) -> Result<Value, ExecError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ExecError::transient("synthetic outage"));
        }
        Ok(json!({"ok": true}))
    }
}

#[tokio::test]
async fn test_transient_failures_retry_then_recover() {
    let mut registry = ExecutorRegistry::for_tests();
    registry.register(Arc::new(FlakyExecutor {
        failures_left: AtomicU32::new(2),
    }));

    let yaml = r#"
name: wobbly
nodes:
  - id: wobble
    type: flaky
    retry:
      attempts: 3
      backoff_initial_ms: 10
      backoff_multiplier: 2.0
      jitter: false
"#;
    let wf = workflow::load(yaml, &registry).unwrap();

    let start = Instant::now();
    let result = Runner::new(registry)
        .run(wf, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    let node = result.node("wobble").unwrap();
    assert_eq!(node.status, NodeStatus::Succeeded);
    assert_eq!(node.attempts, 3);
    // Two backoffs: 10ms then 20ms.
    assert!(start.elapsed() >= Duration::from_millis(30));
}

/// Always fails permanently.
struct BrokenExecutor;

#[async_trait]
impl NodeExecutor for BrokenExecutor {
    fn node_type(&self) -> &str {
        "broken"
    }

    async fn execute(&self, _node: &Node, _ctx: &ExecCtx) -> Result<Value, ExecError> {
        Err(ExecError::permanent("bad configuration"))
    }
}

#[tokio::test]
async fn test_permanent_failure_does_not_retry() {
    let mut registry = ExecutorRegistry::for_tests();
    registry.register(Arc::new(BrokenExecutor));

    let yaml = r#"
name: hopeless
nodes:
  - id: doomed
    type: broken
    retry:
      attempts: 5
      backoff_initial_ms: 10
"#;
    let wf = workflow::load(yaml, &registry).unwrap();
    let result = Runner::new(registry)
        .run(wf, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    let node = result.node("doomed").unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert_eq!(node.attempts, 1);
    assert_eq!(result.first_failure.as_deref(), Some("doomed"));
}

#[tokio::test]
async fn test_skip_dependents_cascades() {
    let wf = load(
        r#"
name: skippy
nodes:
  - id: a
    type: shell
    command: exit 1
    on_error: skip_dependents
  - id: b
    type: shell
    command: echo b
    depends_on: [a]
  - id: c
    type: shell
    command: echo c
    depends_on: [b]
  - id: d
    type: shell
    command: echo d
"#,
    );

    let result = runner().run(wf, RunOptions::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(status_of(&result, "a"), NodeStatus::Failed);
    assert_eq!(status_of(&result, "b"), NodeStatus::Skipped);
    assert_eq!(status_of(&result, "c"), NodeStatus::Skipped);
    assert_eq!(status_of(&result, "d"), NodeStatus::Succeeded);
    assert_eq!(result.first_failure.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_on_error_continue_exposes_null_output() {
    let wf = load(
        r#"
name: shrug
nodes:
  - id: a
    type: shell
    command: exit 1
    on_error: continue
  - id: b
    type: shell
    command: "printf 'x%sx' \"${outputs.a}\""
    depends_on: [a]
"#,
    );

    let result = runner().run(wf, RunOptions::default()).await.unwrap();
    // The failed node still fails the run even though dependents proceed.
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(status_of(&result, "b"), NodeStatus::Succeeded);
    assert_eq!(result.output("b").unwrap()["stdout"], "xx");
}

#[tokio::test]
async fn test_on_error_fail_cancels_pending_nodes() {
    let wf = load(
        r#"
name: strict
nodes:
  - id: a
    type: shell
    command: exit 1
  - id: b
    type: shell
    command: echo b
    depends_on: [a]
"#,
    );

    let result = runner().run(wf, RunOptions::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(status_of(&result, "a"), NodeStatus::Failed);
    assert_eq!(status_of(&result, "b"), NodeStatus::Cancelled);
}

#[tokio::test]
async fn test_loop_runs_body_per_item() {
    let yaml = r#"
name: loopy
inputs:
  files:
    type: list
    required: true
nodes:
  - id: each
    type: loop
    items: "${inputs.files}"
    node: body
  - id: body
    type: shell
    command: "printf '%s:%s' \"${index}\" \"${item}\""
  - id: after
    type: shell
    command: echo done
    depends_on: [each]
"#;

    let options = RunOptions {
        inputs: inputs(json!({"files": ["x", "y"]})),
        ..Default::default()
    };
    let result = runner().run(load(yaml), options).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.output("each").unwrap()["iterations"], 2);
    let body = result.output("body").unwrap();
    assert_eq!(body[0]["stdout"], "0:x");
    assert_eq!(body[1]["stdout"], "1:y");
    assert_eq!(status_of(&result, "after"), NodeStatus::Succeeded);
}

#[tokio::test]
async fn test_settings_on_error_applies_to_all_nodes() {
    // Workflow-level continue: the failed node's dependent still runs.
    let wf = load(
        r#"
name: lenient
settings:
  on_error: continue
nodes:
  - id: boom
    type: shell
    command: exit 1
  - id: after
    type: shell
    command: echo after
    depends_on: [boom]
"#,
    );

    let result = runner().run(wf, RunOptions::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(status_of(&result, "boom"), NodeStatus::Failed);
    assert_eq!(status_of(&result, "after"), NodeStatus::Succeeded);
}

#[tokio::test]
async fn test_handle_reports_mid_run_status() {
    let wf = load(
        r#"
name: observed
nodes:
  - id: slow
    type: shell
    command: sleep 0.4
"#,
    );

    let handle = runner().spawn(wf, RunOptions::default());
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if handle.status("slow") == Some(NodeStatus::Running) {
            break;
        }
        assert!(Instant::now() < deadline, "slow never reported running");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        handle.snapshot().get("slow").map(|s| s.status),
        Some(NodeStatus::Running)
    );

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(status_of(&result, "slow"), NodeStatus::Succeeded);
}

#[tokio::test]
async fn test_parallel_group_gates_downstream() {
    let wf = load(
        r#"
name: grouped
nodes:
  - id: group
    type: parallel
    nodes: [x, y]
  - id: x
    type: shell
    command: echo x
  - id: y
    type: shell
    command: echo y
  - id: after
    type: shell
    command: echo after
    depends_on: [group]
"#,
    );

    let result = runner().run(wf, RunOptions::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(status_of(&result, "group"), NodeStatus::Succeeded);
    let group = result.output("group").unwrap();
    assert_eq!(group[0]["node"], "x");
    assert_eq!(group[0]["status"], "succeeded");
    assert_eq!(group[0]["output"]["stdout"], "x\n");
    assert_eq!(group[1]["node"], "y");
    assert_eq!(group[1]["status"], "succeeded");
    assert_eq!(status_of(&result, "after"), NodeStatus::Succeeded);
}

#[tokio::test]
async fn test_parallel_group_fails_with_failed_child() {
    // continue on the group so downstream still runs; the group status
    // itself must reflect the failed child.
    let wf = load(
        r#"
name: mixed-group
nodes:
  - id: group
    type: parallel
    nodes: [good, bad]
    on_error: continue
  - id: good
    type: shell
    command: echo ok
  - id: bad
    type: shell
    command: exit 1
    on_error: continue
  - id: after
    type: shell
    command: echo after
    depends_on: [group]
"#,
    );

    let result = runner().run(wf, RunOptions::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(status_of(&result, "good"), NodeStatus::Succeeded);
    assert_eq!(status_of(&result, "bad"), NodeStatus::Failed);
    assert_eq!(status_of(&result, "group"), NodeStatus::Failed);
    assert_eq!(status_of(&result, "after"), NodeStatus::Succeeded);

    let group = result.output("group").unwrap();
    assert_eq!(group[1]["node"], "bad");
    assert_eq!(group[1]["status"], "failed");
}

#[tokio::test]
async fn test_when_clause_skips_quietly() {
    let yaml = r#"
name: gated
inputs:
  go:
    type: bool
    default: false
nodes:
  - id: maybe
    type: shell
    command: echo ran
    when: "${inputs.go}"
  - id: always
    type: shell
    command: echo hi
"#;

    let result = runner()
        .run(load(yaml), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(status_of(&result, "maybe"), NodeStatus::Skipped);
    assert_eq!(status_of(&result, "always"), NodeStatus::Succeeded);
}

#[tokio::test]
async fn test_cancellation_stops_the_run() {
    let wf = load(
        r#"
name: cancellable
nodes:
  - id: slow
    type: shell
    command: sleep 10
  - id: next
    type: shell
    command: echo next
    depends_on: [slow]
"#,
    );

    let handle = runner().spawn(wf, RunOptions::default());
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel("operator requested");

    let start = Instant::now();
    let result = handle.wait().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(status_of(&result, "slow"), NodeStatus::Cancelled);
    assert_eq!(status_of(&result, "next"), NodeStatus::Cancelled);
}

#[tokio::test]
async fn test_workflow_timeout_wins_as_first_cause() {
    let wf = load(
        r#"
name: sluggish
settings:
  timeout: 300ms
nodes:
  - id: slow
    type: shell
    command: sleep 10
"#,
    );

    let start = Instant::now();
    let result = runner().run(wf, RunOptions::default()).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(result.status, RunStatus::TimedOut);
    assert_eq!(status_of(&result, "slow"), NodeStatus::Cancelled);
}

#[tokio::test]
async fn test_node_timeout_is_retryable() {
    let wf = load(
        r#"
name: impatient
nodes:
  - id: slow
    type: shell
    command: sleep 10
    timeout: 100ms
    retry:
      attempts: 2
      backoff_initial_ms: 10
      jitter: false
"#,
    );

    let result = runner().run(wf, RunOptions::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    let node = result.node("slow").unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert_eq!(node.attempts, 2);
}

#[tokio::test]
async fn test_run_store_persists_meta_and_events() {
    let tmp = tempfile::tempdir().unwrap();
    let wf = load(
        r#"
name: stored
nodes:
  - id: only
    type: shell
    command: echo hi
"#,
    );

    let options = RunOptions {
        run_dir: Some(tmp.path().to_path_buf()),
        ..Default::default()
    };
    let result = runner().run(wf, options).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);

    let dir = tmp.path().join(&result.run_id);
    let meta: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join("meta.json")).unwrap()).unwrap();
    assert_eq!(meta["workflow"], "stored");
    assert_eq!(meta["status"], "succeeded");
    assert!(meta["finished_at"].is_string());

    let log = std::fs::read_to_string(dir.join("events.ndjson")).unwrap();
    let events: Vec<Value> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.first().unwrap()["event"], "run_started");
    assert_eq!(events.last().unwrap()["event"], "run_finished");
    assert!(events.iter().any(|e| e["event"] == "node_finished"));
}

#[tokio::test]
async fn test_unknown_input_rejected_before_any_node_runs() {
    let wf = load(
        r#"
name: typo
nodes:
  - id: only
    type: shell
    command: echo hi
"#,
    );

    let options = RunOptions {
        inputs: inputs(json!({"regoin": "us-east"})),
        ..Default::default()
    };
    let err = runner().run(wf, options).await.unwrap_err();
    assert!(err.to_string().contains("regoin"));
}
