//! # flowpilot
//!
//! A workflow automation engine: workflows are YAML documents describing a
//! DAG of typed nodes (shell commands, HTTP requests, Claude API calls,
//! conditionals, parallel groups, loops), wired together with `${...}`
//! template expressions over run inputs and upstream outputs.
//!
//! ```yaml
//! name: daily-report
//! inputs:
//!   region:
//!     type: string
//!     default: us-east
//! nodes:
//!   - id: fetch
//!     type: http
//!     url: "https://api.example.com/orders?region=${inputs.region}"
//!     retry:
//!       attempts: 3
//!   - id: summarize
//!     type: claude-api
//!     prompt: "Summarize these orders: ${outputs.fetch.body}"
//!     depends_on: [fetch]
//!   - id: notify
//!     type: shell
//!     command: "notify-team '${outputs.summarize.text}'"
//!     depends_on: [summarize]
//! ```
//!
//! ```no_run
//! use flowpilot::engine::{RunOptions, Runner};
//! use flowpilot::nodes::{ExecutorConfig, ExecutorRegistry};
//!
//! # async fn example(yaml: &str) -> flowpilot::Result<()> {
//! let registry = ExecutorRegistry::new(ExecutorConfig::default());
//! let workflow = flowpilot::workflow::load(yaml, &registry)?;
//! let result = Runner::new(registry)
//!     .run(workflow, RunOptions::default())
//!     .await?;
//! println!("run {} finished: {:?}", result.run_id, result.status);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod nodes;
pub mod telemetry;
pub mod template;
pub mod workflow;

pub use engine::{RunHandle, RunOptions, RunResult, RunStatus, Runner};
pub use error::{Error, Result};
pub use nodes::{ExecutorConfig, ExecutorRegistry};
pub use workflow::Workflow;
