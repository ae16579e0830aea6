//! Execution engine: scheduling, run state, events, and rate limiting.

pub mod context;
pub mod events;
pub mod rate_limiter;
pub mod runner;

pub use context::{
    CancelToken, ErrorCategory, NodeError, NodeState, NodeStatus, RunContext, RunStatus,
};
pub use events::{ChannelSink, EventSink, FanoutSink, NullSink, RunEvent, RunMeta, RunStore};
pub use rate_limiter::{ModelLimits, RateLimitConfig};
pub use runner::{RunHandle, RunOptions, RunResult, Runner};
