//! Workflow definitions: types, YAML parsing, validation, and input
//! resolution.

pub mod inputs;
pub mod parser;
pub mod types;
pub mod validator;

pub use inputs::resolve_inputs;
pub use parser::{parse_workflow, workflow_to_yaml};
pub use types::{
    ClaudeSpec, ConditionalSpec, DelaySpec, FileReadSpec, FileWriteSpec, HttpSpec, InputSpec,
    InputType, LoopSpec, Node, NodeKind, OnError, ParallelSpec, RetryConfig, ShellSpec, Trigger,
    Workflow, WorkflowSettings,
};
pub use validator::{validate_workflow, ValidationWarning};

use crate::error::Result;
use crate::nodes::ExecutorRegistry;

/// Parse and validate a workflow in one step.
///
/// Warnings are logged rather than returned; call [`parse_workflow`] and
/// [`validate_workflow`] separately to inspect them.
pub fn load(yaml: &str, registry: &ExecutorRegistry) -> Result<Workflow> {
    let workflow = parse_workflow(yaml, registry)?;
    for warning in validate_workflow(&workflow, registry)? {
        tracing::warn!(workflow = %workflow.name, "validation: {}", warning);
    }
    Ok(workflow)
}
