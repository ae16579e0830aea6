//! Workflow validation.
//!
//! Runs on a parsed candidate and enforces the structural invariants:
//! name/id shape, uniqueness, reference resolution, acyclicity (with the
//! cycle path in the error), expression syntax, and input-spec sanity.
//! Reachability problems are warnings, not errors.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex_lite::Regex;

use super::types::{NodeKind, Workflow};
use crate::error::{Result, ValidationError};
use crate::nodes::ExecutorRegistry;
use crate::template;

/// Non-fatal validation finding.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationWarning {
    pub node: Option<String>,
    pub message: String,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node {
            Some(node) => write!(f, "node '{}': {}", node, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-z][a-z0-9-]*$").expect("static regex"))
}

/// Validate a parsed workflow.
///
/// Returns warnings on success; the first structural violation is an error.
/// After this passes the workflow is safe to freeze and run.
pub fn validate_workflow(
    workflow: &Workflow,
    registry: &ExecutorRegistry,
) -> Result<Vec<ValidationWarning>> {
    if !name_regex().is_match(&workflow.name) {
        return Err(ValidationError::BadName(workflow.name.clone()).into());
    }

    if workflow.nodes.is_empty() {
        return Err(ValidationError::Empty.into());
    }

    let mut ids = HashSet::new();
    for node in &workflow.nodes {
        if !name_regex().is_match(&node.id) {
            return Err(ValidationError::BadNodeId(node.id.clone()).into());
        }
        if !ids.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateId(node.id.clone()).into());
        }
    }

    check_references(workflow, &ids)?;
    check_input_specs(workflow)?;
    check_expressions(workflow)?;
    check_cycles(workflow)?;

    for node in &workflow.nodes {
        if let Some(executor) = registry.get(node.kind.type_name()) {
            for message in executor.validate_spec(node) {
                return Err(ValidationError::Node {
                    node: node.id.clone(),
                    message,
                }
                .into());
            }
        }
    }

    Ok(collect_warnings(workflow))
}

fn check_references(workflow: &Workflow, ids: &HashSet<&str>) -> Result<()> {
    let dangling = |node: &str, target: &str, field: &str| -> crate::error::Error {
        ValidationError::DanglingRef {
            node: node.to_string(),
            target: target.to_string(),
            field: field.to_string(),
        }
        .into()
    };

    // body id -> owning loop id; a body can belong to only one loop.
    let mut loop_bodies: HashMap<&str, &str> = HashMap::new();
    for node in &workflow.nodes {
        for dep in &node.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(dangling(&node.id, dep, "depends_on"));
            }
        }
        match &node.kind {
            NodeKind::Conditional(spec) => {
                if !ids.contains(spec.then_node.as_str()) {
                    return Err(dangling(&node.id, &spec.then_node, "then"));
                }
                if let Some(else_node) = &spec.else_node {
                    if !ids.contains(else_node.as_str()) {
                        return Err(dangling(&node.id, else_node, "else"));
                    }
                }
            }
            NodeKind::Parallel(spec) => {
                if spec.nodes.is_empty() {
                    return Err(ValidationError::Node {
                        node: node.id.clone(),
                        message: "parallel group must list at least one child".to_string(),
                    }
                    .into());
                }
                for child in &spec.nodes {
                    if !ids.contains(child.as_str()) {
                        return Err(dangling(&node.id, child, "nodes"));
                    }
                    if child == &node.id {
                        return Err(ValidationError::Node {
                            node: node.id.clone(),
                            message: "parallel group cannot contain itself".to_string(),
                        }
                        .into());
                    }
                }
            }
            NodeKind::Loop(spec) => {
                if !ids.contains(spec.node.as_str()) {
                    return Err(dangling(&node.id, &spec.node, "node"));
                }
                if spec.node == node.id {
                    return Err(ValidationError::Node {
                        node: node.id.clone(),
                        message: "loop cannot iterate over itself".to_string(),
                    }
                    .into());
                }
                if let Some(owner) = loop_bodies.insert(spec.node.as_str(), node.id.as_str()) {
                    return Err(ValidationError::Node {
                        node: node.id.clone(),
                        message: format!(
                            "node '{}' is already the body of loop '{}'",
                            spec.node, owner
                        ),
                    }
                    .into());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_input_specs(workflow: &Workflow) -> Result<()> {
    for spec in &workflow.inputs {
        if spec.name.is_empty() {
            return Err(ValidationError::BadInputSpec {
                name: spec.name.clone(),
                message: "input name cannot be empty".to_string(),
            }
            .into());
        }
        if let Some(default) = &spec.default {
            if !spec.input_type.matches(default) {
                return Err(ValidationError::BadInputSpec {
                    name: spec.name.clone(),
                    message: format!(
                        "default value does not match declared type '{}'",
                        spec.input_type.as_str()
                    ),
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Parse (without evaluating) every expression-bearing field to surface
/// syntax errors at validate time.
fn check_expressions(workflow: &Workflow) -> Result<()> {
    let expr_err = |node: &str, field: &str, e: crate::error::TemplateError| {
        crate::error::Error::from(ValidationError::Expression {
            node: node.to_string(),
            field: field.to_string(),
            message: e.to_string(),
        })
    };

    for node in &workflow.nodes {
        if let Some(when) = &node.when {
            template::compile_condition(when).map_err(|e| expr_err(&node.id, "when", e))?;
        }
        match &node.kind {
            NodeKind::Conditional(spec) => {
                template::compile_condition(&spec.condition)
                    .map_err(|e| expr_err(&node.id, "condition", e))?;
            }
            NodeKind::Loop(spec) => {
                template::check_templates(&spec.items)
                    .map_err(|e| expr_err(&node.id, "items", e))?;
            }
            NodeKind::Shell(spec) => {
                template::check_templates(&spec.command)
                    .map_err(|e| expr_err(&node.id, "command", e))?;
                for (key, value) in &spec.env {
                    template::check_templates(value)
                        .map_err(|e| expr_err(&node.id, &format!("env.{}", key), e))?;
                }
                if let Some(cwd) = &spec.cwd {
                    template::check_templates(cwd).map_err(|e| expr_err(&node.id, "cwd", e))?;
                }
            }
            NodeKind::Http(spec) => {
                template::check_templates(&spec.url).map_err(|e| expr_err(&node.id, "url", e))?;
            }
            NodeKind::ClaudeApi(spec) => {
                template::check_templates(&spec.prompt)
                    .map_err(|e| expr_err(&node.id, "prompt", e))?;
                if let Some(system) = &spec.system {
                    template::check_templates(system)
                        .map_err(|e| expr_err(&node.id, "system", e))?;
                }
            }
            NodeKind::FileRead(spec) => {
                template::check_templates(&spec.path).map_err(|e| expr_err(&node.id, "path", e))?;
            }
            NodeKind::FileWrite(spec) => {
                template::check_templates(&spec.path).map_err(|e| expr_err(&node.id, "path", e))?;
                template::check_templates(&spec.content)
                    .map_err(|e| expr_err(&node.id, "content", e))?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Dependency edges for cycle detection: explicit `depends_on` plus the
/// implicit control edges (a branch depends on its conditional, a child on
/// its controller).
fn dependency_edges(workflow: &Workflow) -> HashMap<&str, Vec<&str>> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &workflow.nodes {
        edges
            .entry(node.id.as_str())
            .or_default()
            .extend(node.depends_on.iter().map(|s| s.as_str()));
        match &node.kind {
            NodeKind::Conditional(spec) => {
                edges
                    .entry(spec.then_node.as_str())
                    .or_default()
                    .push(node.id.as_str());
                if let Some(else_node) = &spec.else_node {
                    edges
                        .entry(else_node.as_str())
                        .or_default()
                        .push(node.id.as_str());
                }
            }
            NodeKind::Parallel(spec) => {
                for child in &spec.nodes {
                    edges
                        .entry(child.as_str())
                        .or_default()
                        .push(node.id.as_str());
                }
            }
            NodeKind::Loop(spec) => {
                edges
                    .entry(spec.node.as_str())
                    .or_default()
                    .push(node.id.as_str());
            }
            _ => {}
        }
    }
    edges
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

fn check_cycles(workflow: &Workflow) -> Result<()> {
    let edges = dependency_edges(workflow);
    let mut colors: HashMap<&str, Color> = workflow
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), Color::White))
        .collect();

    fn dfs<'a>(
        id: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        colors: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(id, Color::Gray);
        stack.push(id);

        if let Some(targets) = edges.get(id) {
            for &target in targets {
                match colors.get(target).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        // Back-edge: the cycle is the stack suffix from the
                        // first occurrence of `target`, closed with `target`.
                        let start = stack.iter().position(|&s| s == target).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        path.push(target.to_string());
                        return Some(path);
                    }
                    Color::White => {
                        if let Some(path) = dfs(target, edges, colors, stack) {
                            return Some(path);
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        stack.pop();
        colors.insert(id, Color::Black);
        None
    }

    for node in &workflow.nodes {
        if colors.get(node.id.as_str()) == Some(&Color::White) {
            let mut stack = Vec::new();
            if let Some(path) = dfs(node.id.as_str(), &edges, &mut colors, &mut stack) {
                return Err(ValidationError::Cycle { path }.into());
            }
        }
    }
    Ok(())
}

fn collect_warnings(workflow: &Workflow) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    // Controlled nodes are reached through their controller, not a root.
    let mut controlled: HashSet<&str> = HashSet::new();
    for node in &workflow.nodes {
        match &node.kind {
            NodeKind::Conditional(spec) => {
                controlled.insert(spec.then_node.as_str());
                if let Some(else_node) = &spec.else_node {
                    controlled.insert(else_node.as_str());
                }
            }
            NodeKind::Parallel(spec) => {
                controlled.extend(spec.nodes.iter().map(|s| s.as_str()));
            }
            NodeKind::Loop(spec) => {
                controlled.insert(spec.node.as_str());
            }
            _ => {}
        }
    }

    // Forward closure from the implicit roots over dependency and control
    // edges.
    let mut forward: HashMap<&str, Vec<&str>> = HashMap::new();
    for (dependent, deps) in dependency_edges(workflow) {
        for dep in deps {
            forward.entry(dep).or_default().push(dependent);
        }
    }

    let mut reachable: HashSet<&str> = HashSet::new();
    let mut frontier: Vec<&str> = workflow
        .nodes
        .iter()
        .filter(|n| n.depends_on.is_empty() && !controlled.contains(n.id.as_str()))
        .map(|n| n.id.as_str())
        .collect();
    while let Some(id) = frontier.pop() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(next) = forward.get(id) {
            frontier.extend(next.iter().copied());
        }
    }

    for node in &workflow.nodes {
        if !reachable.contains(node.id.as_str()) {
            warnings.push(ValidationWarning {
                node: Some(node.id.clone()),
                message: "not reachable from any root node; it will never run".to_string(),
            });
        }
    }

    if let Some(workflow_timeout) = workflow.settings.timeout {
        for node in &workflow.nodes {
            if let Some(node_timeout) = node.timeout {
                if node_timeout > workflow_timeout {
                    warnings.push(ValidationWarning {
                        node: Some(node.id.clone()),
                        message: "node timeout exceeds the workflow timeout".to_string(),
                    });
                }
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::workflow::parser::parse_workflow;

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::for_tests()
    }

    fn validate(yaml: &str) -> Result<Vec<ValidationWarning>> {
        let registry = registry();
        let workflow = parse_workflow(yaml, &registry)?;
        validate_workflow(&workflow, &registry)
    }

    #[test]
    fn test_validate_bad_workflow_name() {
        let yaml = r#"
name: "Bad Name"
nodes:
  - id: a
    type: shell
    command: echo hi
"#;
        let err = validate(yaml).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::BadName(_))
        ));
    }

    #[test]
    fn test_validate_bad_node_id() {
        let yaml = r#"
name: test
nodes:
  - id: Not_Okay
    type: shell
    command: echo hi
"#;
        let err = validate(yaml).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::BadNodeId(_))
        ));
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let yaml = r#"
name: test
nodes:
  - id: a
    type: shell
    command: echo hi
  - id: a
    type: shell
    command: echo hi
"#;
        let err = validate(yaml).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_validate_dangling_dependency() {
        let yaml = r#"
name: test
nodes:
  - id: a
    type: shell
    command: echo hi
    depends_on: [ghost]
"#;
        let err = validate(yaml).unwrap_err();
        match err {
            Error::Validation(ValidationError::DanglingRef { target, field, .. }) => {
                assert_eq!(target, "ghost");
                assert_eq!(field, "depends_on");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_validate_cycle_path() {
        let yaml = r#"
name: test
nodes:
  - id: a
    type: shell
    command: echo hi
    depends_on: [b]
  - id: b
    type: shell
    command: echo hi
    depends_on: [a]
"#;
        let err = validate(yaml).unwrap_err();
        match err {
            Error::Validation(ValidationError::Cycle { path }) => {
                assert_eq!(path, vec!["a", "b", "a"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_validate_shared_loop_body() {
        let yaml = r#"
name: test
nodes:
  - id: first
    type: loop
    items: "${inputs.xs}"
    node: body
  - id: second
    type: loop
    items: "${inputs.ys}"
    node: body
  - id: body
    type: shell
    command: echo hi
"#;
        let err = validate(yaml).unwrap_err();
        match err {
            Error::Validation(ValidationError::Node { node, message }) => {
                assert_eq!(node, "second");
                assert!(message.contains("already the body of loop 'first'"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_validate_cycle_through_control_edge() {
        // The conditional's branch edge closes a cycle with depends_on.
        let yaml = r#"
name: test
nodes:
  - id: check
    type: conditional
    condition: "true"
    then: a
    depends_on: [a]
  - id: a
    type: shell
    command: echo hi
"#;
        let err = validate(yaml).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::Cycle { .. })
        ));
    }

    #[test]
    fn test_validate_bad_expression() {
        let yaml = r#"
name: test
nodes:
  - id: a
    type: shell
    command: echo hi
    when: "${inputs.x >}"
"#;
        let err = validate(yaml).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::Expression { .. })
        ));
    }

    #[test]
    fn test_validate_bad_input_default() {
        let yaml = r#"
name: test
inputs:
  limit:
    type: int
    default: "ten"
nodes:
  - id: a
    type: shell
    command: echo hi
"#;
        let err = validate(yaml).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::BadInputSpec { .. })
        ));
    }

    #[test]
    fn test_validate_controlled_children_are_reachable() {
        let yaml = r#"
name: test
nodes:
  - id: root
    type: shell
    command: echo hi
  - id: group
    type: parallel
    nodes: [leaf]
    depends_on: [root]
  - id: leaf
    type: shell
    command: echo leaf
"#;
        let warnings = validate(yaml).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_validate_clean_workflow_no_warnings() {
        let yaml = r#"
name: valid-flow
nodes:
  - id: fetch
    type: http
    url: https://example.com
  - id: report
    type: shell
    command: "echo ${outputs.fetch.status}"
    depends_on: [fetch]
"#;
        let warnings = validate(yaml).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_validate_timeout_warning() {
        let yaml = r#"
name: test
settings:
  timeout: 10s
nodes:
  - id: slow
    type: shell
    command: sleep 1
    timeout: 60s
"#;
        let warnings = validate(yaml).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("exceeds"));
    }
}
