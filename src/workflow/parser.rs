//! Workflow YAML parser.
//!
//! Decodes into an untyped tree first, then shape-checks by hand so every
//! error carries a JSON-Pointer-style path into the document
//! (`/nodes/3/depends_on/1`). Serde derive alone cannot produce those paths.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value as Json;
use serde_yaml::{Mapping, Value as Yaml};

use super::types::{
    format_duration, parse_duration, ClaudeSpec, ConditionalSpec, DelaySpec, FileReadSpec,
    FileWriteSpec, HttpSpec, InputSpec, InputType, LoopSpec, Node, NodeKind, OnError, ParallelSpec,
    RetryConfig, ShellSpec, Trigger, Workflow, WorkflowSettings,
};
use crate::error::{ParseError, ParseErrorKind, Result, SourceLocation};
use crate::nodes::ExecutorRegistry;

type PResult<T> = std::result::Result<T, ParseError>;

/// Parse a workflow document.
///
/// Unknown node types are rejected unless the registry claims them, in which
/// case they become [`NodeKind::Custom`]. The result is a candidate; hand it
/// to [`super::validator::validate_workflow`] before running.
pub fn parse_workflow(yaml: &str, registry: &ExecutorRegistry) -> Result<Workflow> {
    if yaml.trim().is_empty() {
        return Err(ParseError::new(
            ParseErrorKind::Syntax,
            "",
            "empty workflow definition",
        )
        .into());
    }

    let doc: Yaml = serde_yaml::from_str(yaml).map_err(decode_error)?;
    let root = as_map(&doc, "")?;

    let name = req_str(root, "name", "")?.to_string();
    let description = opt_str(root, "description", "")?
        .unwrap_or_default()
        .to_string();
    let version = match get(root, "version") {
        Some(v) => u32::try_from(as_u64(v, "/version")?).map_err(|_| {
            ParseError::new(
                ParseErrorKind::TypeMismatch,
                "/version",
                "version does not fit in a 32-bit integer",
            )
        })?,
        None => 1,
    };

    let inputs = match get(root, "inputs") {
        Some(v) => parse_inputs(v)?,
        None => Vec::new(),
    };

    let triggers = match get(root, "triggers") {
        Some(v) => parse_triggers(v)?,
        None => Vec::new(),
    };

    let settings = match get(root, "settings") {
        Some(v) => parse_settings(v)?,
        None => WorkflowSettings::default(),
    };

    let nodes_val = get(root, "nodes").ok_or_else(|| {
        ParseError::new(ParseErrorKind::MissingField, "", "missing required key 'nodes'")
    })?;
    let nodes_seq = as_seq(nodes_val, "/nodes")?;
    let mut nodes = Vec::with_capacity(nodes_seq.len());
    for (i, entry) in nodes_seq.iter().enumerate() {
        nodes.push(parse_node(entry, i, settings.on_error, registry)?);
    }

    Ok(Workflow {
        name,
        description,
        version,
        inputs,
        triggers,
        nodes,
        settings,
    })
}

fn decode_error(e: serde_yaml::Error) -> ParseError {
    let msg = e.to_string();
    let kind = if msg.contains("duplicate entry") {
        ParseErrorKind::DuplicateKey
    } else {
        ParseErrorKind::Syntax
    };
    let mut err = ParseError::new(kind, "", msg);
    if let Some(loc) = e.location() {
        err = err.with_location(SourceLocation {
            line: loc.line(),
            column: loc.column(),
        });
    }
    err
}

fn parse_inputs(v: &Yaml) -> PResult<Vec<InputSpec>> {
    let map = as_map(v, "/inputs")?;
    let mut specs = Vec::with_capacity(map.len());
    for (key, spec_val) in map {
        let name = key_str(key, "/inputs")?;
        let path = format!("/inputs/{}", name);
        let spec_map = as_map(spec_val, &path)?;

        let ty_path = format!("{}/type", path);
        let ty_str = req_str(spec_map, "type", &path)?;
        let input_type = InputType::parse(ty_str).ok_or_else(|| {
            ParseError::new(
                ParseErrorKind::TypeMismatch,
                &ty_path,
                format!(
                    "unknown input type '{}' (expected string, int, float, bool, list, object)",
                    ty_str
                ),
            )
        })?;

        let required = match get(spec_map, "required") {
            Some(v) => as_bool(v, &format!("{}/required", path))?,
            None => false,
        };
        let default = match get(spec_map, "default") {
            Some(v) => Some(yaml_to_json(v, &format!("{}/default", path))?),
            None => None,
        };
        let description = opt_str(spec_map, "description", &path)?
            .unwrap_or_default()
            .to_string();

        specs.push(InputSpec {
            name: name.to_string(),
            input_type,
            required,
            default,
            description: description.to_string(),
        });
    }
    Ok(specs)
}

fn parse_triggers(v: &Yaml) -> PResult<Vec<Trigger>> {
    let seq = as_seq(v, "/triggers")?;
    let mut triggers = Vec::with_capacity(seq.len());
    for (i, entry) in seq.iter().enumerate() {
        let path = format!("/triggers/{}", i);
        let map = as_map(entry, &path)?;
        let trigger_type = req_str(map, "type", &path)?.to_string();
        let mut options = serde_json::Map::new();
        for (key, val) in map {
            let key = key_str(key, &path)?;
            if key == "type" {
                continue;
            }
            options.insert(
                key.to_string(),
                yaml_to_json(val, &format!("{}/{}", path, key))?,
            );
        }
        triggers.push(Trigger {
            trigger_type,
            options,
        });
    }
    Ok(triggers)
}

fn parse_settings(v: &Yaml) -> PResult<WorkflowSettings> {
    let path = "/settings";
    let map = as_map(v, path)?;
    let mut settings = WorkflowSettings::default();

    if let Some(v) = get(map, "timeout") {
        settings.timeout = Some(duration_field(v, "/settings/timeout")?);
    }
    if let Some(v) = get(map, "max_parallel_nodes") {
        let n = as_u64(v, "/settings/max_parallel_nodes")?;
        if n == 0 {
            return Err(ParseError::new(
                ParseErrorKind::TypeMismatch,
                "/settings/max_parallel_nodes",
                "must be at least 1",
            ));
        }
        settings.max_parallel_nodes = n as usize;
    }
    if let Some(v) = get(map, "on_error") {
        settings.on_error = on_error_field(v, "/settings/on_error")?;
    }
    Ok(settings)
}

fn parse_node(
    entry: &Yaml,
    index: usize,
    default_on_error: OnError,
    registry: &ExecutorRegistry,
) -> PResult<Node> {
    let path = format!("/nodes/{}", index);
    let map = as_map(entry, &path)?;

    let id = req_str(map, "id", &path)?.to_string();
    let type_name = req_str(map, "type", &path)?;

    let depends_on = match get(map, "depends_on") {
        Some(v) => {
            let seq = as_seq(v, &format!("{}/depends_on", path))?;
            let mut deps = Vec::with_capacity(seq.len());
            for (j, dep) in seq.iter().enumerate() {
                deps.push(as_str(dep, &format!("{}/depends_on/{}", path, j))?.to_string());
            }
            deps
        }
        None => Vec::new(),
    };

    let when = opt_str(map, "when", &path)?.map(|s| s.to_string());

    let timeout = match get(map, "timeout") {
        Some(v) => Some(duration_field(v, &format!("{}/timeout", path))?),
        None => None,
    };

    let retry = match get(map, "retry") {
        Some(v) => {
            let retry_path = format!("{}/retry", path);
            as_map(v, &retry_path)?;
            let retry: RetryConfig = serde_yaml::from_value(v.clone()).map_err(|e| {
                ParseError::new(ParseErrorKind::TypeMismatch, &retry_path, e.to_string())
            })?;
            if retry.attempts == 0 {
                return Err(ParseError::new(
                    ParseErrorKind::TypeMismatch,
                    format!("{}/attempts", retry_path),
                    "attempts must be at least 1",
                ));
            }
            Some(retry)
        }
        None => None,
    };

    // Nodes without their own policy inherit the workflow-level default.
    let on_error = match get(map, "on_error") {
        Some(v) => on_error_field(v, &format!("{}/on_error", path))?,
        None => default_on_error,
    };

    let priority = match get(map, "priority") {
        Some(v) => as_i64(v, &format!("{}/priority", path))? as i32,
        None => 0,
    };

    let kind = parse_kind(type_name, map, &path, registry)?;

    Ok(Node {
        id,
        kind,
        depends_on,
        when,
        timeout,
        retry,
        on_error,
        priority,
    })
}

fn parse_kind(
    type_name: &str,
    map: &Mapping,
    path: &str,
    registry: &ExecutorRegistry,
) -> PResult<NodeKind> {
    match type_name {
        "shell" => {
            let command = req_str(map, "command", path)?.to_string();
            let env = match get(map, "env") {
                Some(v) => string_map(v, &format!("{}/env", path))?,
                None => BTreeMap::new(),
            };
            let cwd = opt_str(map, "cwd", path)?.map(|s| s.to_string());
            let retry_on_nonzero_exit = match get(map, "retry_on_nonzero_exit") {
                Some(v) => as_bool(v, &format!("{}/retry_on_nonzero_exit", path))?,
                None => false,
            };
            Ok(NodeKind::Shell(ShellSpec {
                command,
                env,
                cwd,
                retry_on_nonzero_exit,
            }))
        }
        "http" => {
            let method = opt_str(map, "method", path)?
                .unwrap_or("GET")
                .to_uppercase();
            let url = req_str(map, "url", path)?.to_string();
            let headers = match get(map, "headers") {
                Some(v) => string_map(v, &format!("{}/headers", path))?,
                None => BTreeMap::new(),
            };
            let body = match get(map, "body") {
                Some(v) => Some(yaml_to_json(v, &format!("{}/body", path))?),
                None => None,
            };
            let expect_status = match get(map, "expect_status") {
                Some(v) => {
                    let seq = as_seq(v, &format!("{}/expect_status", path))?;
                    let mut codes = Vec::with_capacity(seq.len());
                    for (j, code) in seq.iter().enumerate() {
                        let code_path = format!("{}/expect_status/{}", path, j);
                        let n = as_u64(code, &code_path)?;
                        if !(100..=599).contains(&n) {
                            return Err(ParseError::new(
                                ParseErrorKind::TypeMismatch,
                                code_path,
                                "expected an HTTP status code",
                            ));
                        }
                        codes.push(n as u16);
                    }
                    codes
                }
                None => Vec::new(),
            };
            Ok(NodeKind::Http(HttpSpec {
                method,
                url,
                headers,
                body,
                expect_status,
            }))
        }
        "claude-api" => {
            let model = opt_str(map, "model", path)?
                .unwrap_or("claude-sonnet-4-20250514")
                .to_string();
            let prompt = req_str(map, "prompt", path)?.to_string();
            let system = opt_str(map, "system", path)?.map(|s| s.to_string());
            let max_tokens = match get(map, "max_tokens") {
                Some(v) => as_u64(v, &format!("{}/max_tokens", path))? as u32,
                None => 4096,
            };
            let temperature = match get(map, "temperature") {
                Some(v) => Some(as_f64(v, &format!("{}/temperature", path))?),
                None => None,
            };
            let tools = match get(map, "tools") {
                Some(v) => match yaml_to_json(v, &format!("{}/tools", path))? {
                    Json::Array(items) => items,
                    _ => {
                        return Err(ParseError::new(
                            ParseErrorKind::TypeMismatch,
                            format!("{}/tools", path),
                            "expected a sequence",
                        ))
                    }
                },
                None => Vec::new(),
            };
            Ok(NodeKind::ClaudeApi(ClaudeSpec {
                model,
                prompt,
                system,
                max_tokens,
                temperature,
                tools,
            }))
        }
        "conditional" => {
            let condition = req_str(map, "condition", path)?.to_string();
            let then_node = req_str(map, "then", path)?.to_string();
            let else_node = opt_str(map, "else", path)?.map(|s| s.to_string());
            Ok(NodeKind::Conditional(ConditionalSpec {
                condition,
                then_node,
                else_node,
            }))
        }
        "parallel" => {
            let nodes_path = format!("{}/nodes", path);
            let v = get(map, "nodes").ok_or_else(|| {
                ParseError::new(
                    ParseErrorKind::MissingField,
                    path,
                    "missing required key 'nodes'",
                )
            })?;
            let seq = as_seq(v, &nodes_path)?;
            let mut children = Vec::with_capacity(seq.len());
            for (j, child) in seq.iter().enumerate() {
                children.push(as_str(child, &format!("{}/{}", nodes_path, j))?.to_string());
            }
            Ok(NodeKind::Parallel(ParallelSpec { nodes: children }))
        }
        "loop" => {
            let items = req_str(map, "items", path)?.to_string();
            let node = req_str(map, "node", path)?.to_string();
            Ok(NodeKind::Loop(LoopSpec { items, node }))
        }
        "delay" => {
            let v = get(map, "duration").ok_or_else(|| {
                ParseError::new(
                    ParseErrorKind::MissingField,
                    path,
                    "missing required key 'duration'",
                )
            })?;
            let duration = duration_field(v, &format!("{}/duration", path))?;
            Ok(NodeKind::Delay(DelaySpec { duration }))
        }
        "file-read" => {
            let file_path = req_str(map, "path", path)?.to_string();
            Ok(NodeKind::FileRead(FileReadSpec { path: file_path }))
        }
        "file-write" => {
            let file_path = req_str(map, "path", path)?.to_string();
            let content = req_str(map, "content", path)?.to_string();
            let append = match get(map, "append") {
                Some(v) => as_bool(v, &format!("{}/append", path))?,
                None => false,
            };
            Ok(NodeKind::FileWrite(FileWriteSpec {
                path: file_path,
                content,
                append,
            }))
        }
        other if registry.has(other) => {
            let config = match get(map, "config") {
                Some(v) => yaml_to_json(v, &format!("{}/config", path))?,
                None => Json::Object(Default::default()),
            };
            Ok(NodeKind::Custom {
                type_name: other.to_string(),
                config,
            })
        }
        other => Err(ParseError::new(
            ParseErrorKind::UnknownNodeType,
            format!("{}/type", path),
            format!("unknown node type '{}'", other),
        )),
    }
}

fn duration_field(v: &Yaml, path: &str) -> PResult<Duration> {
    match v {
        Yaml::Number(n) => {
            if let Some(secs) = n.as_u64() {
                return Ok(Duration::from_secs(secs));
            }
            Err(ParseError::new(
                ParseErrorKind::BadDuration,
                path,
                "expected a non-negative integer number of seconds",
            ))
        }
        Yaml::String(s) => parse_duration(s).ok_or_else(|| {
            ParseError::new(
                ParseErrorKind::BadDuration,
                path,
                format!("unparseable duration '{}' (try \"30s\", \"5m\", \"1h\")", s),
            )
        }),
        _ => Err(ParseError::new(
            ParseErrorKind::BadDuration,
            path,
            "expected a duration string or integer seconds",
        )),
    }
}

fn on_error_field(v: &Yaml, path: &str) -> PResult<OnError> {
    let s = as_str(v, path)?;
    OnError::parse(s).ok_or_else(|| {
        ParseError::new(
            ParseErrorKind::TypeMismatch,
            path,
            format!(
                "unknown on_error policy '{}' (expected fail, continue, skip_dependents)",
                s
            ),
        )
    })
}

fn string_map(v: &Yaml, path: &str) -> PResult<BTreeMap<String, String>> {
    let map = as_map(v, path)?;
    let mut out = BTreeMap::new();
    for (key, val) in map {
        let key = key_str(key, path)?;
        let val = as_str(val, &format!("{}/{}", path, key))?;
        out.insert(key.to_string(), val.to_string());
    }
    Ok(out)
}

// --- untyped-tree helpers ---------------------------------------------------

fn get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Yaml> {
    map.get(&Yaml::String(key.to_string()))
}

fn type_err(path: &str, message: impl Into<String>) -> ParseError {
    ParseError::new(ParseErrorKind::TypeMismatch, path, message)
}

fn as_map<'a>(v: &'a Yaml, path: &str) -> PResult<&'a Mapping> {
    v.as_mapping()
        .ok_or_else(|| type_err(path, "expected a mapping"))
}

fn as_seq<'a>(v: &'a Yaml, path: &str) -> PResult<&'a Vec<Yaml>> {
    v.as_sequence()
        .ok_or_else(|| type_err(path, "expected a sequence"))
}

fn as_str<'a>(v: &'a Yaml, path: &str) -> PResult<&'a str> {
    v.as_str().ok_or_else(|| type_err(path, "expected a string"))
}

fn as_bool(v: &Yaml, path: &str) -> PResult<bool> {
    v.as_bool()
        .ok_or_else(|| type_err(path, "expected a boolean"))
}

fn as_u64(v: &Yaml, path: &str) -> PResult<u64> {
    v.as_u64()
        .ok_or_else(|| type_err(path, "expected a non-negative integer"))
}

fn as_i64(v: &Yaml, path: &str) -> PResult<i64> {
    v.as_i64()
        .ok_or_else(|| type_err(path, "expected an integer"))
}

fn as_f64(v: &Yaml, path: &str) -> PResult<f64> {
    v.as_f64().ok_or_else(|| type_err(path, "expected a number"))
}

fn key_str<'a>(key: &'a Yaml, path: &str) -> PResult<&'a str> {
    key.as_str()
        .ok_or_else(|| type_err(path, "mapping keys must be strings"))
}

fn req_str<'a>(map: &'a Mapping, key: &str, path: &str) -> PResult<&'a str> {
    match get(map, key) {
        Some(v) => as_str(v, &format!("{}/{}", path, key)),
        None => Err(ParseError::new(
            ParseErrorKind::MissingField,
            path,
            format!("missing required key '{}'", key),
        )),
    }
}

fn opt_str<'a>(map: &'a Mapping, key: &str, path: &str) -> PResult<Option<&'a str>> {
    match get(map, key) {
        Some(v) => Ok(Some(as_str(v, &format!("{}/{}", path, key))?)),
        None => Ok(None),
    }
}

fn yaml_to_json(v: &Yaml, path: &str) -> PResult<Json> {
    match v {
        Yaml::Null => Ok(Json::Null),
        Yaml::Bool(b) => Ok(Json::Bool(*b)),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Json::from(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Json::from(u))
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(Json::Number)
                    .ok_or_else(|| type_err(path, "non-finite number"))
            } else {
                Err(type_err(path, "unrepresentable number"))
            }
        }
        Yaml::String(s) => Ok(Json::String(s.clone())),
        Yaml::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(yaml_to_json(item, &format!("{}/{}", path, i))?);
            }
            Ok(Json::Array(out))
        }
        Yaml::Mapping(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                let key = key_str(key, path)?;
                out.insert(
                    key.to_string(),
                    yaml_to_json(val, &format!("{}/{}", path, key))?,
                );
            }
            Ok(Json::Object(out))
        }
        Yaml::Tagged(_) => Err(type_err(path, "YAML tags are not supported")),
    }
}

// --- serialization ----------------------------------------------------------

/// Serialize a workflow back to canonical YAML.
///
/// Parse ∘ serialize is the identity modulo comments and key order.
pub fn workflow_to_yaml(workflow: &Workflow) -> Result<String> {
    let mut root = Mapping::new();
    root.insert(ys("name"), ys(&workflow.name));
    if !workflow.description.is_empty() {
        root.insert(ys("description"), ys(&workflow.description));
    }
    root.insert(ys("version"), Yaml::from(workflow.version as u64));

    if !workflow.inputs.is_empty() {
        let mut inputs = Mapping::new();
        for spec in &workflow.inputs {
            let mut m = Mapping::new();
            m.insert(ys("type"), ys(spec.input_type.as_str()));
            if spec.required {
                m.insert(ys("required"), Yaml::Bool(true));
            }
            if let Some(default) = &spec.default {
                m.insert(ys("default"), json_to_yaml(default));
            }
            if !spec.description.is_empty() {
                m.insert(ys("description"), ys(&spec.description));
            }
            inputs.insert(ys(&spec.name), Yaml::Mapping(m));
        }
        root.insert(ys("inputs"), Yaml::Mapping(inputs));
    }

    if !workflow.triggers.is_empty() {
        let mut triggers = Vec::new();
        for trigger in &workflow.triggers {
            let mut m = Mapping::new();
            m.insert(ys("type"), ys(&trigger.trigger_type));
            for (key, val) in &trigger.options {
                m.insert(ys(key), json_to_yaml(val));
            }
            triggers.push(Yaml::Mapping(m));
        }
        root.insert(ys("triggers"), Yaml::Sequence(triggers));
    }

    if workflow.settings != WorkflowSettings::default() {
        let mut m = Mapping::new();
        if let Some(timeout) = workflow.settings.timeout {
            m.insert(ys("timeout"), ys(&format_duration(timeout)));
        }
        if workflow.settings.max_parallel_nodes != super::types::default_max_parallel() {
            m.insert(
                ys("max_parallel_nodes"),
                Yaml::from(workflow.settings.max_parallel_nodes as u64),
            );
        }
        if workflow.settings.on_error != OnError::Fail {
            m.insert(ys("on_error"), ys(workflow.settings.on_error.as_str()));
        }
        root.insert(ys("settings"), Yaml::Mapping(m));
    }

    let nodes: Vec<Yaml> = workflow
        .nodes
        .iter()
        .map(|n| node_to_yaml(n, workflow.settings.on_error))
        .collect();
    root.insert(ys("nodes"), Yaml::Sequence(nodes));

    Ok(serde_yaml::to_string(&Yaml::Mapping(root))?)
}

fn node_to_yaml(node: &Node, default_on_error: OnError) -> Yaml {
    let mut m = Mapping::new();
    m.insert(ys("id"), ys(&node.id));
    m.insert(ys("type"), ys(node.kind.type_name()));

    match &node.kind {
        NodeKind::Shell(spec) => {
            m.insert(ys("command"), ys(&spec.command));
            if !spec.env.is_empty() {
                let mut env = Mapping::new();
                for (k, v) in &spec.env {
                    env.insert(ys(k), ys(v));
                }
                m.insert(ys("env"), Yaml::Mapping(env));
            }
            if let Some(cwd) = &spec.cwd {
                m.insert(ys("cwd"), ys(cwd));
            }
            if spec.retry_on_nonzero_exit {
                m.insert(ys("retry_on_nonzero_exit"), Yaml::Bool(true));
            }
        }
        NodeKind::Http(spec) => {
            m.insert(ys("method"), ys(&spec.method));
            m.insert(ys("url"), ys(&spec.url));
            if !spec.headers.is_empty() {
                let mut headers = Mapping::new();
                for (k, v) in &spec.headers {
                    headers.insert(ys(k), ys(v));
                }
                m.insert(ys("headers"), Yaml::Mapping(headers));
            }
            if let Some(body) = &spec.body {
                m.insert(ys("body"), json_to_yaml(body));
            }
            if !spec.expect_status.is_empty() {
                m.insert(
                    ys("expect_status"),
                    Yaml::Sequence(
                        spec.expect_status
                            .iter()
                            .map(|c| Yaml::from(*c as u64))
                            .collect(),
                    ),
                );
            }
        }
        NodeKind::ClaudeApi(spec) => {
            m.insert(ys("model"), ys(&spec.model));
            m.insert(ys("prompt"), ys(&spec.prompt));
            if let Some(system) = &spec.system {
                m.insert(ys("system"), ys(system));
            }
            m.insert(ys("max_tokens"), Yaml::from(spec.max_tokens as u64));
            if let Some(t) = spec.temperature {
                m.insert(ys("temperature"), Yaml::from(t));
            }
            if !spec.tools.is_empty() {
                m.insert(
                    ys("tools"),
                    Yaml::Sequence(spec.tools.iter().map(json_to_yaml).collect()),
                );
            }
        }
        NodeKind::Conditional(spec) => {
            m.insert(ys("condition"), ys(&spec.condition));
            m.insert(ys("then"), ys(&spec.then_node));
            if let Some(else_node) = &spec.else_node {
                m.insert(ys("else"), ys(else_node));
            }
        }
        NodeKind::Parallel(spec) => {
            m.insert(
                ys("nodes"),
                Yaml::Sequence(spec.nodes.iter().map(|n| ys(n)).collect()),
            );
        }
        NodeKind::Loop(spec) => {
            m.insert(ys("items"), ys(&spec.items));
            m.insert(ys("node"), ys(&spec.node));
        }
        NodeKind::Delay(spec) => {
            m.insert(ys("duration"), ys(&format_duration(spec.duration)));
        }
        NodeKind::FileRead(spec) => {
            m.insert(ys("path"), ys(&spec.path));
        }
        NodeKind::FileWrite(spec) => {
            m.insert(ys("path"), ys(&spec.path));
            m.insert(ys("content"), ys(&spec.content));
            if spec.append {
                m.insert(ys("append"), Yaml::Bool(true));
            }
        }
        NodeKind::Custom { config, .. } => {
            if !config.is_null() {
                m.insert(ys("config"), json_to_yaml(config));
            }
        }
    }

    if !node.depends_on.is_empty() {
        m.insert(
            ys("depends_on"),
            Yaml::Sequence(node.depends_on.iter().map(|d| ys(d)).collect()),
        );
    }
    if let Some(when) = &node.when {
        m.insert(ys("when"), ys(when));
    }
    if let Some(timeout) = node.timeout {
        m.insert(ys("timeout"), ys(&format_duration(timeout)));
    }
    if let Some(retry) = &node.retry {
        let mut r = Mapping::new();
        r.insert(ys("attempts"), Yaml::from(retry.attempts as u64));
        r.insert(
            ys("backoff_initial_ms"),
            Yaml::from(retry.backoff_initial_ms),
        );
        r.insert(
            ys("backoff_multiplier"),
            Yaml::from(retry.backoff_multiplier),
        );
        r.insert(ys("max_backoff_ms"), Yaml::from(retry.max_backoff_ms));
        r.insert(ys("jitter"), Yaml::Bool(retry.jitter));
        m.insert(ys("retry"), Yaml::Mapping(r));
    }
    if node.on_error != default_on_error {
        m.insert(ys("on_error"), ys(node.on_error.as_str()));
    }
    if node.priority != 0 {
        m.insert(ys("priority"), Yaml::from(node.priority as i64));
    }

    Yaml::Mapping(m)
}

fn ys(s: &str) -> Yaml {
    Yaml::String(s.to_string())
}

fn json_to_yaml(v: &Json) -> Yaml {
    match v {
        Json::Null => Yaml::Null,
        Json::Bool(b) => Yaml::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Yaml::from(i)
            } else if let Some(u) = n.as_u64() {
                Yaml::from(u)
            } else {
                Yaml::from(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Yaml::String(s.clone()),
        Json::Array(items) => Yaml::Sequence(items.iter().map(json_to_yaml).collect()),
        Json::Object(map) => {
            let mut out = Mapping::new();
            for (k, val) in map {
                out.insert(ys(k), json_to_yaml(val));
            }
            Yaml::Mapping(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::nodes::ExecutorRegistry;

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::for_tests()
    }

    fn parse(yaml: &str) -> Result<Workflow> {
        parse_workflow(yaml, &registry())
    }

    #[test]
    fn test_parse_simple_workflow() {
        let yaml = r#"
name: nightly-report
description: Build the nightly report

nodes:
  - id: build
    type: shell
    command: make report

  - id: upload
    type: http
    method: post
    url: https://api.example.com/reports
    depends_on: [build]
"#;
        let workflow = parse(yaml).unwrap();
        assert_eq!(workflow.name, "nightly-report");
        assert_eq!(workflow.version, 1);
        assert_eq!(workflow.nodes.len(), 2);
        assert_eq!(workflow.nodes[1].depends_on, vec!["build"]);
        match &workflow.nodes[1].kind {
            NodeKind::Http(spec) => assert_eq!(spec.method, "POST"),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_parse_inputs_ordered() {
        let yaml = r#"
name: with-inputs
inputs:
  day:
    type: string
    required: true
  limit:
    type: int
    default: 10
    description: Max rows
nodes:
  - id: run
    type: shell
    command: echo hi
"#;
        let workflow = parse(yaml).unwrap();
        assert_eq!(workflow.inputs.len(), 2);
        assert_eq!(workflow.inputs[0].name, "day");
        assert!(workflow.inputs[0].required);
        assert_eq!(workflow.inputs[1].name, "limit");
        assert_eq!(workflow.inputs[1].default, Some(serde_json::json!(10)));
    }

    #[test]
    fn test_parse_version_out_of_range() {
        let yaml = r#"
name: test
version: 5000000000
nodes:
  - id: a
    type: shell
    command: echo hi
"#;
        let err = parse(yaml).unwrap_err();
        match err {
            Error::Parse(e) => {
                assert_eq!(e.kind, ParseErrorKind::TypeMismatch);
                assert_eq!(e.path, "/version");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_settings_on_error_is_node_default() {
        let yaml = r#"
name: lenient
settings:
  on_error: continue
nodes:
  - id: a
    type: shell
    command: echo hi
  - id: b
    type: shell
    command: echo hi
    on_error: fail
"#;
        let workflow = parse(yaml).unwrap();
        assert_eq!(workflow.settings.on_error, OnError::Continue);
        assert_eq!(workflow.nodes[0].on_error, OnError::Continue);
        assert_eq!(workflow.nodes[1].on_error, OnError::Fail);

        // An explicit policy stricter than the default survives round-trip.
        let serialized = workflow_to_yaml(&workflow).unwrap();
        let back = parse(&serialized).unwrap();
        assert_eq!(workflow, back);
    }

    #[test]
    fn test_parse_durations() {
        let yaml = r#"
name: timed
settings:
  timeout: 5m
nodes:
  - id: run
    type: shell
    command: sleep 1
    timeout: 30s
  - id: pause
    type: delay
    duration: 250ms
    depends_on: [run]
"#;
        let workflow = parse(yaml).unwrap();
        assert_eq!(workflow.settings.timeout, Some(Duration::from_secs(300)));
        assert_eq!(workflow.nodes[0].timeout, Some(Duration::from_secs(30)));
        match &workflow.nodes[1].kind {
            NodeKind::Delay(spec) => assert_eq!(spec.duration, Duration::from_millis(250)),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_parse_bad_duration_has_path() {
        let yaml = r#"
name: timed
nodes:
  - id: run
    type: shell
    command: echo hi
    timeout: soon
"#;
        let err = parse(yaml).unwrap_err();
        let Error::Parse(parse_err) = err else {
            panic!("expected parse error")
        };
        assert_eq!(parse_err.kind, ParseErrorKind::BadDuration);
        assert_eq!(parse_err.path, "/nodes/0/timeout");
    }

    #[test]
    fn test_parse_unknown_node_type() {
        let yaml = r#"
name: test
nodes:
  - id: x
    type: teleport
"#;
        let err = parse(yaml).unwrap_err();
        let Error::Parse(parse_err) = err else {
            panic!("expected parse error")
        };
        assert_eq!(parse_err.kind, ParseErrorKind::UnknownNodeType);
        assert_eq!(parse_err.path, "/nodes/0/type");
    }

    #[test]
    fn test_parse_bad_dependency_entry_path() {
        let yaml = r#"
name: test
nodes:
  - id: a
    type: shell
    command: echo hi
  - id: b
    type: shell
    command: echo hi
    depends_on: [a, 3]
"#;
        let err = parse(yaml).unwrap_err();
        let Error::Parse(parse_err) = err else {
            panic!("expected parse error")
        };
        assert_eq!(parse_err.path, "/nodes/1/depends_on/1");
    }

    #[test]
    fn test_parse_duplicate_key() {
        let yaml = r#"
name: test
name: test-again
nodes:
  - id: a
    type: shell
    command: echo hi
"#;
        let err = parse(yaml).unwrap_err();
        let Error::Parse(parse_err) = err else {
            panic!("expected parse error")
        };
        assert_eq!(parse_err.kind, ParseErrorKind::DuplicateKey);
    }

    #[test]
    fn test_parse_empty_and_invalid() {
        assert!(parse("").is_err());
        assert!(parse("name: [broken").is_err());
    }

    #[test]
    fn test_parse_missing_name() {
        let yaml = r#"
nodes:
  - id: a
    type: shell
    command: echo hi
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("'name'"));
    }

    #[test]
    fn test_parse_conditional_and_controllers() {
        let yaml = r#"
name: branchy
nodes:
  - id: check
    type: conditional
    condition: "${inputs.x} > 0"
    then: yes-path
    else: no-path
  - id: yes-path
    type: shell
    command: echo yes
  - id: no-path
    type: shell
    command: echo no
  - id: group
    type: parallel
    nodes: [yes-path, no-path]
  - id: each
    type: loop
    items: "${inputs.files}"
    node: yes-path
"#;
        let workflow = parse(yaml).unwrap();
        match &workflow.nodes[0].kind {
            NodeKind::Conditional(spec) => {
                assert_eq!(spec.then_node, "yes-path");
                assert_eq!(spec.else_node.as_deref(), Some("no-path"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
        assert!(matches!(&workflow.nodes[3].kind, NodeKind::Parallel(_)));
        assert!(matches!(&workflow.nodes[4].kind, NodeKind::Loop(_)));
    }

    #[test]
    fn test_parse_retry_and_policy() {
        let yaml = r#"
name: retries
nodes:
  - id: flaky
    type: http
    url: https://example.com
    retry:
      attempts: 5
      backoff_initial_ms: 10
    on_error: continue
    priority: 2
"#;
        let workflow = parse(yaml).unwrap();
        let node = &workflow.nodes[0];
        let retry = node.retry.as_ref().unwrap();
        assert_eq!(retry.attempts, 5);
        assert_eq!(retry.backoff_initial_ms, 10);
        assert_eq!(retry.backoff_multiplier, 2.0);
        assert_eq!(node.on_error, OnError::Continue);
        assert_eq!(node.priority, 2);
    }

    #[test]
    fn test_parse_triggers_opaque() {
        let yaml = r#"
name: triggered
triggers:
  - type: cron
    schedule: "*/5 * * * *"
nodes:
  - id: a
    type: shell
    command: echo hi
"#;
        let workflow = parse(yaml).unwrap();
        assert_eq!(workflow.triggers.len(), 1);
        assert_eq!(workflow.triggers[0].trigger_type, "cron");
        assert_eq!(
            workflow.triggers[0].options.get("schedule"),
            Some(&serde_json::json!("*/5 * * * *"))
        );
    }

    #[test]
    fn test_round_trip_identity() {
        let yaml = r#"
name: round-trip
description: Everything bagel
version: 2
inputs:
  day:
    type: string
    required: true
triggers:
  - type: manual
settings:
  timeout: 10m
  max_parallel_nodes: 4
nodes:
  - id: build
    type: shell
    command: "make DAY=${inputs.day}"
    env:
      CI: "1"
    retry:
      attempts: 2
      backoff_initial_ms: 50
      backoff_multiplier: 1.5
      max_backoff_ms: 500
      jitter: false
    timeout: 30s
  - id: upload
    type: http
    method: POST
    url: https://api.example.com/x
    body:
      text: "${outputs.build.stdout}"
    expect_status: [200, 201]
    depends_on: [build]
    on_error: continue
"#;
        let registry = registry();
        let first = parse_workflow(yaml, &registry).unwrap();
        let serialized = workflow_to_yaml(&first).unwrap();
        let second = parse_workflow(&serialized, &registry).unwrap();
        assert_eq!(first, second);
    }
}
