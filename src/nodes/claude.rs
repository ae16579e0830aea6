//! Claude API node: one Messages API call per attempt.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::http::{classify, request_error};
use super::types::{ExecCtx, ExecError, NodeExecutor};
use super::ExecutorConfig;
use crate::engine::rate_limiter::ModelLimits;
use crate::template;
use crate::workflow::{ClaudeSpec, Node, NodeKind};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeExecutor {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limits: Arc<ModelLimits>,
}

impl ClaudeExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.claude_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key().map(|s| s.to_string()),
            limits: config.limits.clone(),
        }
    }

    fn build_body(&self, spec: &ClaudeSpec, ctx: &ExecCtx) -> Result<Value, ExecError> {
        let prompt = template::render_to_string(&spec.prompt, ctx.env())?;
        let mut body = Map::new();
        body.insert("model".to_string(), json!(spec.model));
        body.insert("max_tokens".to_string(), json!(spec.max_tokens));
        body.insert(
            "messages".to_string(),
            json!([{ "role": "user", "content": prompt }]),
        );
        if let Some(system) = &spec.system {
            body.insert(
                "system".to_string(),
                json!(template::render_to_string(system, ctx.env())?),
            );
        }
        if let Some(temperature) = spec.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if !spec.tools.is_empty() {
            body.insert("tools".to_string(), json!(spec.tools));
        }
        Ok(Value::Object(body))
    }
}

/// Concatenate the text blocks of a Messages API response.
fn response_text(body: &Value) -> String {
    body.get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[async_trait]
impl NodeExecutor for ClaudeExecutor {
    fn node_type(&self) -> &str {
        "claude-api"
    }

    fn validate_spec(&self, node: &Node) -> Vec<String> {
        let mut errors = Vec::new();
        if let NodeKind::ClaudeApi(spec) = &node.kind {
            if spec.prompt.trim().is_empty() {
                errors.push("prompt cannot be empty".to_string());
            }
            if spec.max_tokens == 0 {
                errors.push("max_tokens must be at least 1".to_string());
            }
            if let Some(t) = spec.temperature {
                if !(0.0..=1.0).contains(&t) {
                    errors.push(format!("temperature {} is outside [0, 1]", t));
                }
            }
        }
        errors
    }

    async fn execute(&self, node: &Node, ctx: &ExecCtx) -> Result<Value, ExecError> {
        let NodeKind::ClaudeApi(spec) = &node.kind else {
            return Err(ExecError::permanent("node is not a claude-api node"));
        };
        let Some(api_key) = &self.api_key else {
            return Err(ExecError::permanent(
                "ANTHROPIC_API_KEY is not configured",
            ));
        };

        let body = self.build_body(spec, ctx)?;

        tokio::select! {
            _ = self.limits.acquire(&spec.model) => {}
            _ = ctx.cancel.cancelled() => {
                return Err(ExecError::Cancelled {
                    reason: ctx.cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
                });
            }
        }

        let mut request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(timeout) = ctx.timeout {
            request = request.timeout(timeout);
        }

        let response = tokio::select! {
            response = request.send() => {
                response.map_err(|e| request_error(e, ctx.timeout))?
            }
            _ = ctx.cancel.cancelled() => {
                return Err(ExecError::Cancelled {
                    reason: ctx.cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
                });
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        classify(status, &[], &headers)?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ExecError::transient(format!("failed to decode response: {}", e)))?;

        Ok(json!({
            "text": response_text(&body),
            "stop_reason": body.get("stop_reason").cloned().unwrap_or(Value::Null),
            "usage": body.get("usage").cloned().unwrap_or(Value::Null),
        }))
    }

    fn description(&self) -> &str {
        "Call the Claude Messages API"
    }
}
