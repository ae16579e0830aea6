//! HTTP node: one request, with response-status classification for retry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};

use super::types::{ExecCtx, ExecError, NodeExecutor};
use crate::template;
use crate::workflow::{HttpSpec, Node, NodeKind};

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a response status to success or a retry classification.
///
/// 429 is transient and honors Retry-After; other 4xx are permanent; 5xx
/// are transient. An explicit `expect_status` list overrides the default
/// 2xx-is-success rule but not the retry classification of failures.
pub(crate) fn classify(status: StatusCode, expected: &[u16], headers: &HeaderMap) -> Result<(), ExecError> {
    let ok = if expected.is_empty() {
        status.is_success()
    } else {
        expected.contains(&status.as_u16())
    };
    if ok {
        return Ok(());
    }

    let message = format!("unexpected response status {}", status.as_u16());
    if status == StatusCode::TOO_MANY_REQUESTS {
        Err(ExecError::Transient {
            message,
            retry_after: retry_after(headers),
        })
    } else if status.is_server_error() {
        Err(ExecError::transient(message))
    } else {
        Err(ExecError::permanent(message))
    }
}

pub(crate) fn request_error(e: reqwest::Error, timeout: Option<Duration>) -> ExecError {
    if e.is_timeout() {
        ExecError::Timeout {
            after: timeout.unwrap_or_default(),
        }
    } else {
        // Connection and protocol failures are worth retrying.
        ExecError::transient(format!("request failed: {}", e))
    }
}

#[async_trait]
impl NodeExecutor for HttpExecutor {
    fn node_type(&self) -> &str {
        "http"
    }

    fn validate_spec(&self, node: &Node) -> Vec<String> {
        let mut errors = Vec::new();
        if let NodeKind::Http(spec) = &node.kind {
            if spec.url.trim().is_empty() {
                errors.push("http url cannot be empty".to_string());
            }
            if !METHODS.contains(&spec.method.to_uppercase().as_str()) {
                errors.push(format!("unsupported http method '{}'", spec.method));
            }
        }
        errors
    }

    async fn execute(&self, node: &Node, ctx: &ExecCtx) -> Result<Value, ExecError> {
        let NodeKind::Http(spec) = &node.kind else {
            return Err(ExecError::permanent("node is not an http node"));
        };

        let request = self.build_request(spec, ctx)?;
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
        classify(status, &spec.expect_status, &headers)?;

        let json_body = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);
        let text = response
            .text()
            .await
            .map_err(|e| ExecError::transient(format!("failed to read body: {}", e)))?;
        let body = if json_body {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        let mut header_map = Map::new();
        for (name, value) in headers.iter() {
            if let Ok(value) = value.to_str() {
                header_map.insert(name.as_str().to_string(), Value::String(value.to_string()));
            }
        }

        Ok(json!({
            "status": status.as_u16(),
            "headers": header_map,
            "body": body,
        }))
    }

    fn description(&self) -> &str {
        "Make an HTTP request"
    }
}

impl HttpExecutor {
    fn build_request(
        &self,
        spec: &HttpSpec,
        ctx: &ExecCtx,
    ) -> Result<reqwest::RequestBuilder, ExecError> {
        let url = template::render_to_string(&spec.url, ctx.env())?;
        let method = Method::from_bytes(spec.method.to_uppercase().as_bytes())
            .map_err(|_| ExecError::permanent(format!("invalid http method '{}'", spec.method)))?;

        let mut request = self.client.request(method, url);
        if let Some(timeout) = ctx.timeout {
            request = request.timeout(timeout);
        }
        for (key, value) in &spec.headers {
            request = request.header(key, template::render_to_string(value, ctx.env())?);
        }
        if let Some(body) = &spec.body {
            request = request.json(&template::render_value(body, ctx.env())?);
        }
        Ok(request)
    }
}
