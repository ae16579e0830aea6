//! Shell node: runs a command line via `sh -c`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use super::types::{ExecCtx, ExecError, NodeExecutor};
use crate::template;
use crate::workflow::{Node, NodeKind, ShellSpec};

/// Grace between SIGTERM and SIGKILL when tearing a command down.
const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

async fn wait_deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Terminate the whole process group: SIGTERM, a grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
            tokio::select! {
                _ = child.wait() => return,
                _ = tokio::time::sleep(KILL_GRACE) => {}
            }
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[async_trait]
impl NodeExecutor for ShellExecutor {
    fn node_type(&self) -> &str {
        "shell"
    }

    fn validate_spec(&self, node: &Node) -> Vec<String> {
        let mut errors = Vec::new();
        if let NodeKind::Shell(spec) = &node.kind {
            if spec.command.trim().is_empty() {
                errors.push("shell command cannot be empty".to_string());
            }
        }
        errors
    }

    async fn execute(&self, node: &Node, ctx: &ExecCtx) -> Result<Value, ExecError> {
        let NodeKind::Shell(spec) = &node.kind else {
            return Err(ExecError::permanent("node is not a shell node"));
        };

        let command_line = template::render_to_string(&spec.command, ctx.env())?;
        let mut command = build_command(spec, &command_line, ctx)?;

        let mut child = command
            .spawn()
            .map_err(|e| ExecError::permanent(format!("failed to spawn command: {}", e)))?;

        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| ExecError::permanent(format!("wait failed: {}", e)))?
            }
            _ = ctx.cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(ExecError::Cancelled {
                    reason: ctx.cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
                });
            }
            _ = wait_deadline(ctx.timeout) => {
                terminate(&mut child).await;
                return Err(ExecError::Timeout {
                    after: ctx.timeout.unwrap_or_default(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&stdout.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.await.unwrap_or_default()).into_owned();
        let exit_code = status.code().unwrap_or(-1);

        if exit_code != 0 {
            let tail: String = stderr.chars().rev().take(500).collect::<Vec<_>>()
                .into_iter().rev().collect();
            let message = format!("command exited with code {}: {}", exit_code, tail.trim());
            return Err(if spec.retry_on_nonzero_exit {
                ExecError::transient(message)
            } else {
                ExecError::permanent(message)
            });
        }

        Ok(json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }

    fn description(&self) -> &str {
        "Run a shell command via sh -c"
    }
}

fn build_command(spec: &ShellSpec, command_line: &str, ctx: &ExecCtx) -> Result<Command, ExecError> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    for (key, value) in &spec.env {
        command.env(key, template::render_to_string(value, ctx.env())?);
    }
    if let Some(cwd) = &spec.cwd {
        command.current_dir(template::render_to_string(cwd, ctx.env())?);
    }
    Ok(command)
}
