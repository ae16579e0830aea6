//! File nodes: read a file into the outputs, or write rendered content out.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use super::types::{ExecCtx, ExecError, NodeExecutor};
use crate::template;
use crate::workflow::{Node, NodeKind};

fn io_error(action: &str, path: &str, e: std::io::Error) -> ExecError {
    ExecError::permanent(format!("failed to {} '{}': {}", action, path, e))
}

pub struct FileReadExecutor;

#[async_trait]
impl NodeExecutor for FileReadExecutor {
    fn node_type(&self) -> &str {
        "file-read"
    }

    async fn execute(&self, node: &Node, ctx: &ExecCtx) -> Result<Value, ExecError> {
        let NodeKind::FileRead(spec) = &node.kind else {
            return Err(ExecError::permanent("node is not a file-read node"));
        };

        let path = template::render_to_string(&spec.path, ctx.env())?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error("read", &path, e))?;

        Ok(json!({
            "path": path,
            "content": content,
            "size": content.len(),
        }))
    }

    fn description(&self) -> &str {
        "Read a text file"
    }
}

pub struct FileWriteExecutor;

#[async_trait]
impl NodeExecutor for FileWriteExecutor {
    fn node_type(&self) -> &str {
        "file-write"
    }

    async fn execute(&self, node: &Node, ctx: &ExecCtx) -> Result<Value, ExecError> {
        let NodeKind::FileWrite(spec) = &node.kind else {
            return Err(ExecError::permanent("node is not a file-write node"));
        };

        let path = template::render_to_string(&spec.path, ctx.env())?;
        let content = template::render_to_string(&spec.content, ctx.env())?;

        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("create directory for", &path, e))?;
            }
        }

        if spec.append {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| io_error("open", &path, e))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| io_error("append to", &path, e))?;
        } else {
            tokio::fs::write(&path, &content)
                .await
                .map_err(|e| io_error("write", &path, e))?;
        }

        Ok(json!({
            "path": path,
            "bytes_written": content.len(),
        }))
    }

    fn description(&self) -> &str {
        "Write rendered content to a file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testutil::{exec_ctx, make_node};
    use crate::workflow::{FileReadSpec, FileWriteSpec};

    #[tokio::test]
    async fn test_write_then_read() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.txt").display().to_string();

        let write = make_node(
            "save",
            NodeKind::FileWrite(FileWriteSpec {
                path: path.clone(),
                content: "line one\n".to_string(),
                append: false,
            }),
        );
        let ctx = exec_ctx("save", None);
        let out = FileWriteExecutor.execute(&write, &ctx).await.unwrap();
        assert_eq!(out["bytes_written"], 9);

        let read = make_node(
            "load",
            NodeKind::FileRead(FileReadSpec { path: path.clone() }),
        );
        let ctx = exec_ctx("load", None);
        let out = FileReadExecutor.execute(&read, &ctx).await.unwrap();
        assert_eq!(out["content"], "line one\n");
    }

    #[tokio::test]
    async fn test_append_accumulates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log.txt").display().to_string();
        let node = make_node(
            "log",
            NodeKind::FileWrite(FileWriteSpec {
                path: path.clone(),
                content: "x".to_string(),
                append: true,
            }),
        );
        let ctx = exec_ctx("log", None);
        FileWriteExecutor.execute(&node, &ctx).await.unwrap();
        FileWriteExecutor.execute(&node, &ctx).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "xx");
    }

    #[tokio::test]
    async fn test_missing_file_is_permanent() {
        let node = make_node(
            "load",
            NodeKind::FileRead(FileReadSpec {
                path: "/nonexistent/definitely/not/here.txt".to_string(),
            }),
        );
        let ctx = exec_ctx("load", None);
        let err = FileReadExecutor.execute(&node, &ctx).await.unwrap_err();
        assert!(!err.retryable());
    }
}
