//! File writing tool. Mutating, so it sits behind the approval gate by default.

use async_trait::async_trait;
use serde_json::json;

use crate::path_guard::validate_write_path;
use crate::{Tool, ToolContext, ToolOutput};

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file, replacing its contents. Creates the file if needed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                },
                "create_dirs": {
                    "type": "boolean",
                    "description": "Create missing parent directories. Default: false"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, params: serde_json::Value, context: &ToolContext) -> anyhow::Result<ToolOutput> {
        let raw_path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'path' parameter"))?;
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'content' parameter"))?;
        let create_dirs = params.get("create_dirs").and_then(|v| v.as_bool()).unwrap_or(false);

        let path = match validate_write_path(raw_path, &context.workspace, context.restrict_to_workspace, create_dirs) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::error(format!("Path error: {e}"))),
        };

        // Temp file then rename, so readers never see a half-written file.
        let tmp = path.with_extension("chatloop.tmp");
        if let Err(e) = tokio::fs::write(&tmp, content.as_bytes()).await {
            return Ok(ToolOutput::error(format!("Write error: {e}")));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Ok(ToolOutput::error(format!("Rename error: {e}")));
        }

        Ok(ToolOutput::ok(format!(
            "Wrote {} bytes to {}",
            content.len(),
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(workspace: &std::path::Path) -> ToolContext {
        ToolContext {
            workspace: workspace.to_path_buf(),
            restrict_to_workspace: true,
        }
    }

    #[tokio::test]
    async fn test_write_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteFileTool
            .execute(json!({"path": "out.txt", "content": "hello world"}), &context(dir.path()))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_write_nested_requires_flag() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let out = WriteFileTool
            .execute(json!({"path": "sub/file.txt", "content": "x"}), &ctx)
            .await
            .unwrap();
        assert!(out.is_error);

        let out = WriteFileTool
            .execute(json!({"path": "sub/file.txt", "content": "x", "create_dirs": true}), &ctx)
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(std::fs::read_to_string(dir.path().join("sub/file.txt")).unwrap(), "x");
    }

    #[test]
    fn test_requires_approval() {
        assert!(!WriteFileTool.is_read_only());
        assert!(WriteFileTool.requires_approval());
    }
}
