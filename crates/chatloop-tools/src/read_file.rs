//! File reading tool.

use async_trait::async_trait;
use serde_json::json;

use crate::path_guard::validate_path;
use crate::{Tool, ToolContext, ToolOutput};

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file, optionally a window of lines. Returns content with line numbers."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace"
                },
                "offset": {
                    "type": "integer",
                    "description": "First line to return (0-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return"
                }
            },
            "required": ["path"]
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn execute(&self, params: serde_json::Value, context: &ToolContext) -> anyhow::Result<ToolOutput> {
        let raw_path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'path' parameter"))?;
        let offset = params.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = params.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);

        let path = match validate_path(raw_path, &context.workspace, context.restrict_to_workspace) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::error(format!("Path error: {e}"))),
        };
        if !path.is_file() {
            return Ok(ToolOutput::error(format!("File not found: {}", path.display())));
        }

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => return Ok(ToolOutput::error(format!("Read error: {e}"))),
        };

        let numbered: Vec<String> = text
            .lines()
            .enumerate()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(i, line)| format!("{:>6}\t{line}", i + 1))
            .collect();

        if numbered.is_empty() {
            return Ok(ToolOutput::ok("(empty file or offset beyond end)"));
        }
        Ok(ToolOutput::ok(numbered.join("\n")))
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
    async fn test_read_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "line1\nline2\nline3").unwrap();

        let out = ReadFileTool
            .execute(json!({"path": "hello.txt"}), &context(dir.path()))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.content.starts_with("     1\tline1"));
        assert!(out.content.ends_with("     3\tline3"));
    }

    #[tokio::test]
    async fn test_read_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "a\nb\nc\nd\ne").unwrap();

        let out = ReadFileTool
            .execute(json!({"path": "data.txt", "offset": 2, "limit": 2}), &context(dir.path()))
            .await
            .unwrap();
        assert_eq!(out.content, "     3\tc\n     4\td");
    }

    #[tokio::test]
    async fn test_missing_file_and_param() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let out = ReadFileTool.execute(json!({"path": "nope.txt"}), &ctx).await.unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("not found"));

        assert!(ReadFileTool.execute(json!({}), &ctx).await.is_err());
    }
}
