//! Directory listing tool with optional glob filtering.

use std::path::Path;

use async_trait::async_trait;
use serde_json::json;

use crate::path_guard::validate_path;
use crate::{Tool, ToolContext, ToolOutput};

const DEFAULT_LIMIT: usize = 200;

pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and directories under a path, optionally filtered by a glob pattern."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list, relative to the workspace. Default: \".\""
                },
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern to filter entries (e.g. \"*.rs\")"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Recurse into subdirectories. Default: false"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of entries. Default: 200"
                }
            }
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn execute(&self, params: serde_json::Value, context: &ToolContext) -> anyhow::Result<ToolOutput> {
        let raw_path = params.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let pattern = params.get("pattern").and_then(|v| v.as_str());
        let recursive = params.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false);
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_LIMIT);

        let dir = match validate_path(raw_path, &context.workspace, context.restrict_to_workspace) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::error(format!("Path error: {e}"))),
        };
        if !dir.is_dir() {
            return Ok(ToolOutput::error(format!("Not a directory: {}", dir.display())));
        }

        let entries = match pattern {
            Some(pat) => match glob_entries(&dir, pat, recursive, limit) {
                Ok(entries) => entries,
                Err(e) => return Ok(ToolOutput::error(format!("Invalid glob pattern: {e}"))),
            },
            None => {
                let mut entries = Vec::new();
                if let Err(e) = walk(&dir, &dir, recursive, limit, &mut entries) {
                    return Ok(ToolOutput::error(format!("Read error: {e}")));
                }
                entries
            }
        };

        if entries.is_empty() {
            return Ok(ToolOutput::ok("(no entries)"));
        }
        Ok(ToolOutput::ok(entries.join("\n")))
    }
}

fn describe(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    if path.is_dir() {
        format!("[dir]  {}/", relative.display())
    } else {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        format!("[file] {} ({size} bytes)", relative.display())
    }
}

fn glob_entries(dir: &Path, pattern: &str, recursive: bool, limit: usize) -> Result<Vec<String>, glob::PatternError> {
    let full = if recursive {
        format!("{}/**/{pattern}", dir.display())
    } else {
        format!("{}/{pattern}", dir.display())
    };
    Ok(glob::glob(&full)?
        .flatten()
        .take(limit)
        .map(|path| describe(dir, &path))
        .collect())
}

fn walk(root: &Path, dir: &Path, recursive: bool, limit: usize, entries: &mut Vec<String>) -> std::io::Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());

    for child in children {
        if entries.len() >= limit {
            entries.push(format!("... (truncated at {limit} entries)"));
            return Ok(());
        }
        let path = child.path();
        entries.push(describe(root, &path));
        if recursive && path.is_dir() {
            walk(root, &path, recursive, limit, entries)?;
        }
    }
    Ok(())
}
