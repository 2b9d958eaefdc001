use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::tools::{optional_str, required_str, Tool, ToolArgs};

/// Read, write and list files under a workspace root.
pub struct FileSystemTool {
    workspace_root: PathBuf,
}

impl FileSystemTool {
    pub fn new(workspace_root: PathBuf) -> Self {
        FileSystemTool { workspace_root }
    }

    /// Resolve `path` inside the workspace; `..` may not climb above the root.
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        // Leading slashes are treated as workspace-relative.
        let clean_path = path.trim_start_matches('/');

        let mut full = self.workspace_root.clone();
        let mut depth = 0usize;
        for component in Path::new(clean_path).components() {
            match component {
                Component::Normal(part) => {
                    full.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir if depth > 0 => {
                    full.pop();
                    depth -= 1;
                }
                _ => return Err(anyhow!("path escapes the workspace: {}", path)),
            }
        }

        // Symlinks could still point outside; check the deepest entry that exists.
        fs::create_dir_all(&self.workspace_root).with_context(|| {
            format!("failed to create workspace: {}", self.workspace_root.display())
        })?;
        let root = self.workspace_root.canonicalize()?;
        let existing = full
            .ancestors()
            .find(|p| p.symlink_metadata().is_ok())
            .unwrap_or(self.workspace_root.as_path());
        match existing.canonicalize() {
            Ok(canonical) if canonical.starts_with(&root) => Ok(full),
            _ => Err(anyhow!("path escapes the workspace: {}", path)),
        }
    }

    pub fn read(&self, path: &str) -> Result<String> {
        let full_path = self.resolve_path(path)?;
        fs::read_to_string(&full_path).with_context(|| format!("failed to read file: {}", path))
    }

    pub fn write(&self, path: &str, content: &str) -> Result<String> {
        let full_path = self.resolve_path(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&full_path, content).with_context(|| format!("failed to write file: {}", path))?;
        Ok(format!("Successfully wrote to {}", path))
    }

    pub fn list(&self, path: &str) -> Result<String> {
        let dir_path = self.resolve_path(path)?;

        if !dir_path.exists() {
            return Err(anyhow!("directory does not exist: {}", path));
        }
        if !dir_path.is_dir() {
            return Err(anyhow!("not a directory: {}", path));
        }

        let entries =
            fs::read_dir(&dir_path).with_context(|| format!("failed to read directory: {}", path))?;

        let mut items = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            items.push(if entry.path().is_dir() {
                format!("{}/", name)
            } else {
                name
            });
        }

        items.sort();
        Ok(items.join("\n"))
    }
}

#[async_trait]
impl Tool for FileSystemTool {
    fn name(&self) -> &str {
        "file_system"
    }

    fn description(&self) -> &str {
        "Perform file system operations"
    }

    fn inputs(&self) -> Value {
        json!({
            "operation": {
                "type": "string",
                "description": "Operation to perform (read/write/list)",
                "enum": ["read", "write", "list"]
            },
            "path": {
                "type": "string",
                "description": "File or directory path"
            },
            "content": {
                "type": "string",
                "description": "Content to write (for write operation)",
                "nullable": true
            }
        })
    }

    async fn forward(&self, args: &ToolArgs) -> Result<String> {
        let operation = required_str(args, "operation")?;
        let path = required_str(args, "path")?;

        match operation {
            "read" => self.read(path),
            "write" => {
                let content = optional_str(args, "content")
                    .context("'content' is required for the write operation")?;
                self.write(path, content)
            }
            "list" => self.list(path),
            other => Err(anyhow!("unsupported operation: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> ToolArgs {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn write_read_list_round() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileSystemTool::new(dir.path().to_path_buf());

        let written = tool
            .forward(&args(json!({"operation": "write", "path": "notes/todo.txt", "content": "new content"})))
            .await
            .unwrap();
        assert!(written.contains("Successfully wrote"));

        let read = tool
            .forward(&args(json!({"operation": "read", "path": "notes/todo.txt"})))
            .await
            .unwrap();
        assert_eq!(read, "new content");

        fs::write(dir.path().join("top.md"), "x").unwrap();
        let listed = tool
            .forward(&args(json!({"operation": "list", "path": "."})))
            .await
            .unwrap();
        assert_eq!(listed, "notes/\ntop.md");
    }

    #[test]
    fn parent_components_cannot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileSystemTool::new(dir.path().to_path_buf());
        assert!(tool.resolve_path("../etc/passwd").is_err());
        assert!(tool.resolve_path("a/../../b").is_err());
        assert_eq!(
            tool.resolve_path("a/../b.txt").unwrap(),
            dir.path().join("b.txt")
        );
        assert_eq!(tool.resolve_path("/c.txt").unwrap(), dir.path().join("c.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_cannot_leave_the_workspace() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        fs::create_dir_all(&root).unwrap();
        symlink(outside.path(), root.join("link")).unwrap();
        symlink(outside.path().join("missing.txt"), root.join("dangling")).unwrap();
        let tool = FileSystemTool::new(root.clone());

        assert!(tool.write("link/escaped.txt", "pwned").is_err());
        assert!(tool.write("link/deeper/escaped.txt", "pwned").is_err());
        assert!(tool.write("dangling", "pwned").is_err());
        assert!(tool.list("link").is_err());
        assert!(!outside.path().join("escaped.txt").exists());
        assert!(!outside.path().join("deeper").exists());
        assert!(!outside.path().join("missing.txt").exists());

        symlink(root.join("real"), root.join("inner")).unwrap();
        fs::create_dir_all(root.join("real")).unwrap();
        assert!(tool.write("inner/ok.txt", "fine").is_ok());
        assert_eq!(fs::read_to_string(root.join("real/ok.txt")).unwrap(), "fine");
    }

    #[test]
    fn missing_workspace_root_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileSystemTool::new(dir.path().join("fresh"));
        assert_eq!(tool.list(".").unwrap(), "");
        assert!(dir.path().join("fresh").is_dir());
    }

    #[tokio::test]
    async fn write_without_content_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileSystemTool::new(dir.path().to_path_buf());
        let err = tool
            .forward(&args(json!({"operation": "write", "path": "x.txt"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("content"));
    }

    #[tokio::test]
    async fn unknown_operation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileSystemTool::new(dir.path().to_path_buf());
        assert!(tool
            .forward(&args(json!({"operation": "delete", "path": "x.txt"})))
            .await
            .is_err());
    }
}
