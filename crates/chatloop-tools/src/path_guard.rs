//! Workspace confinement for file tools.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

fn join_workspace(raw: &str, workspace: &Path) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// Canonical form of `path`, resolving through its deepest existing ancestor
/// so that not-yet-created files can be checked too.
fn canonical_through_ancestor(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.canonicalize()?);
    }
    let mut ancestor = path;
    while !ancestor.exists() {
        match ancestor.parent() {
            Some(parent) => ancestor = parent,
            None => return Ok(path.to_path_buf()),
        }
    }
    let suffix = path.strip_prefix(ancestor).unwrap_or(path);
    if suffix.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        bail!("Path '{}' contains '..' below an existing directory", path.display());
    }
    Ok(ancestor.canonicalize()?.join(suffix))
}

fn ensure_inside(candidate: &Path, workspace: &Path) -> Result<()> {
    let root = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    if !candidate.starts_with(&root) {
        bail!(
            "Path '{}' is outside the workspace '{}'",
            candidate.display(),
            root.display()
        );
    }
    Ok(())
}

/// Resolve a path for reading.
pub fn validate_path(raw: &str, workspace: &Path, restrict: bool) -> Result<PathBuf> {
    let resolved = canonical_through_ancestor(&join_workspace(raw, workspace))?;
    if restrict {
        ensure_inside(&resolved, workspace)?;
    }
    Ok(resolved)
}

/// Resolve a path for writing, optionally creating missing parent directories.
pub fn validate_write_path(raw: &str, workspace: &Path, restrict: bool, create_dirs: bool) -> Result<PathBuf> {
    let path = join_workspace(raw, workspace);
    let resolved = canonical_through_ancestor(&path)?;
    if restrict {
        ensure_inside(&resolved, workspace)?;
    }

    if let Some(parent) = resolved.parent() {
        if !parent.exists() {
            if !create_dirs {
                bail!("Parent directory does not exist: {}", parent.display());
            }
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_resolves() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let result = validate_path("notes.txt", dir.path(), true).unwrap();
        assert!(result.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn test_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        assert!(validate_path("../../etc/passwd", dir.path(), true).is_err());
        assert!(validate_path("/etc", dir.path(), true).is_err());
    }

    #[test]
    fn test_unrestricted_allows_outside() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_path("/tmp", dir.path(), false).is_ok());
    }

    #[test]
    fn test_write_path_parent_handling() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_write_path("a/b/c.txt", dir.path(), true, false).is_err());

        let path = validate_write_path("a/b/c.txt", dir.path(), true, true).unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert!(validate_write_path("new/../../x.txt", dir.path(), true, true).is_err());
    }
}
