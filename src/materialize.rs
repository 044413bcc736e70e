//! Target materialization into invocation-scoped workspaces
//!
//! Every invocation gets its own directory (`probe-harness-<uuid>-XXXX`), so
//! concurrent invocations never collide on probe, target, or sink paths.
//! Paths are returned exactly as created and never canonicalized: tests
//! compare them byte-for-byte against what the traced program reports.

use crate::error::{HarnessError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

/// Scratch directory owned by exactly one invocation
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    keep: bool,
}

impl Workspace {
    /// Create a fresh workspace under the system temp dir.
    ///
    /// With `keep` set the directory survives drop for post-mortem inspection.
    pub fn create(invocation_id: Uuid, keep: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("probe-harness-{}-", invocation_id))
            .keep(keep)
            .tempdir()
            .map_err(HarnessError::io("creating invocation workspace"))?;
        debug!(path = %dir.path().display(), keep, "workspace created");
        Ok(Self { dir, keep })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn keeps_files(&self) -> bool {
        self.keep
    }

    /// Path for a fixed-name file inside the workspace
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Write `text` to a new uniquely named file in `dir` and return its path.
///
/// The contents are exactly `text`, flushed before returning.
pub fn materialize(dir: &Path, stem: &str, suffix: &str, text: &str) -> Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix(stem)
        .suffix(suffix)
        .tempfile_in(dir)
        .map_err(HarnessError::io("creating materialized file"))?;

    file.write_all(text.as_bytes())
        .map_err(HarnessError::io("writing materialized file"))?;
    file.flush()
        .map_err(HarnessError::io("flushing materialized file"))?;

    // The workspace owns cleanup; the file itself must outlive this handle
    let path = file
        .into_temp_path()
        .keep()
        .map_err(|e| HarnessError::io("keeping materialized file")(e.into()))?;

    debug!(path = %path.display(), bytes = text.len(), "materialized");
    Ok(path)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;

    #[test]
    fn test_materialize_exact_contents() {
        let ws = Workspace::create(Uuid::new_v4(), false).unwrap();
        let text = "class Foo\n  def self.foo; end\nend\n10.times { Foo.foo }\n";
        let path = materialize(ws.path(), "target", ".rb", text).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), text);
        assert!(path.starts_with(ws.path()));
        assert!(path.to_string_lossy().ends_with(".rb"));
    }

    #[test]
    fn test_materialize_empty_program() {
        let ws = Workspace::create(Uuid::new_v4(), false).unwrap();
        let path = materialize(ws.path(), "target", ".rb", "").unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_materialize_unique_paths() {
        let ws = Workspace::create(Uuid::new_v4(), false).unwrap();
        let a = materialize(ws.path(), "target", ".rb", "{}").unwrap();
        let b = materialize(ws.path(), "target", ".rb", "{}").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_materialize_missing_dir_is_io_error() {
        let ws = Workspace::create(Uuid::new_v4(), false).unwrap();
        let missing = ws.path().join("does/not/exist");
        let err = materialize(&missing, "target", ".rb", "[]").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let ws = Workspace::create(Uuid::new_v4(), false).unwrap();
        let path = ws.path().to_path_buf();
        materialize(&path, "target", ".rb", "[]").unwrap();
        drop(ws);
        assert!(!path.exists());
    }

    #[test]
    fn test_workspace_kept_on_drop() {
        let ws = Workspace::create(Uuid::new_v4(), true).unwrap();
        let path = ws.path().to_path_buf();
        assert!(ws.keeps_files());
        drop(ws);
        assert!(path.exists());
        fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn test_workspace_prefix_carries_invocation_id() {
        let id = Uuid::new_v4();
        let ws = Workspace::create(id, false).unwrap();
        let name = ws.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(&format!("probe-harness-{}-", id)));
    }
}
