//! Capture records: the immutable result of one harness invocation

use crate::error::{HarnessError, Result};
use crate::materialize::Workspace;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// How the traced target finished, as reported by the tracer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    /// Normal exit with the given code
    Exited(i32),
    /// Killed by a signal (name as reported, e.g. `SIGSEGV`)
    Signaled(String),
    /// The tracer ran successfully but never reported the child's exit
    Unreported,
}

impl ChildStatus {
    /// `Unreported` counts as success: the tracer itself exited cleanly.
    pub fn success(&self) -> bool {
        matches!(self, ChildStatus::Exited(0) | ChildStatus::Unreported)
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Exited(code) => write!(f, "exited with status {}", code),
            ChildStatus::Signaled(sig) => write!(f, "terminated by {}", sig),
            ChildStatus::Unreported => write!(f, "exit status not reported by tracer"),
        }
    }
}

/// Ordered probe output of one invocation plus the files it ran against.
///
/// The record owns the invocation workspace, so `tracer_file` and
/// `target_file` stay valid for as long as the record is alive.
#[derive(Debug)]
pub struct CaptureRecord {
    invocation_id: Uuid,
    tracer_file: PathBuf,
    target_file: PathBuf,
    lines: Vec<String>,
    child_status: ChildStatus,
    _workspace: Workspace,
}

/// Serializable view written as `capture.json` when files are kept
#[derive(Serialize)]
pub struct CaptureSummary<'a> {
    pub invocation_id: Uuid,
    pub tracer_file: &'a Path,
    pub target_file: &'a Path,
    pub child_status: &'a ChildStatus,
    pub line_count: usize,
    pub lines: &'a [String],
}

impl CaptureRecord {
    pub(crate) fn new(
        invocation_id: Uuid,
        tracer_file: PathBuf,
        target_file: PathBuf,
        lines: Vec<String>,
        child_status: ChildStatus,
        workspace: Workspace,
    ) -> Self {
        Self {
            invocation_id,
            tracer_file,
            target_file,
            lines,
            child_status,
            _workspace: workspace,
        }
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    /// Path of the probe definition handed to the tracer
    pub fn tracer_file(&self) -> &Path {
        &self.tracer_file
    }

    /// Path of the materialized target program
    pub fn target_file(&self) -> &Path {
        &self.target_file
    }

    /// Captured lines in emission order
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    pub fn child_status(&self) -> &ChildStatus {
        &self.child_status
    }

    /// Turn a failed target run into [`HarnessError::ChildExecution`].
    ///
    /// [`ChildStatus::Unreported`] counts as success: the tracer exited
    /// cleanly but printed no exit notice. DTrace with `tracer.quiet = true`
    /// (the default) suppresses those notices, so such runs never fail here;
    /// set `quiet = false` to have a failing target detected.
    pub fn ensure_child_success(&self) -> Result<&Self> {
        if self.child_status.success() {
            Ok(self)
        } else {
            Err(HarnessError::ChildExecution {
                status: self.child_status.clone(),
            })
        }
    }

    /// Each line split on whitespace
    pub fn rows(&self) -> Vec<Vec<&str>> {
        self.lines
            .iter()
            .map(|line| line.split_whitespace().collect())
            .collect()
    }

    /// Rows whose `column` equals `value`.
    ///
    /// Probes usually print the source file in a fixed column; filtering on
    /// the target path drops events raised by the interpreter's own prelude.
    pub fn rows_where(&self, column: usize, value: &str) -> Vec<Vec<&str>> {
        self.rows()
            .into_iter()
            .filter(|row| row.get(column).is_some_and(|field| *field == value))
            .collect()
    }

    /// Rows whose `column` equals the target file path
    pub fn rows_in_target(&self, column: usize) -> Vec<Vec<&str>> {
        let target = self.target_file.to_string_lossy();
        self.rows_where(column, &target)
    }

    pub fn summary(&self) -> CaptureSummary<'_> {
        CaptureSummary {
            invocation_id: self.invocation_id,
            tracer_file: &self.tracer_file,
            target_file: &self.target_file,
            child_status: &self.child_status,
            line_count: self.lines.len(),
            lines: &self.lines,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
