//! Capture sink and output collection
//!
//! Design:
//! 1. The harness creates an empty sink file in the invocation workspace
//! 2. The tracer is told to write probe output there (`-o <sink>`)
//! 3. Nobody reads the sink until the tracer has been reaped
//! 4. `collect` consumes the sink and returns its lines in order
//!
//! The sink is distinct from the tracer's stdout/stderr and from the target's
//! own output, so probe lines never interleave with program output.

use crate::error::{HarnessError, Result};
use crate::lifecycle::Reaped;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Single-writer (tracer) / single-reader (collector) probe output channel
#[derive(Debug)]
pub struct CaptureSink {
    path: PathBuf,
}

impl CaptureSink {
    /// Create an empty sink file at `path`
    pub fn create(path: PathBuf) -> Result<Self> {
        File::create(&path).map_err(HarnessError::io("creating capture sink"))?;
        Ok(Self { path })
    }

    /// Path the tracer writes to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the sink to end-of-stream.
    ///
    /// Requires proof that the tracer was reaped, so a read can never race
    /// a tracer that is still flushing.
    pub fn drain(self, _reaped: &Reaped) -> Result<Vec<String>> {
        let bytes = fs::read(&self.path).map_err(HarnessError::io("reading capture sink"))?;
        Ok(split_lines(&bytes))
    }
}

/// Collected output of one joined invocation
#[derive(Debug)]
pub struct Collected {
    pub tracer_file: PathBuf,
    pub target_file: PathBuf,
    pub lines: Vec<String>,
}

/// Drain `sink` after the join and pair its lines with the invocation files.
///
/// An empty sink is a valid outcome (a probe that matched nothing).
pub fn collect(
    sink: CaptureSink,
    reaped: &Reaped,
    tracer_file: PathBuf,
    target_file: PathBuf,
) -> Result<Collected> {
    let lines = sink.drain(reaped)?;
    debug!(lines = lines.len(), "capture collected");
    Ok(Collected {
        tracer_file,
        target_file,
        lines,
    })
}

/// Split probe output into lines, dropping `\n` / `\r\n` terminators.
///
/// Invalid UTF-8 (probes may copy raw strings out of the target) is replaced
/// rather than rejected.
pub fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_owned)
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
