//! Test-body driver on top of [`Harness`]
//!
//! `trap_probe` hands a test body the tracer file, the target file and the
//! captured lines, the shape probe tests are usually written against. Bodies
//! return `anyhow::Result` so they can use `?` and `ensure!`; a harness
//! failure keeps its [`HarnessError`] inside the chain, recoverable with
//! [`error_kind`].

use crate::error::{ErrorKind, HarnessError};
use crate::harness::Harness;
use crate::record::CaptureRecord;
use anyhow::{Context, Result};
use std::path::Path;

/// Run one scenario and pass `(tracer_file, target_file, lines)` to `body`
pub fn trap_probe<F>(harness: &Harness, probe: &str, program: &str, body: F) -> Result<()>
where
    F: FnOnce(&Path, &Path, &[String]) -> Result<()>,
{
    with_record(harness, probe, program, |record| {
        body(record.tracer_file(), record.target_file(), record.lines())
    })
}

/// Run one scenario and pass the whole record to `body`
pub fn with_record<F>(harness: &Harness, probe: &str, program: &str, body: F) -> Result<()>
where
    F: FnOnce(&CaptureRecord) -> Result<()>,
{
    let record = harness
        .activate(probe, program)
        .context("probe scenario did not produce a capture record")?;
    body(&record).with_context(|| {
        format!(
            "assertions failed for invocation {} ({} captured lines)",
            record.invocation_id(),
            record.lines().len()
        )
    })
}

/// The harness error kind buried in an anyhow chain, if any
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<HarnessError>())
        .map(HarnessError::kind)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineKind, HarnessConfig};

    fn shell_harness() -> Harness {
        let mut config = HarnessConfig::default();
        config.tracer.engine = EngineKind::Command;
        config.tracer.argv = vec![
            "sh".to_string(),
            "{probe}".to_string(),
            "{sink}".to_string(),
            "{target}".to_string(),
        ];
        config.target.interpreter = vec!["sh".to_string()];
        config.target.suffix = ".sh".to_string();
        Harness::new(config).unwrap()
    }

    const ECHO_TRACER: &str = "sink=\"$1\"; shift\n\"$@\" > \"$sink\"\n";

    #[test]
    fn test_trap_probe_passes_paths_and_lines() {
        let harness = shell_harness();
        trap_probe(&harness, ECHO_TRACER, "echo \"hit $0\"\n", |d_file, target, lines| {
            anyhow::ensure!(d_file.exists(), "probe file missing");
            anyhow::ensure!(lines.len() == 1, "expected one line, got {:?}", lines);
            anyhow::ensure!(lines[0] == format!("hit {}", target.display()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_body_failure_is_reported_with_context() {
        let harness = shell_harness();
        let err = trap_probe(&harness, ECHO_TRACER, "true\n", |_, _, _| {
            anyhow::bail!("expected 10 lines")
        })
        .unwrap_err();
        let text = format!("{:#}", err);
        assert!(text.contains("assertions failed for invocation"));
        assert!(text.contains("expected 10 lines"));
        assert_eq!(error_kind(&err), None);
    }

    #[test]
    fn test_harness_failure_keeps_kind() {
        let harness = shell_harness();
        let err = trap_probe(&harness, "echo broken >&2\nexit 2\n", "true\n", |_, _, _| Ok(()))
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::Activation));
    }
}
