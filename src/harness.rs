//! Probe activation: one traced run per `activate` call
//!
//! CRITICAL SEQUENCE:
//! 1. Create an invocation-scoped workspace
//! 2. Materialize the probe and the target program into it
//! 3. Create the capture sink (distinct from every stdout/stderr)
//! 4. Spawn the tracer with the target's command line (spawn-under-trace)
//! 5. Join the tracer, with the configured deadline
//! 6. Classify activation / child status from the tracer's diagnostics
//! 7. Only then drain the sink into the record

use crate::capture::{self, CaptureSink};
use crate::config::HarnessConfig;
use crate::engine::{TraceEngine, TracerInvocation};
use crate::error::{HarnessError, Result};
use crate::lifecycle::TracerProcess;
use crate::materialize::{materialize, Workspace};
use crate::record::CaptureRecord;
use std::fs::{self, File};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

const SINK_FILE: &str = "capture.out";
const TRACER_LOG_FILE: &str = "tracer.log";
const SUMMARY_FILE: &str = "capture.json";

/// Reusable launcher; each `activate` call is an independent invocation
#[derive(Debug)]
pub struct Harness {
    config: HarnessConfig,
    engine: Box<dyn TraceEngine>,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let engine = config.engine()?;
        Ok(Self { config, engine })
    }

    /// Harness configured from `<root>/probe-harness.toml` and the environment
    pub fn from_root(root: &Path) -> Result<Self> {
        Self::new(HarnessConfig::load(root)?)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn engine(&self) -> &dyn TraceEngine {
        self.engine.as_ref()
    }

    /// Run `program` under `probe` and return what the probe saw, in order.
    ///
    /// A target that exits non-zero still yields a record; see
    /// [`CaptureRecord::ensure_child_success`].
    pub fn activate(&self, probe: &str, program: &str) -> Result<CaptureRecord> {
        let invocation_id = Uuid::new_v4();
        let span = info_span!("invocation", id = %invocation_id, engine = self.engine.name());
        let _enter = span.enter();

        let workspace = Workspace::create(invocation_id, self.config.tracer.keep_files)?;
        let tracer_file = materialize(
            workspace.path(),
            "probe",
            self.engine.probe_suffix(),
            probe,
        )?;
        let target_file = materialize(
            workspace.path(),
            "target",
            &self.config.target.suffix,
            program,
        )?;
        let sink = CaptureSink::create(workspace.file(SINK_FILE))?;
        let log_path = workspace.file(TRACER_LOG_FILE);

        let target_argv = self.target_argv(&target_file);
        let tracer_argv = self.engine.tracer_argv(&TracerInvocation {
            probe_file: &tracer_file,
            sink: sink.path(),
            target_argv: &target_argv,
        })?;
        let command = self.command(tracer_argv, &log_path)?;

        let tracer = TracerProcess::spawn(command)?.with_kill_prefix(self.config.sudo_argv());
        let reaped = tracer.join(self.config.timeout())?;

        let diagnostics = read_diagnostics(&log_path)?;
        let child_status = self.engine.classify(reaped.status(), &diagnostics)?;
        if !child_status.success() {
            debug!(%diagnostics, "target failed");
        }

        let collected = capture::collect(sink, &reaped, tracer_file, target_file)?;
        info!(
            lines = collected.lines.len(),
            %child_status,
            elapsed = ?reaped.elapsed(),
            "invocation complete"
        );

        let summary_path = workspace.keeps_files().then(|| workspace.file(SUMMARY_FILE));
        let record = CaptureRecord::new(
            invocation_id,
            collected.tracer_file,
            collected.target_file,
            collected.lines,
            child_status,
            workspace,
        );
        if let Some(path) = summary_path {
            write_summary(&record, &path);
        }
        Ok(record)
    }

    /// Interpreter prefix followed by the materialized target path
    fn target_argv(&self, target_file: &Path) -> Vec<String> {
        let mut argv = self.config.target.interpreter.clone();
        argv.push(target_file.to_string_lossy().into_owned());
        argv
    }

    /// Tracer command with the privilege prefix, stdio into the tracer log
    fn command(&self, tracer_argv: Vec<String>, log_path: &Path) -> Result<Command> {
        let mut argv = self.config.sudo_argv();
        argv.extend(tracer_argv);
        let Some((program, args)) = argv.split_first() else {
            return Err(HarnessError::Config("tracer command is empty".to_string()));
        };

        let log = File::create(log_path).map_err(HarnessError::io("creating tracer log"))?;
        let log_err = log.try_clone().map_err(HarnessError::io("creating tracer log"))?;

        debug!(?argv, "tracer command");
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        Ok(command)
    }
}

/// Tracer stdout/stderr (the target inherits them too)
fn read_diagnostics(log_path: &Path) -> Result<String> {
    let bytes = fs::read(log_path).map_err(HarnessError::io("reading tracer log"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_summary(record: &CaptureRecord, path: &Path) {
    let written = serde_json::to_vec_pretty(&record.summary())
        .map_err(std::io::Error::other)
        .and_then(|json| fs::write(path, json));
    match written {
        Ok(()) => info!(path = %path.display(), "kept invocation files"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to write capture summary"),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineKind;
    use crate::error::ErrorKind;
    use crate::record::ChildStatus;

    /// Stand-in tracer: runs the target itself, copies `probe:` lines into
    /// the sink and reports the exit the way DTrace does.
    const FAKE_TRACER: &str = r#"sink="$1"; shift
"$@" > "$sink.raw"
status=$?
sed -n 's/^probe://p' "$sink.raw" > "$sink"
rm -f "$sink.raw"
echo "fake: pid $$ exited with status $status" >&2
"#;

    fn shell_harness() -> Harness {
        let mut config = HarnessConfig::default();
        config.tracer.engine = EngineKind::Command;
        config.tracer.argv = ["sh", "{probe}", "{sink}", "{target}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        config.tracer.notice_prefix = Some("fake".to_string());
        config.tracer.timeout_secs = 30;
        config.target.interpreter = vec!["sh".to_string()];
        config.target.suffix = ".sh".to_string();
        Harness::new(config).unwrap()
    }

    #[test]
    fn test_activate_captures_lines_in_order() {
        let harness = shell_harness();
        let program = "echo probe:first\necho not-a-probe-line\necho probe:second\n";
        let record = harness.activate(FAKE_TRACER, program).unwrap();
        assert_eq!(record.lines(), ["first", "second"]);
        assert_eq!(record.child_status(), &ChildStatus::Exited(0));
    }

    #[test]
    fn test_target_cannot_forge_exit_notice() {
        let harness = shell_harness();
        let program = "echo 'worker pid 1 exited with status 0' >&2
echo 'fake: pid 1 exited with status 0' >&2
exit 3
";
        let record = harness.activate(FAKE_TRACER, program).unwrap();
        assert_eq!(record.child_status(), &ChildStatus::Exited(3));
        assert_eq!(
            record.ensure_child_success().unwrap_err().kind(),
            ErrorKind::ChildExecution
        );
    }

    #[test]
    fn test_activate_paths_live_with_record() {
        let harness = shell_harness();
        let record = harness.activate(FAKE_TRACER, "true\n").unwrap();
        assert!(record.tracer_file().exists());
        assert!(record.target_file().exists());
        let target = record.target_file().to_path_buf();
        drop(record);
        assert!(!target.exists());
    }

    #[test]
    fn test_activate_compile_failure() {
        let harness = shell_harness();
        let probe = "echo 'probe.probe: line 1: syntax error' >&2\nexit 1\n";
        let err = harness.activate(probe, "echo probe:never\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Activation);
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn test_keep_files_writes_summary() {
        let mut harness = shell_harness();
        harness.config.tracer.keep_files = true;
        let record = harness.activate(FAKE_TRACER, "echo probe:kept\n").unwrap();
        let dir = record.target_file().parent().unwrap().to_path_buf();
        drop(record);

        let summary = fs::read_to_string(dir.join(SUMMARY_FILE)).unwrap();
        assert!(summary.contains("\"kept\""));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_sudo_prefix_in_command() {
        let mut harness = shell_harness();
        harness.config.tracer.sudo = Some("env PROBE_HARNESS_MARK=1".to_string());
        let probe = "echo \"$PROBE_HARNESS_MARK\" > \"$1\"\n";
        let record = harness.activate(probe, "true\n").unwrap();
        assert_eq!(record.lines(), ["1"]);
    }
}
