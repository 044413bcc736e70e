//! Tracing engines: how to launch a target *under* a tracer
//!
//! Every engine uses the spawn-under-trace protocol: the tracer receives the
//! target's command line, compiles and enables the probe, and only then
//! forks/execs the target as its own child. There is no "start, then
//! attach" path, so no event can fire before the probe is live.
//!
//! Child exit reporting follows DTrace's diagnostics
//! (`dtrace: pid N exited with status S`, `dtrace: pid N terminated by SIGX`,
//! `dtrace: pid N has exited`), which `CommandTemplate` tracers mimic under
//! their own prefix. The target writes to the same stdout/stderr as the
//! tracer, so only lines starting with the tracer's prefix count, and the
//! last one wins: the tracer prints its notice after the target is gone.

use crate::error::{HarnessError, Result};
use crate::record::ChildStatus;
use std::fmt;
use std::path::Path;
use std::process::ExitStatus;

/// Everything an engine needs to build its command line
#[derive(Debug, Clone, Copy)]
pub struct TracerInvocation<'a> {
    pub probe_file: &'a Path,
    pub sink: &'a Path,
    pub target_argv: &'a [String],
}

/// A tracer that can spawn a target under trace
pub trait TraceEngine: fmt::Debug + Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Suffix for the materialized probe definition
    fn probe_suffix(&self) -> &'static str;

    /// Full tracer argv (without any privilege prefix)
    fn tracer_argv(&self, invocation: &TracerInvocation<'_>) -> Result<Vec<String>>;

    /// Name the tracer puts before its own notices (`<prefix>: pid N ...`)
    fn notice_prefix(&self) -> &str;

    /// Decide from the tracer's exit and diagnostics whether the probe was
    /// activated, and if so how the target finished.
    fn classify(&self, status: ExitStatus, diagnostics: &str) -> Result<ChildStatus> {
        classify_by_report(status, diagnostics, self.notice_prefix())
    }
}

// =============================================================================
// DTrace
// =============================================================================

/// `dtrace -q -o <sink> -s <probe.d> -c "<target>"`
///
/// `$target` inside the probe resolves to the spawned child's pid.
#[derive(Debug, Clone)]
pub struct DTrace {
    pub program: String,
    /// Pass `-q`. DTrace then also suppresses its child-exit notices, so the
    /// target status comes back as `Unreported`.
    pub quiet: bool,
}

impl Default for DTrace {
    fn default() -> Self {
        Self {
            program: "dtrace".to_string(),
            quiet: true,
        }
    }
}

impl TraceEngine for DTrace {
    fn name(&self) -> &'static str {
        "dtrace"
    }

    fn probe_suffix(&self) -> &'static str {
        ".d"
    }

    fn tracer_argv(&self, inv: &TracerInvocation<'_>) -> Result<Vec<String>> {
        let mut argv = vec![self.program.clone()];
        if self.quiet {
            argv.push("-q".to_string());
        }
        argv.extend([
            "-o".to_string(),
            path_arg(inv.sink),
            "-s".to_string(),
            path_arg(inv.probe_file),
            "-c".to_string(),
            command_string(inv.target_argv)?,
        ]);
        Ok(argv)
    }

    fn notice_prefix(&self) -> &str {
        "dtrace"
    }
}

// =============================================================================
// bpftrace
// =============================================================================

/// `bpftrace -o <sink> -c "<target>" <probe.bt>`
///
/// `cpid` inside the probe resolves to the spawned child's pid.
#[derive(Debug, Clone)]
pub struct Bpftrace {
    pub program: String,
}

impl Default for Bpftrace {
    fn default() -> Self {
        Self {
            program: "bpftrace".to_string(),
        }
    }
}

impl TraceEngine for Bpftrace {
    fn name(&self) -> &'static str {
        "bpftrace"
    }

    fn probe_suffix(&self) -> &'static str {
        ".bt"
    }

    fn tracer_argv(&self, inv: &TracerInvocation<'_>) -> Result<Vec<String>> {
        Ok(vec![
            self.program.clone(),
            "-o".to_string(),
            path_arg(inv.sink),
            "-c".to_string(),
            command_string(inv.target_argv)?,
            path_arg(inv.probe_file),
        ])
    }

    fn notice_prefix(&self) -> &str {
        "bpftrace"
    }
}

// =============================================================================
// Command template
// =============================================================================

pub const PROBE_PLACEHOLDER: &str = "{probe}";
pub const SINK_PLACEHOLDER: &str = "{sink}";
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// Arbitrary tracer argv with `{probe}`, `{sink}` and `{target}` placeholders.
///
/// `{target}` as a whole element splices the target argv in place; embedded
/// in a larger element it expands to the whitespace-joined command string.
///
/// Child-exit notices are expected as `<notice_prefix>: pid N ...`; the
/// prefix defaults to the file name of the first argv element.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub argv: Vec<String>,
    pub notice_prefix: String,
}

impl CommandTemplate {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        for placeholder in [PROBE_PLACEHOLDER, SINK_PLACEHOLDER, TARGET_PLACEHOLDER] {
            if !argv.iter().any(|arg| arg.contains(placeholder)) {
                return Err(HarnessError::Config(format!(
                    "command template is missing {}",
                    placeholder
                )));
            }
        }
        let notice_prefix = argv
            .first()
            .and_then(|program| Path::new(program).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            argv,
            notice_prefix,
        })
    }

    pub fn with_notice_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.notice_prefix = prefix.into();
        self
    }
}

impl TraceEngine for CommandTemplate {
    fn name(&self) -> &'static str {
        "command"
    }

    fn probe_suffix(&self) -> &'static str {
        ".probe"
    }

    fn tracer_argv(&self, inv: &TracerInvocation<'_>) -> Result<Vec<String>> {
        let probe = path_arg(inv.probe_file);
        let sink = path_arg(inv.sink);
        let mut argv = Vec::with_capacity(self.argv.len() + inv.target_argv.len());

        for arg in &self.argv {
            if arg == TARGET_PLACEHOLDER {
                argv.extend(inv.target_argv.iter().cloned());
                continue;
            }
            let mut expanded = arg
                .replace(PROBE_PLACEHOLDER, &probe)
                .replace(SINK_PLACEHOLDER, &sink);
            if expanded.contains(TARGET_PLACEHOLDER) {
                let command = command_string(inv.target_argv)?;
                expanded = expanded.replace(TARGET_PLACEHOLDER, &command);
            }
            argv.push(expanded);
        }
        Ok(argv)
    }

    fn notice_prefix(&self) -> &str {
        &self.notice_prefix
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Join the target argv into the single string `-c` expects.
///
/// Tracers split that string on whitespace, so elements containing
/// whitespace cannot be represented and are rejected.
pub fn command_string(argv: &[String]) -> Result<String> {
    if argv.is_empty() {
        return Err(HarnessError::Config("target command is empty".to_string()));
    }
    if let Some(bad) = argv.iter().find(|a| a.is_empty() || a.chars().any(char::is_whitespace)) {
        return Err(HarnessError::Config(format!(
            "target argument {:?} is empty or contains whitespace",
            bad
        )));
    }
    Ok(argv.join(" "))
}

/// The last `<prefix>: pid N ...` child exit notice in tracer diagnostics
pub fn parse_child_report(diagnostics: &str, prefix: &str) -> Option<ChildStatus> {
    diagnostics
        .lines()
        .rev()
        .find_map(|line| parse_report_line(line, prefix))
}

fn parse_report_line(line: &str, prefix: &str) -> Option<ChildStatus> {
    if prefix.is_empty() {
        return None;
    }
    let rest = line.strip_prefix(prefix)?.strip_prefix(':')?;
    let rest = rest.trim_start().strip_prefix("pid ")?;
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = rest[digits..].trim_start();

    if let Some(code) = rest.strip_prefix("exited with status ") {
        return code.trim().parse().ok().map(ChildStatus::Exited);
    }
    if rest.starts_with("has exited") {
        return Some(ChildStatus::Exited(0));
    }
    if let Some(sig) = rest.strip_prefix("terminated by ") {
        let sig = sig.trim();
        if !sig.is_empty() {
            return Some(ChildStatus::Signaled(sig.to_string()));
        }
    }
    None
}

/// A tracer that exits non-zero without reporting its child never got the
/// probe enabled: that is an activation failure.
fn classify_by_report(status: ExitStatus, diagnostics: &str, prefix: &str) -> Result<ChildStatus> {
    match (status.success(), parse_child_report(diagnostics, prefix)) {
        (_, Some(child)) => Ok(child),
        (true, None) => Ok(ChildStatus::Unreported),
        (false, None) => Err(HarnessError::Activation {
            diagnostic: activation_diagnostic(status, diagnostics),
        }),
    }
}

fn activation_diagnostic(status: ExitStatus, diagnostics: &str) -> String {
    let text = diagnostics.trim();
    if text.is_empty() {
        format!("tracer {} with no diagnostics", status)
    } else {
        format!("tracer {}: {}", status, text)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;

    fn exit(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn with_invocation<R>(f: impl FnOnce(&TracerInvocation<'_>) -> R) -> R {
        let probe = PathBuf::from("/tmp/ws/probe1.d");
        let sink = PathBuf::from("/tmp/ws/sink.out");
        let target = argv(&["ruby", "-Ilib", "/tmp/ws/target1.rb"]);
        f(&TracerInvocation {
            probe_file: &probe,
            sink: &sink,
            target_argv: &target,
        })
    }

    #[test]
    fn test_dtrace_argv() {
        let argv = with_invocation(|inv| DTrace::default().tracer_argv(inv).unwrap());
        assert_eq!(
            argv,
            vec![
                "dtrace",
                "-q",
                "-o",
                "/tmp/ws/sink.out",
                "-s",
                "/tmp/ws/probe1.d",
                "-c",
                "ruby -Ilib /tmp/ws/target1.rb"
            ]
        );
    }

    #[test]
    fn test_dtrace_argv_not_quiet() {
        let engine = DTrace {
            program: "/usr/sbin/dtrace".to_string(),
            quiet: false,
        };
        let argv = with_invocation(|inv| engine.tracer_argv(inv).unwrap());
        assert_eq!(argv[0], "/usr/sbin/dtrace");
        assert!(!argv.contains(&"-q".to_string()));
    }

    #[test]
    fn test_bpftrace_argv() {
        let argv = with_invocation(|inv| Bpftrace::default().tracer_argv(inv).unwrap());
        assert_eq!(argv[0], "bpftrace");
        assert_eq!(argv[4], "ruby -Ilib /tmp/ws/target1.rb");
        assert_eq!(argv.last().unwrap(), "/tmp/ws/probe1.d");
    }

    #[test]
    fn test_template_splices_target() {
        let engine = CommandTemplate::new(argv(&["sh", "{probe}", "{sink}", "{target}"])).unwrap();
        let argv = with_invocation(|inv| engine.tracer_argv(inv).unwrap());
        assert_eq!(
            argv,
            vec![
                "sh",
                "/tmp/ws/probe1.d",
                "/tmp/ws/sink.out",
                "ruby",
                "-Ilib",
                "/tmp/ws/target1.rb"
            ]
        );
    }

    #[test]
    fn test_template_embedded_placeholders() {
        let template = argv(&["tracer", "--out={sink}", "--cmd={target}", "{probe}"]);
        let engine = CommandTemplate::new(template).unwrap();
        let argv = with_invocation(|inv| engine.tracer_argv(inv).unwrap());
        assert_eq!(argv[1], "--out=/tmp/ws/sink.out");
        assert_eq!(argv[2], "--cmd=ruby -Ilib /tmp/ws/target1.rb");
    }

    #[test]
    fn test_template_requires_all_placeholders() {
        let err = CommandTemplate::new(argv(&["sh", "{probe}", "{target}"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("{sink}"));
    }

    #[test]
    fn test_command_string_rejects_whitespace() {
        let err = command_string(&argv(&["ruby", "/tmp/my dir/t.rb"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(command_string(&[]).is_err());
    }

    #[test]
    fn test_parse_child_report_variants() {
        assert_eq!(
            parse_child_report("dtrace: pid 4242 exited with status 3\n", "dtrace"),
            Some(ChildStatus::Exited(3))
        );
        assert_eq!(
            parse_child_report("noise\ndtrace: pid 17 has exited\n", "dtrace"),
            Some(ChildStatus::Exited(0))
        );
        assert_eq!(
            parse_child_report("dtrace: pid 9 terminated by SIGSEGV", "dtrace"),
            Some(ChildStatus::Signaled("SIGSEGV".to_string()))
        );
        assert_eq!(parse_child_report("dtrace: failed to compile script", "dtrace"), None);
        assert_eq!(parse_child_report("dtrace: pid abc exited with status 1", "dtrace"), None);
    }

    #[test]
    fn test_child_report_must_carry_tracer_prefix() {
        // Target output shares the tracer's stderr
        let diag = "worker pid 1 exited with status 0\nrapid 5 exited with status 0\n";
        assert_eq!(parse_child_report(diag, "dtrace"), None);
        assert_eq!(
            parse_child_report("bpftrace: pid 3 exited with status 0", "dtrace"),
            None
        );
        assert_eq!(parse_child_report("dtrace: pid 3 exited with status 0", ""), None);
    }

    #[test]
    fn test_child_report_last_notice_wins() {
        // The target can print a notice-shaped line before the real one
        let diag = "dtrace: pid 1 exited with status 0\ndtrace: pid 77 exited with status 3\n";
        assert_eq!(parse_child_report(diag, "dtrace"), Some(ChildStatus::Exited(3)));
    }

    #[test]
    fn test_template_notice_prefix() {
        let template = argv(&["/opt/bin/stap", "{probe}", "{sink}", "{target}"]);
        let engine = CommandTemplate::new(template).unwrap();
        assert_eq!(engine.notice_prefix(), "stap");

        let engine = engine.with_notice_prefix("fake");
        let diag = "fake: pid 2 exited with status 4\nstap: pid 2 exited with status 0\n";
        assert_eq!(engine.classify(exit(0), diag).unwrap(), ChildStatus::Exited(4));
    }

    #[test]
    fn test_classify_activation_failure() {
        let diag = "dtrace: failed to compile script probe.d: line 1: syntax error near \"{\"";
        let err = DTrace::default().classify(exit(1), diag).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Activation);
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn test_classify_success_without_report() {
        let status = DTrace::default().classify(exit(0), "").unwrap();
        assert_eq!(status, ChildStatus::Unreported);
    }

    #[test]
    fn test_classify_report_wins_over_tracer_status() {
        let status = DTrace::default()
            .classify(exit(1), "dtrace: pid 5 exited with status 2")
            .unwrap();
        assert_eq!(status, ChildStatus::Exited(2));
    }
}
