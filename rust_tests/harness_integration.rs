//! Harness Integration Tests: spawn-under-trace end to end
//!
//! A `/bin/sh` stand-in plays the tracer so these run without DTrace or
//! root. It launches the target itself, copies every `probe:` line the
//! target prints into the sink and reports the child's exit the way DTrace
//! does on stderr.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use probe_harness::logging::init_for_tests;
use probe_harness::{
    error_kind, trap_probe, ChildStatus, EngineKind, ErrorKind, Harness, HarnessConfig,
};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const FAKE_TRACER: &str = r#"sink="$1"; shift
"$@" > "$sink.raw"
status=$?
sed -n 's/^probe://p' "$sink.raw" > "$sink"
rm -f "$sink.raw"
echo "fake: pid $$ exited with status $status" >&2
"#;

/// Emits `<class> <file> <line>` per "allocation", like object-create-start
const TEN_ALLOCATIONS: &str = r#"i=0
while [ $i -lt 10 ]; do
  echo "probe:Object $0 3"
  i=$((i + 1))
done
echo "probe:Prelude /usr/lib/prelude.sh 1"
"#;

fn config(timeout_secs: u64) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.tracer.engine = EngineKind::Command;
    config.tracer.argv = ["sh", "{probe}", "{sink}", "{target}"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    config.tracer.notice_prefix = Some("fake".to_string());
    config.tracer.timeout_secs = timeout_secs;
    config.target.interpreter = vec!["sh".to_string()];
    config.target.suffix = ".sh".to_string();
    config
}

fn harness() -> Harness {
    init_for_tests();
    Harness::new(config(30)).expect("valid harness config")
}

/// Captured lines with the per-invocation target path masked out
fn masked_lines(lines: &[String], target: &Path) -> Vec<String> {
    let target = target.to_string_lossy();
    lines.iter().map(|line| line.replace(&*target, "<target>")).collect()
}

fn read_pid(path: &Path) -> i32 {
    fs::read_to_string(path)
        .expect("pid file written by target")
        .trim()
        .parse()
        .expect("numeric pid")
}

/// True once `pid` no longer runs: gone, or a zombie awaiting its new parent
fn wait_gone(pid: i32) -> bool {
    let until = Instant::now() + Duration::from_secs(5);
    while Instant::now() < until {
        if kill(Pid::from_raw(pid), None) == Err(Errno::ESRCH) {
            return true;
        }
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap_or_default();
        if stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z'))
        {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Test: every event raised by the target arrives as one line, in order
#[test]
fn test_ten_events_ten_lines() {
    let harness = harness();
    let record = harness.activate(FAKE_TRACER, TEN_ALLOCATIONS).unwrap();

    assert_eq!(record.lines().len(), 11);
    let mine = record.rows_in_target(1);
    assert_eq!(mine.len(), 10);
    for row in &mine {
        assert_eq!(row[0], "Object");
        assert_eq!(row[2], "3");
    }
    assert_eq!(record.child_status(), &ChildStatus::Exited(0));
}

/// Test: the file field printed by the target is the exact materialized path
#[test]
fn test_reported_file_is_target_path() {
    let harness = harness();
    trap_probe(&harness, FAKE_TRACER, "echo \"probe:Hash $0 1\"\n", |_, target, lines| {
        let rows: Vec<Vec<&str>> = lines.iter().map(|l| l.split_whitespace().collect()).collect();
        anyhow::ensure!(rows.len() == 1, "expected one event, got {:?}", lines);
        anyhow::ensure!(rows[0][0] == "Hash");
        anyhow::ensure!(rows[0][1] == target.to_string_lossy());
        anyhow::ensure!(rows[0][2] == "1");
        Ok(())
    })
    .unwrap();
}

/// Test: repeated invocations are independent and materialize fresh files
#[test]
fn test_repeated_invocations_are_idempotent() {
    let harness = harness();
    let first = harness.activate(FAKE_TRACER, TEN_ALLOCATIONS).unwrap();
    let second = harness.activate(FAKE_TRACER, TEN_ALLOCATIONS).unwrap();

    assert_ne!(first.invocation_id(), second.invocation_id());
    assert_ne!(first.target_file(), second.target_file());
    assert_ne!(first.tracer_file(), second.tracer_file());
    assert_eq!(
        masked_lines(first.lines(), first.target_file()),
        masked_lines(second.lines(), second.target_file())
    );
    assert_eq!(first.child_status(), second.child_status());
}

/// Test: a target that raises nothing yields an empty, successful capture
#[test]
fn test_no_events_is_empty_capture() {
    let harness = harness();
    let record = harness.activate(FAKE_TRACER, "true\n").unwrap();
    assert!(record.lines().is_empty());
    assert!(record.ensure_child_success().is_ok());
}

/// Test: an unparseable probe is an activation failure, not an empty capture
#[test]
fn test_probe_compile_failure() {
    let harness = harness();
    let broken = "echo 'dtrace: failed to compile script probe.d: line 1: syntax error' >&2
exit 1
";
    let err = harness.activate(broken, TEN_ALLOCATIONS).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Activation);
    assert!(err.to_string().contains("failed to compile"));
}

/// Test: a failing target still yields its events, and the failure is visible
#[test]
fn test_failing_target_reports_child_status() {
    let harness = harness();
    let record = harness
        .activate(FAKE_TRACER, "echo \"probe:Array $0 1\"\nexit 3\n")
        .unwrap();
    assert_eq!(record.lines().len(), 1);
    assert_eq!(record.child_status(), &ChildStatus::Exited(3));

    let err = record.ensure_child_success().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChildExecution);
    assert!(err.to_string().contains("exited with status 3"));
}

/// Test: a hung target is killed at the deadline
#[test]
fn test_deadline_kills_hung_target() {
    init_for_tests();
    let harness = Harness::new(config(1)).unwrap();
    let started = Instant::now();
    let err = harness.activate(FAKE_TRACER, "sleep 30\n").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(20));
}

/// Test: after a timeout neither the target nor its children keep running
#[test]
fn test_deadline_leaves_no_processes() {
    init_for_tests();
    let pids = TempDir::new().unwrap();
    let target_pid = pids.path().join("target.pid");
    let sleep_pid = pids.path().join("sleep.pid");
    let program = format!(
        "echo $$ > {}\nsleep 30 &\necho $! > {}\nwait\n",
        target_pid.display(),
        sleep_pid.display()
    );

    let harness = Harness::new(config(2)).unwrap();
    let err = harness.activate(FAKE_TRACER, &program).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    for pid_file in [&target_pid, &sleep_pid] {
        let pid = read_pid(pid_file);
        assert!(wait_gone(pid), "pid {} from {:?} outlived the timeout", pid, pid_file);
    }
}

/// Test: the timeout surfaces through the scenario driver with its kind intact
#[test]
fn test_scenario_driver_keeps_timeout_kind() {
    init_for_tests();
    let harness = Harness::new(config(1)).unwrap();
    let err = trap_probe(&harness, FAKE_TRACER, "sleep 30\n", |_, _, _| Ok(())).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Timeout));
}

/// Test: concurrent invocations never see each other's events
#[test]
fn test_concurrent_invocations_do_not_mix() {
    let harness = harness();
    let targets: Vec<(usize, Vec<String>, PathBuf)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let harness = &harness;
                scope.spawn(move || {
                    let program = format!(
                        "for n in 1 2 3 4 5; do echo \"probe:worker-{} $0 $n\"; done\n",
                        worker
                    );
                    let record = harness.activate(FAKE_TRACER, &program).unwrap();
                    (
                        worker,
                        record.lines().to_vec(),
                        record.target_file().to_path_buf(),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut paths = HashSet::new();
    for (worker, lines, target) in &targets {
        assert_eq!(lines.len(), 5);
        let tag = format!("worker-{}", worker);
        for line in lines {
            let row: Vec<&str> = line.split_whitespace().collect();
            assert_eq!(row[0], tag);
            assert_eq!(row[1], target.to_string_lossy());
        }
        assert!(paths.insert(target.clone()), "target path reused");
    }
}

/// Test: the default DTrace engine names the tracer file with a `.d` suffix
#[test]
fn test_default_engine_is_dtrace() {
    let mut config = HarnessConfig::default();
    config.target.interpreter = vec!["sh".to_string()];
    let harness = Harness::new(config).unwrap();
    assert_eq!(harness.engine().name(), "dtrace");
    assert_eq!(harness.engine().probe_suffix(), ".d");
}
