//! Config Integration Tests: `probe-harness.toml` loading and overrides
//!
//! Overrides are exercised through `apply_overrides` with a map instead of
//! mutating the process environment, which other tests in this binary share.

use probe_harness::config::{
    CONFIG_FILE_NAME, ENV_INTERPRETER, ENV_KEEP_FILES, ENV_SUDO, ENV_TIMEOUT_SECS, ENV_TRACER,
};
use probe_harness::{EngineKind, ErrorKind, Harness, HarnessConfig};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(dir: &TempDir, contents: &str) {
    fs::write(dir.path().join(CONFIG_FILE_NAME), contents).expect("write config");
}

fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

/// Test: a missing file means defaults
#[test]
fn test_load_without_file_uses_defaults() {
    let temp = TempDir::new().unwrap();
    let config = HarnessConfig::load(temp.path()).unwrap();
    assert_eq!(config.tracer.engine, EngineKind::Dtrace);
    assert_eq!(config.target.suffix, ".rb");
}

/// Test: every documented key is read from the file
#[test]
fn test_load_full_file() {
    let temp = TempDir::new().unwrap();
    write_config(
        &temp,
        r#"
[tracer]
engine = "command"
argv = ["strace", "-o", "{sink}", "-e", "trace=openat", "{target}", "{probe}"]
sudo = "sudo -n"
timeout_secs = 15
keep_files = true
quiet = false

[target]
interpreter = ["ruby", "-Ilib"]
suffix = ".rb"
"#,
    );

    let config = HarnessConfig::load(temp.path()).unwrap();
    assert_eq!(config.tracer.engine, EngineKind::Command);
    assert_eq!(config.sudo_argv(), vec!["sudo", "-n"]);
    assert_eq!(config.timeout(), Some(Duration::from_secs(15)));
    assert!(config.tracer.keep_files);
    assert!(!config.tracer.quiet);
    assert_eq!(config.target.interpreter, vec!["ruby", "-Ilib"]);

    let harness = Harness::new(config).unwrap();
    assert_eq!(harness.engine().name(), "command");
}

/// Test: a syntax error is a Config error, not a silent default
#[test]
fn test_load_rejects_bad_toml() {
    let temp = TempDir::new().unwrap();
    write_config(&temp, "[tracer\nengine = ");
    let err = HarnessConfig::load(temp.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

/// Test: unknown engines are rejected at parse time
#[test]
fn test_unknown_engine_rejected() {
    let err = HarnessConfig::from_toml_str("[tracer]\nengine = \"systemtap\"\n").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

/// Test: a command template must name all three placeholders
#[test]
fn test_command_template_needs_placeholders() {
    let temp = TempDir::new().unwrap();
    write_config(
        &temp,
        "[tracer]\nengine = \"command\"\nargv = [\"tracer\", \"{probe}\", \"{target}\"]\n",
    );
    let err = HarnessConfig::load(temp.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("{sink}"));
}

/// Test: overrides win over the file
#[test]
fn test_overrides_replace_file_values() {
    let mut config = HarnessConfig::from_toml_str(
        "[tracer]\nsudo = \"sudo -n\"\ntimeout_secs = 15\n[target]\ninterpreter = [\"ruby\"]\n",
    )
    .unwrap();
    config
        .apply_overrides(overrides(&[
            (ENV_SUDO, ""),
            (ENV_TRACER, "/usr/sbin/dtrace"),
            (ENV_TIMEOUT_SECS, "0"),
            (ENV_KEEP_FILES, "yes"),
            (ENV_INTERPRETER, "ruby --disable-gems"),
        ]))
        .unwrap();

    assert!(config.sudo_argv().is_empty());
    assert_eq!(config.tracer.program.as_deref(), Some("/usr/sbin/dtrace"));
    assert_eq!(config.timeout(), None);
    assert!(config.tracer.keep_files);
    assert_eq!(config.target.interpreter, vec!["ruby", "--disable-gems"]);
}

/// Test: malformed override values are Config errors
#[test]
fn test_bad_override_values() {
    let mut config = HarnessConfig::default();
    let err = config
        .apply_overrides(overrides(&[(ENV_TIMEOUT_SECS, "soon")]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    let err = config
        .apply_overrides(overrides(&[(ENV_KEEP_FILES, "maybe")]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}
