//! DTrace Integration Tests: Ruby USDT probes under a real tracer
//!
//! These need `dtrace`, a Ruby built with DTrace probes and the privileges
//! to trace, so they are ignored by default:
//!
//! ```text
//! PROBE_HARNESS_SUDO="sudo -n" cargo test --test dtrace_integration -- --ignored
//! ```
//!
//! Configuration comes from `probe-harness.toml` at the crate root (if
//! present) and `PROBE_HARNESS_*` variables.

use anyhow::ensure;
use probe_harness::logging::init_for_tests;
use probe_harness::{trap_probe, Harness};
use std::path::Path;

const OBJECT_CREATE_START: &str = r#"ruby$target:::object-create-start
{
  printf("%s %s %d\n", copyinstr(arg0), copyinstr(arg1), arg2);
}
"#;

const FUNCTION_ENTRY: &str = r#"ruby$target:::function-entry
/strstr(copyinstr(arg0), "Foo") != NULL/
{
  printf("%s %s %s %d\n", copyinstr(arg0), copyinstr(arg1), copyinstr(arg2), arg3);
}
"#;

const FUNCTION_RETURN: &str = r#"ruby$target:::function-return
{
  printf("%s %s %s %d\n", copyinstr(arg0), copyinstr(arg1), copyinstr(arg2), arg3);
}
"#;

const SINGLETON_PROGRAM: &str = "class Foo
  def self.foo; end
end
10.times { Foo.foo }
";

fn harness() -> Harness {
    init_for_tests();
    Harness::from_root(Path::new(env!("CARGO_MANIFEST_DIR"))).expect("harness config")
}

/// Rows whose `column` is the target file
fn rows_in<'a>(lines: &'a [String], column: usize, target: &Path) -> Vec<Vec<&'a str>> {
    let target = target.to_string_lossy();
    lines
        .iter()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|row| row.get(column).is_some_and(|field| *field == target))
        .collect()
}

/// A literal on line 1 allocates exactly one `class` object there
fn assert_single_allocation(program: &str, class: &str) {
    trap_probe(&harness(), OBJECT_CREATE_START, program, |_, target, lines| {
        let rows = rows_in(lines, 1, target);
        let classes: Vec<&str> = rows.iter().map(|row| row[0]).collect();
        ensure!(classes == [class], "expected [{}], got {:?}", class, classes);
        ensure!(rows[0][2] == "1", "expected line 1, got {:?}", rows[0]);
        Ok(())
    })
    .unwrap();
}

#[test]
#[ignore = "requires dtrace and a probe-enabled ruby"]
fn test_object_create_start() {
    trap_probe(&harness(), OBJECT_CREATE_START, "10.times { Object.new }", |_, target, lines| {
        let rows = rows_in(lines, 1, target);
        ensure!(rows.len() == 10, "expected 10 allocations, got {}", rows.len());
        Ok(())
    })
    .unwrap();
}

#[test]
#[ignore = "requires dtrace and a probe-enabled ruby"]
fn test_object_create_start_name() {
    assert_single_allocation("Hash.new", "Hash");
}

#[test]
#[ignore = "requires dtrace and a probe-enabled ruby"]
fn test_object_create_start_hash_lit() {
    assert_single_allocation("{}", "Hash");
}

#[test]
#[ignore = "requires dtrace and a probe-enabled ruby"]
fn test_object_create_start_array_lit() {
    assert_single_allocation("[]", "Array");
}

#[test]
#[ignore = "requires dtrace and a probe-enabled ruby"]
fn test_object_create_start_string_lit() {
    assert_single_allocation("\"omg\"", "String");
}

fn assert_foo_calls(probe: &str) {
    trap_probe(&harness(), probe, SINGLETON_PROGRAM, |_, target, lines| {
        let target = target.to_string_lossy();
        let calls: Vec<Vec<&str>> = lines
            .iter()
            .map(|line| line.split_whitespace().collect::<Vec<_>>())
            .filter(|row| row.first() == Some(&"#<Class:Foo>") && row.get(1) == Some(&"foo"))
            .collect();
        ensure!(calls.len() == 10, "expected 10 calls, got {}", calls.len());
        for call in &calls {
            ensure!(call[2] == target, "file field {:?} is not the target", call[2]);
            ensure!(call[3] == "2", "line field {:?} is not 2", call[3]);
        }
        Ok(())
    })
    .unwrap();
}

#[test]
#[ignore = "requires dtrace and a probe-enabled ruby"]
fn test_singleton_function_entry() {
    assert_foo_calls(FUNCTION_ENTRY);
}

#[test]
#[ignore = "requires dtrace and a probe-enabled ruby"]
fn test_singleton_function_return() {
    assert_foo_calls(FUNCTION_RETURN);
}
