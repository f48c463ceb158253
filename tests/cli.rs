//! End-to-end tests for the `moonlink` binary.

use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

fn moonlink(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_moonlink"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run moonlink")
}

fn script(source: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".lua")
        .tempfile()
        .expect("temp script");
    file.write_all(source.as_bytes()).expect("write script");
    file
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_eval_prints_results() {
    let output = moonlink(&["eval", "return 1 + 2, 'three', nil, true"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "3\tthree\tnil\ttrue\n");
}

#[test]
fn test_run_uses_host_environment() {
    let file = script(
        "print('hello', 42)\n\
         host.print('calls so far', host.calls)\n",
    );
    let path = file.path().to_str().unwrap();
    let output = moonlink(&["run", path]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "hello\t42\ncalls so far\t1\n");
}

#[test]
fn test_run_reports_script_errors() {
    let file = script("local x = nil\nerror('broken on purpose')\n");
    let path = file.path().to_str().unwrap();
    let output = moonlink(&["run", path]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("broken on purpose"), "{err}");
    assert!(err.contains(":2:"), "{err}");
}

#[test]
fn test_limit_flag_is_honored() {
    let output = moonlink(&["eval", "--limit", "1000", "while true do end"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("execution quantum exceeded"), "{err}");

    let output = moonlink(&[
        "eval",
        "--limit",
        "100000",
        "local s = 0 for i = 1, 10 do s = s + i end return s",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "55\n");
}

#[test]
fn test_hide_pcall_flag() {
    let output = moonlink(&[
        "eval",
        "--hide-pcall",
        "return pcall == nil, type(unsafe_pcall)",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "true\tfunction\n");
}

#[test]
fn test_config_file_and_flag_overrides() {
    let mut config = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("temp config");
    config
        .write_all(br#"{ "disabled_globals": ["os"], "execution_limit": 1000 }"#)
        .expect("write config");
    let path = config.path().to_str().unwrap();

    let output = moonlink(&["eval", "--config", path, "--disable", "io", "return os, io"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "nil\tnil\n");

    let output = moonlink(&["eval", "--config", path, "while true do end"]);
    assert!(!output.status.success());

    let output = moonlink(&[
        "eval",
        "--config",
        path,
        "--limit",
        "0",
        "local n = 0 for i = 1, 100000 do n = n + 1 end return n",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "100000\n");
}

#[test]
fn test_memory_limit_flag() {
    let output = moonlink(&[
        "eval",
        "--memory-limit",
        "4194304",
        "return #string.rep('x', 64 * 1024 * 1024)",
    ]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("memory"), "{}", stderr(&output));
}
