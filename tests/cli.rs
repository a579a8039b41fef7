//! Command-line tests for the `kpf` binary that need no cluster.

use std::process::Command;

fn kpf() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_kpf"));
    // Keep the user's real config and kube context out of the picture.
    let config_home = std::env::temp_dir().join("kpf-cli-test-config");
    cmd.env("XDG_CONFIG_HOME", config_home)
        .env_remove("KPF_CONTEXT")
        .env_remove("KPF_NAMESPACE");
    cmd
}

#[test]
fn test_version() {
    let output = kpf().arg("--version").output().expect("failed to run kpf");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("kpf "), "unexpected version output: {stdout}");
}

#[test]
fn test_help_lists_subcommands() {
    let output = kpf().arg("--help").output().expect("failed to run kpf");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("mcp"));
    assert!(stdout.contains("forward"));
    assert!(stdout.contains("--namespace"));
}

#[test]
fn test_forward_rejects_bad_target_before_connecting() {
    let output = kpf()
        .args(["forward", "deployment/web", "8080:80"])
        .output()
        .expect("failed to run kpf");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("deployment"), "stderr: {stderr}");
}

#[test]
fn test_forward_rejects_bad_ports_before_connecting() {
    let output = kpf()
        .args(["forward", "pod/web", "0:80"])
        .output()
        .expect("failed to run kpf");
    assert!(!output.status.success());
}

#[test]
fn test_missing_explicit_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let output = kpf()
        .args(["forward", "pod/web", "8080"])
        .arg("--config")
        .arg(&missing)
        .output()
        .expect("failed to run kpf");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nope.toml"), "stderr: {stderr}");
}
