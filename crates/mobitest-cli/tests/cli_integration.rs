use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn mobitest() -> Command {
    let mut cmd = Command::cargo_bin("mobitest").unwrap();
    cmd.env_remove("MOBITEST_CONFIG").env("RUST_LOG", "off");
    cmd
}

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("mobitest.json");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    mobitest()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("mobitest"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("doctor"));
}

#[test]
fn test_config_show_merges_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(tmp.path(), r#"{ "export_dir": "/tmp/reports", "app": { "bundle_id": "com.example.app" } }"#);

    let assert = mobitest()
        .args(["--config", path.to_str().unwrap(), "config", "show"])
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let config: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(config["export_dir"], "/tmp/reports");
    assert_eq!(config["app"]["bundle_id"], "com.example.app");
    assert_eq!(config["app"]["pkgs_dir"], "pkgs");
    assert_eq!(config["devices"]["ANDROID"]["uri"], "Android:///");
    assert_eq!(config["wda"]["local_port"], 8100);
}

#[test]
fn test_config_from_env_var() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(tmp.path(), r#"{ "export_dir": "from-env" }"#);

    mobitest()
        .env("MOBITEST_CONFIG", &path)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("from-env"));
}

#[test]
fn test_invalid_config_exits_with_config_code() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(tmp.path(), "{ not json");

    mobitest()
        .args(["--config", path.to_str().unwrap(), "config", "show"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_missing_config_file_is_io_error() {
    let tmp = tempfile::tempdir().unwrap();
    let missing = tmp.path().join("absent.json");

    mobitest()
        .args(["--config", missing.to_str().unwrap(), "config", "show"])
        .assert()
        .code(4);
}

#[test]
fn test_config_init_refuses_to_overwrite() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("nested").join("mobitest.json");

    mobitest()
        .args(["config", "init", target.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));
    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&target).unwrap()).unwrap();
    assert_eq!(written["allure"]["result_dir"], "allure_result");

    mobitest()
        .args(["config", "init", target.to_str().unwrap()])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("already exists"));

    mobitest()
        .args(["config", "init", target.to_str().unwrap(), "--force"])
        .assert()
        .success();
}

#[test]
fn test_download_without_url_is_config_error() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(tmp.path(), "{}");

    mobitest()
        .args(["--config", path.to_str().unwrap(), "download", "--version", "2.9.26.19736"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("No download URL configured"));
}

#[test]
fn test_install_on_windows_is_unsupported() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(tmp.path(), "{}");

    mobitest()
        .args([
            "--config",
            path.to_str().unwrap(),
            "install",
            "--platform",
            "windows",
            "--version",
            "1.0.0",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not supported on windows"));
}

#[test]
fn test_device_info_for_unconfigured_platform() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(tmp.path(), "{}");

    mobitest()
        .args(["--config", path.to_str().unwrap(), "device-info", "--platform", "macos"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Unsupported platform"));
}

#[test]
fn test_run_rejects_unknown_device() {
    mobitest()
        .args(["run", "--device", "symbian"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("symbian"));
}

#[test]
fn test_unknown_subcommand() {
    mobitest()
        .arg("totally-fake-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}
