//! Black-box tests against the `ota-engine` binary's filesystem-only
//! subcommands (`swap`, `recover`). `resolve` and `run` both talk to a
//! real repository host and are exercised at the library level instead
//! (see `src/resolver.rs`, `src/engine.rs`).

use predicates::str::contains;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn write_config(root: &Path) -> std::path::PathBuf {
    let path = root.join("ota.toml");
    fs::write(
        &path,
        r#"
            owner = "acme"
            repo = "widget"
            stage_dir = ".ota_stage"
            backup_dir = ".ota_backup"
        "#,
    )
    .unwrap();
    path
}

#[test]
fn swap_promotes_staged_file_and_writes_version_record() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config_path = write_config(root);
    fs::write(root.join("version.json"), r#"{"ref":"v1","commit":"aaa"}"#).unwrap();
    fs::create_dir_all(root.join(".ota_stage")).unwrap();
    fs::write(root.join(".ota_stage/app.bin"), b"new payload").unwrap();

    let mut cmd = assert_cmd::Command::cargo_bin("ota-engine").unwrap();
    cmd.arg("--config").arg(&config_path).arg("--root").arg(root).arg("swap");
    cmd.assert().success();

    assert_eq!(fs::read(root.join("app.bin")).unwrap(), b"new payload");
    assert!(!root.join(".ota_stage").exists());
    assert!(!root.join(".ota_backup").exists());
}

#[test]
fn swap_without_prior_version_record_fails() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config_path = write_config(root);
    fs::create_dir_all(root.join(".ota_stage")).unwrap();
    fs::write(root.join(".ota_stage/app.bin"), b"new payload").unwrap();

    let mut cmd = assert_cmd::Command::cargo_bin("ota-engine").unwrap();
    cmd.arg("--config").arg(&config_path).arg("--root").arg(root).arg("swap");
    cmd.assert().failure();
}

#[test]
fn recover_restores_interrupted_swap_from_backup() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config_path = write_config(root);
    fs::create_dir_all(root.join(".ota_backup")).unwrap();
    fs::write(root.join(".ota_backup/app.bin"), b"pre-swap content").unwrap();
    fs::create_dir_all(root.join(".ota_stage")).unwrap();
    fs::write(root.join(".ota_stage/leftover.bin.tmp"), b"partial write").unwrap();

    let mut cmd = assert_cmd::Command::cargo_bin("ota-engine").unwrap();
    cmd.arg("--config").arg(&config_path).arg("--root").arg(root).arg("recover");
    cmd.assert().success();

    assert_eq!(fs::read(root.join("app.bin")).unwrap(), b"pre-swap content");
    assert!(!root.join(".ota_backup").exists());
    assert!(!root.join(".ota_stage").exists());
}

#[test]
fn rejects_config_with_placeholder_owner() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config_path = root.join("ota.toml");
    fs::write(&config_path, "owner = \"OWNER\"\nrepo = \"widget\"\n").unwrap();

    let mut cmd = assert_cmd::Command::cargo_bin("ota-engine").unwrap();
    cmd.arg("--config").arg(&config_path).arg("--root").arg(root).arg("recover");
    cmd.assert().failure().stderr(contains("placeholder"));
}
