use std::fs;
use std::path::Path;

use assert_cmd::Command;
use dock_runtime::package::layout::bundle_file_name;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_package(root: &Path, package: &str) {
    let manifests = root.join(package).join("config");
    fs::create_dir_all(&manifests).unwrap();
    fs::write(
        manifests.join("x.json"),
        r#"{"moduleClass": "repoA::X", "address": "/x.v1", "initClass": "repoA::Init"}"#,
    )
    .unwrap();

    let build = root.join(package).join("build");
    fs::create_dir_all(&build).unwrap();
    fs::write(build.join(bundle_file_name(package)), b"").unwrap();
}

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("dock").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve").and(predicate::str::contains("check")));
}

#[test]
fn test_check_prints_module_table() {
    let dir = TempDir::new().unwrap();
    write_package(dir.path(), "repoA");

    let mut cmd = Command::cargo_bin("dock").unwrap();
    cmd.arg("check")
        .arg("repoA")
        .arg("--packages-root")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Package repoA is deployable")
                .and(predicate::str::contains("x.v1"))
                .and(predicate::str::contains("repoA::X"))
                .and(predicate::str::contains("shared initializer: repoA::Init")),
        );
}

#[test]
fn test_check_reports_missing_bundle() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("repoA/config")).unwrap();

    let mut cmd = Command::cargo_bin("dock").unwrap();
    cmd.arg("check")
        .arg("repoA")
        .arg("--packages-root")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing bundle"));
}

#[test]
fn test_check_with_config_file() {
    let dir = TempDir::new().unwrap();
    let packages = dir.path().join("packages");
    write_package(&packages, "repoA");

    let config = dir.path().join("dock.toml");
    fs::write(
        &config,
        format!("packages_root = {:?}\n", packages.display().to_string()),
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("dock").unwrap();
    cmd.arg("check")
        .arg("repoA")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("x.v1"));
}
