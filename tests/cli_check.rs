#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

const FAKE_TECTONIC: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/fixtures/fake-tectonic.sh"
);

fn workspace(source: &str) -> TempDir {
    std::fs::set_permissions(FAKE_TECTONIC, std::fs::Permissions::from_mode(0o755))
        .expect("set perms");
    let dir = TempDir::new().expect("temp dir");
    std::fs::create_dir_all(dir.path().join("assets")).expect("assets dir");
    std::fs::write(dir.path().join("assets/health_check.tex"), source).expect("health source");
    dir
}

fn check_command(dir: &Path, program: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("latex-compiler"));
    cmd.current_dir(dir)
        .env("RUST_LOG", "info")
        .arg("check")
        .arg("--compiler-program")
        .arg(program)
        .arg("--compiler-work-dir")
        .arg(dir.join("uploads"))
        .arg("--compiler-health-check-source")
        .arg(dir.join("assets/health_check.tex"));
    cmd
}

#[test]
fn check_passes_with_working_toolchain() {
    let dir = workspace("\\documentclass{article}\\begin{document}ok\\end{document}");

    check_command(dir.path(), Path::new(FAKE_TECTONIC))
        .assert()
        .success()
        .stdout(contains("Toolchain self-check finished"));

    assert!(dir.path().join("assets/health_check.tex").exists());
    assert!(!dir.path().join("assets/health_check.pdf").exists());
    assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
}

#[test]
fn check_passes_with_read_only_assets() {
    let dir = workspace("\\documentclass{article}\\begin{document}ok\\end{document}");
    let assets = dir.path().join("assets");
    std::fs::set_permissions(&assets, std::fs::Permissions::from_mode(0o555)).expect("read-only");

    let assert = check_command(dir.path(), Path::new(FAKE_TECTONIC)).assert();
    std::fs::set_permissions(&assets, std::fs::Permissions::from_mode(0o755)).expect("restore");

    assert.success();
    assert_eq!(std::fs::read_dir(&assets).unwrap().count(), 1);
}

#[test]
fn check_fails_when_document_does_not_compile() {
    let dir = workspace("\\documentclass{article}\\begin{document}broken");

    check_command(dir.path(), Path::new(FAKE_TECTONIC))
        .assert()
        .failure()
        .code(1);
}

#[test]
fn check_fails_without_toolchain() {
    let dir = workspace("\\documentclass{article}\\begin{document}ok\\end{document}");

    check_command(dir.path(), &dir.path().join("does-not-exist"))
        .assert()
        .failure();
}
