mod support;

use std::fs;

use assert_cmd::Command;
use pkgwc::package::Package;
use pkgwc::project::{Project, ProjectUpdateOptions};
use predicates::str::contains;

use support::{context, Checkout, MockServer, PROJECT};

fn pkgwc() -> Command {
    let mut cmd = Command::cargo_bin("pkgwc").expect("binary");
    cmd.env_remove("PKGWC_DIR").env_remove("RUST_LOG");
    cmd
}

fn checkout() -> (std::sync::Arc<MockServer>, Checkout) {
    let server = MockServer::new();
    server.add_package(
        PROJECT,
        "foo",
        &[("foo.spec", "Name: foo\n"), ("README", "hello\n")],
    );
    let wc = Checkout::new(&server, "foo");
    (server, wc)
}

#[test]
fn pkgwc_help_works() {
    pkgwc()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("package build service"));
}

#[test]
fn subcommand_help_works() {
    for cmd in ["status", "add", "rm", "revert", "resolved", "check"] {
        pkgwc().arg(cmd).arg("--help").assert().success();
    }
}

#[test]
fn status_reports_json() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, wc) = checkout();
    wc.write("foo.spec", "Name: foo\nVersion: 2\n");

    pkgwc()
        .arg("-C")
        .arg(wc.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"schema_version\": \"pkgwc.v1\""))
        .stdout(contains("\"command\": \"status\""))
        .stdout(contains("\"code\": \"M\""))
        .stdout(contains("\"rev\": \"1\""));
    Ok(())
}

#[test]
fn add_and_rm_update_pending_sets() -> Result<(), Box<dyn std::error::Error>> {
    let (server, wc) = checkout();
    wc.write("fix.patch", "+fix\n");

    pkgwc()
        .arg("-C")
        .arg(wc.path())
        .args(["add", "fix.patch"])
        .assert()
        .success()
        .stdout(contains("A    fix.patch"));
    pkgwc()
        .arg("-C")
        .arg(wc.path())
        .args(["rm", "README"])
        .assert()
        .success();

    let package = Package::open(wc.path(), context(&server))?;
    assert_eq!(package.to_be_added(), ["fix.patch".to_string()]);
    assert_eq!(package.to_be_deleted(), ["README".to_string()]);
    assert!(!wc.exists("README"));
    Ok(())
}

#[test]
fn rm_keeps_modified_files_without_force() {
    let (_server, wc) = checkout();
    wc.write("foo.spec", "edited\n");

    pkgwc()
        .arg("-C")
        .arg(wc.path())
        .args(["rm", "foo.spec"])
        .assert()
        .success()
        .stdout(contains("kept files with local changes"));
    assert_eq!(wc.read("foo.spec"), "edited\n");
}

#[test]
fn revert_of_unknown_file_is_a_user_error() {
    let (_server, wc) = checkout();

    pkgwc()
        .arg("-C")
        .arg(wc.path())
        .args(["revert", "nothing.txt"])
        .assert()
        .code(2)
        .stderr(contains("error:"));
}

#[test]
fn check_reports_inconsistency() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, wc) = checkout();

    pkgwc()
        .arg("-C")
        .arg(wc.path())
        .arg("check")
        .assert()
        .success()
        .stdout(contains("is consistent"));

    fs::remove_file(wc.package.store().source_path("README"))?;
    pkgwc()
        .arg("-C")
        .arg(wc.path())
        .args(["check", "--json"])
        .assert()
        .code(4)
        .stdout(contains("\"kind\": \"operation_failed\""))
        .stdout(contains("\"command\": \"check\""));
    Ok(())
}

#[test]
fn outside_a_working_copy_is_a_user_error() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    pkgwc()
        .arg("-C")
        .arg(dir.path())
        .arg("status")
        .assert()
        .code(2)
        .stderr(contains("Not a working copy"));
    Ok(())
}

#[test]
fn project_status_lists_packages() -> Result<(), Box<dyn std::error::Error>> {
    let server = MockServer::new();
    server.add_package(PROJECT, "foo", &[("foo.spec", "Name: foo\n")]);
    let dir = tempfile::tempdir()?;
    let (mut project, _) = Project::checkout(
        dir.path(),
        context(&server),
        PROJECT,
        &ProjectUpdateOptions::default(),
    )?;
    project.add_package("fresh")?;
    fs::create_dir(dir.path().join("fresh"))?;

    pkgwc()
        .arg("-C")
        .arg(dir.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"kind\": \"project\""))
        .stdout(contains("\"name\": \"fresh\""))
        .stdout(contains("\"code\": \"A\""));
    Ok(())
}
