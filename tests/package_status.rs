mod support;

use std::fs;

use pkgwc::error::Error;
use pkgwc::package::Package;
use pkgwc::status::FileStatus;

use support::{context, Checkout, MockServer, PROJECT};

fn server() -> std::sync::Arc<MockServer> {
    let server = MockServer::new();
    server.add_package(
        PROJECT,
        "foo",
        &[("foo.spec", "Name: foo\nVersion: 1\n"), ("README", "hello\n")],
    );
    server
}

#[test]
fn checkout_materializes_every_file() -> Result<(), Box<dyn std::error::Error>> {
    let server = server();
    let wc = Checkout::new(&server, "foo");

    assert_eq!(wc.package.rev(), Some("1"));
    assert_eq!(wc.read("README"), "hello\n");
    assert_eq!(wc.pristine("foo.spec"), "Name: foo\nVersion: 1\n");
    assert_eq!(
        wc.package.status_all()?,
        vec![
            (FileStatus::Unchanged, "README".to_string()),
            (FileStatus::Unchanged, "foo.spec".to_string()),
        ]
    );
    assert!(wc.package.check()?.is_empty());
    Ok(())
}

#[test]
fn status_follows_local_edits() -> Result<(), Box<dyn std::error::Error>> {
    let server = server();
    let mut wc = Checkout::new(&server, "foo");

    wc.write("foo.spec", "Name: foo\nVersion: 2\n");
    fs::remove_file(wc.path().join("README"))?;
    wc.write("extra.patch", "--- a\n+++ b\n");

    assert_eq!(wc.package.status("foo.spec")?, FileStatus::Modified);
    assert_eq!(wc.package.status("README")?, FileStatus::Missing);
    assert_eq!(wc.package.status("extra.patch")?, FileStatus::Unversioned);

    assert_eq!(wc.package.add_file("extra.patch")?, FileStatus::Added);
    let outcome = wc.package.delete_file("README", false)?;
    assert!(outcome.deleted);
    assert_eq!(outcome.status, FileStatus::Missing);
    assert_eq!(wc.package.status("README")?, FileStatus::Deleted);
    assert_eq!(wc.package.to_be_deleted(), ["README".to_string()]);
    Ok(())
}

#[test]
fn same_size_edit_is_detected_by_checksum() -> Result<(), Box<dyn std::error::Error>> {
    let server = server();
    let wc = Checkout::new(&server, "foo");

    wc.write("README", "jello\n");
    assert_eq!(wc.package.status("README")?, FileStatus::Modified);
    wc.write("README", "hello\n");
    assert_eq!(wc.package.status("README")?, FileStatus::Unchanged);
    Ok(())
}

#[test]
fn adding_over_a_pending_delete_is_a_replace() -> Result<(), Box<dyn std::error::Error>> {
    let server = server();
    let mut wc = Checkout::new(&server, "foo");

    assert!(wc.package.delete_file("foo.spec", false)?.deleted);
    assert!(!wc.exists("foo.spec"));
    wc.write("foo.spec", "Name: foo\nVersion: 3\n");
    assert_eq!(wc.package.add_file("foo.spec")?, FileStatus::Replaced);
    assert!(wc.package.to_be_deleted().is_empty());

    assert!(matches!(
        wc.package.add_file("README"),
        Err(Error::PackageFileConflict { .. })
    ));
    Ok(())
}

#[test]
fn delete_keeps_local_changes_unless_forced() -> Result<(), Box<dyn std::error::Error>> {
    let server = server();
    let mut wc = Checkout::new(&server, "foo");
    wc.write("foo.spec", "edited\n");

    let outcome = wc.package.delete_file("foo.spec", false)?;
    assert!(!outcome.deleted);
    assert_eq!(outcome.status, FileStatus::Modified);
    assert_eq!(wc.read("foo.spec"), "edited\n");

    let outcome = wc.package.delete_file("foo.spec", true)?;
    assert!(outcome.deleted);
    assert!(!wc.exists("foo.spec"));
    assert_eq!(wc.package.status("foo.spec")?, FileStatus::Deleted);
    Ok(())
}

#[test]
fn deleting_a_pending_add_forgets_it() -> Result<(), Box<dyn std::error::Error>> {
    let server = server();
    let mut wc = Checkout::new(&server, "foo");
    wc.write("new.txt", "fresh\n");
    wc.package.add_file("new.txt")?;

    let outcome = wc.package.delete_file("new.txt", true)?;
    assert!(outcome.deleted);
    assert!(wc.package.to_be_added().is_empty());
    assert!(wc.package.to_be_deleted().is_empty());
    assert!(!wc.exists("new.txt"));
    Ok(())
}

#[test]
fn revert_restores_pristine_content() -> Result<(), Box<dyn std::error::Error>> {
    let server = server();
    let mut wc = Checkout::new(&server, "foo");

    wc.write("foo.spec", "broken\n");
    wc.package.revert("foo.spec")?;
    assert_eq!(wc.read("foo.spec"), "Name: foo\nVersion: 1\n");

    wc.package.delete_file("README", false)?;
    wc.package.revert("README")?;
    assert_eq!(wc.read("README"), "hello\n");
    assert_eq!(wc.package.status("README")?, FileStatus::Unchanged);

    wc.write("new.txt", "fresh\n");
    wc.package.add_file("new.txt")?;
    wc.package.revert("new.txt")?;
    assert_eq!(wc.read("new.txt"), "fresh\n");
    assert_eq!(wc.package.status("new.txt")?, FileStatus::Unversioned);

    assert!(matches!(
        wc.package.revert("nothing.txt"),
        Err(Error::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn pending_sets_survive_reopening() -> Result<(), Box<dyn std::error::Error>> {
    let server = server();
    let mut wc = Checkout::new(&server, "foo");
    wc.write("new.txt", "fresh\n");
    wc.package.add_file("new.txt")?;
    wc.package.delete_file("README", false)?;

    let reopened = Package::open(wc.path(), context(&server))?;
    assert_eq!(reopened.to_be_added(), ["new.txt".to_string()]);
    assert_eq!(reopened.to_be_deleted(), ["README".to_string()]);

    wc.package.revert("README")?;
    let reopened = Package::open(wc.path(), context(&server))?;
    assert!(reopened.to_be_deleted().is_empty());
    assert!(!reopened.store().key_path("_to_be_deleted").exists());
    Ok(())
}

#[test]
fn hidden_files_are_not_unversioned() -> Result<(), Box<dyn std::error::Error>> {
    let server = server();
    let wc = Checkout::new(&server, "foo");
    wc.write(".hidden", "x");
    wc.write("backup~", "x");
    wc.write("notes.txt", "x");

    assert_eq!(wc.package.unversioned()?, vec!["notes.txt".to_string()]);
    Ok(())
}

#[test]
fn missing_pristine_copy_is_repaired() -> Result<(), Box<dyn std::error::Error>> {
    let server = server();
    let wc = Checkout::new(&server, "foo");
    let path = wc.path();
    fs::remove_file(wc.package.store().source_path("README"))?;
    fs::write(wc.package.store().source_path("stray"), "x")?;

    match Package::open(&path, context(&server)) {
        Err(Error::WorkingCopyInconsistent { files, .. }) => {
            assert_eq!(files, vec!["README".to_string(), "stray".to_string()]);
        }
        other => panic!("expected an inconsistent working copy, got {other:?}"),
    }

    let mut package = Package::open_unchecked(&path, context(&server))?;
    let repaired = package.repair()?;
    assert_eq!(repaired, vec!["README".to_string(), "stray".to_string()]);
    assert!(package.check()?.is_empty());
    assert_eq!(wc.pristine("README"), "hello\n");
    assert!(!package.store().has_source("stray"));
    Ok(())
}
