//! pkgwc add / rm / revert / resolved
//!
//! All four act on a list of files in one package checkout and report the
//! resulting status of each file.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::Result;
use crate::output::{emit_success, Listing, OutputOptions};
use crate::package::Package;

#[derive(Debug, Clone, Copy)]
pub enum FileAction {
    Add,
    Remove { force: bool },
    Revert,
    Resolved,
}

impl FileAction {
    fn command(self) -> &'static str {
        match self {
            FileAction::Add => "add",
            FileAction::Remove { .. } => "rm",
            FileAction::Revert => "revert",
            FileAction::Resolved => "resolved",
        }
    }
}

pub struct FileOptions {
    pub dir: PathBuf,
    pub files: Vec<String>,
    pub action: FileAction,
    pub output: OutputOptions,
}

#[derive(Serialize)]
struct FileResult {
    name: String,
    changed: bool,
    code: char,
}

#[derive(Serialize)]
struct FileReport {
    package: String,
    files: Vec<FileResult>,
}

pub fn run(options: FileOptions) -> Result<()> {
    let ctx = super::offline_context(&options.dir)?;
    let mut package = Package::open(&options.dir, ctx)?;
    let command = options.action.command();

    let mut results = Vec::new();
    let mut skipped = Vec::new();
    for name in &options.files {
        let changed = match options.action {
            FileAction::Add => {
                package.add_file(name)?;
                true
            }
            FileAction::Remove { force } => {
                let outcome = package.delete_file(name, force)?;
                if !outcome.deleted {
                    skipped.push(format!("{name} ({})", outcome.status.code()));
                }
                outcome.deleted
            }
            FileAction::Revert => {
                package.revert(name)?;
                true
            }
            FileAction::Resolved => {
                package.resolved(name)?;
                true
            }
        };
        let code = package.status(name).map(|s| s.code()).unwrap_or(' ');
        results.push(FileResult {
            name: name.clone(),
            changed,
            code,
        });
    }

    let mut listing = Listing::new(format!(
        "pkgwc {command}: {} file(s) in {}",
        results.iter().filter(|r| r.changed).count(),
        package.name()
    ));
    for result in results.iter().filter(|r| r.changed) {
        listing.entry(result.code, result.name.clone());
    }
    if !skipped.is_empty() {
        listing.warn(format!("kept files with local changes: {}", skipped.join(", ")));
        listing.hint("pkgwc rm --force <file>");
    }

    let report = FileReport {
        package: package.name().to_string(),
        files: results,
    };
    emit_success(options.output, command, &report, &listing)
}
