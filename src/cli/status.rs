//! pkgwc status command implementation
//!
//! Package checkouts list per-file status codes; project checkouts list
//! per-package status codes.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::Result;
use crate::output::{emit_success, Listing, OutputOptions};
use crate::package::Package;
use crate::project::Project;
use crate::status::FileStatus;
use crate::store::Store;

/// Options for the status command
pub struct StatusOptions {
    pub dir: PathBuf,
    pub files: Vec<String>,
    pub output: OutputOptions,
}

#[derive(Serialize)]
struct Entry {
    name: String,
    code: char,
}

#[derive(Serialize)]
struct StatusReport {
    kind: &'static str,
    project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    package: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rev: Option<String>,
    entries: Vec<Entry>,
}

pub fn run(options: StatusOptions) -> Result<()> {
    let ctx = super::offline_context(&options.dir)?;
    let is_package = Store::open(&options.dir)?.package()?.is_some();

    let (report, conflicts) = if is_package {
        let package = Package::open(&options.dir, ctx)?;
        let statuses = if options.files.is_empty() {
            package.status_all()?
        } else {
            options
                .files
                .iter()
                .map(|name| package.status(name).map(|s| (s, name.clone())))
                .collect::<Result<Vec<_>>>()?
        };
        let conflicts = statuses
            .iter()
            .filter(|(s, _)| *s == FileStatus::Conflicted)
            .count();
        let report = StatusReport {
            kind: "package",
            project: package.project().to_string(),
            package: Some(package.name().to_string()),
            rev: package.rev().map(str::to_string),
            entries: statuses
                .into_iter()
                .map(|(status, name)| Entry {
                    name,
                    code: status.code(),
                })
                .collect(),
        };
        (report, conflicts)
    } else {
        let project = Project::open(&options.dir, ctx)?;
        let statuses = if options.files.is_empty() {
            project.status_all()?
        } else {
            options
                .files
                .iter()
                .map(|name| project.status(name).map(|s| (s, name.clone())))
                .collect::<Result<Vec<_>>>()?
        };
        let report = StatusReport {
            kind: "project",
            project: project.name().to_string(),
            package: None,
            rev: None,
            entries: statuses
                .into_iter()
                .map(|(status, name)| Entry {
                    name,
                    code: status.code(),
                })
                .collect(),
        };
        (report, 0)
    };

    let title = match &report.package {
        Some(package) => format!("{}/{}", report.project, package),
        None => report.project.clone(),
    };
    let changed = report.entries.iter().filter(|e| e.code != ' ').count();

    let mut listing = Listing::new(format!(
        "pkgwc status: {title} ({changed} changed of {})",
        report.entries.len()
    ));
    if let Some(rev) = &report.rev {
        listing.fact("rev", rev.clone());
    }
    for entry in &report.entries {
        listing.entry(entry.code, entry.name.clone());
    }
    if conflicts > 0 {
        listing.warn(format!("{conflicts} file(s) in conflict"));
        listing.hint("pkgwc resolved <file>");
    }

    emit_success(options.output, "status", &report, &listing)
}
