//! pkgwc check command implementation

use std::path::PathBuf;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::output::{emit_success, Listing, OutputOptions};
use crate::package::Package;
use crate::store::{Store, FORMAT_VERSION};

pub struct CheckOptions {
    pub dir: PathBuf,
    pub output: OutputOptions,
}

#[derive(Serialize)]
struct CheckReport {
    package: String,
    format_version: &'static str,
    consistent: bool,
}

pub fn run(options: CheckOptions) -> Result<()> {
    let ctx = super::offline_context(&options.dir)?;
    let store = Store::open(&options.dir)?;
    if store.package()?.is_none() && store.scm_url()?.is_none() {
        return Err(Error::InvalidArgument(format!(
            "{} is a project checkout; run check inside a package",
            options.dir.display()
        )));
    }

    let package = Package::open_unchecked(&options.dir, ctx)?;
    let dirty = package.check()?;
    if !dirty.is_empty() {
        return Err(Error::WorkingCopyInconsistent {
            path: package.dir().to_path_buf(),
            files: dirty,
        });
    }

    let mut listing = Listing::new(format!("pkgwc check: {} is consistent", package.name()));
    listing.fact("format", FORMAT_VERSION);
    let report = CheckReport {
        package: package.name().to_string(),
        format_version: FORMAT_VERSION,
        consistent: true,
    };
    emit_success(options.output, "check", &report, &listing)
}
