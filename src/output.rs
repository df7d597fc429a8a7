//! Output for pkgwc CLI commands.
//!
//! Every command produces a serializable report plus a [`Listing`]: a
//! status-code listing in the `X    name` layout shared by file and package
//! status. `--json` prints the report inside a versioned envelope instead.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};

pub const SCHEMA_VERSION: &str = "pkgwc.v1";

#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub json: bool,
    pub quiet: bool,
}

/// Human rendering of a command result.
#[derive(Debug, Clone)]
pub struct Listing {
    header: String,
    facts: Vec<(&'static str, String)>,
    entries: Vec<(char, String)>,
    warnings: Vec<String>,
    hints: Vec<String>,
}

impl Listing {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            facts: Vec::new(),
            entries: Vec::new(),
            warnings: Vec::new(),
            hints: Vec::new(),
        }
    }

    /// A `key value` pair on the line under the header.
    pub fn fact(&mut self, key: &'static str, value: impl Into<String>) {
        self.facts.push((key, value.into()));
    }

    /// One status line. Unchanged (`' '`) entries count but are not listed.
    pub fn entry(&mut self, code: char, name: impl Into<String>) {
        self.entries.push((code, name.into()));
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// A command worth running next.
    pub fn hint(&mut self, command: impl Into<String>) {
        self.hints.push(command.into());
    }

    /// Per-status counts such as `1 added, 2 modified`, ordered by label.
    pub fn tally(&self) -> String {
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for (code, _) in &self.entries {
            if *code != ' ' {
                *counts.entry(code_label(*code)).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .map(|(label, count)| format!("{count} {label}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn render(&self) -> String {
        let mut lines = vec![self.header.clone()];

        let mut facts: Vec<String> = self
            .facts
            .iter()
            .map(|(key, value)| format!("{key} {value}"))
            .collect();
        let tally = self.tally();
        if !tally.is_empty() {
            facts.push(tally);
        }
        if !facts.is_empty() {
            lines.push(facts.join(", "));
        }

        for (code, name) in &self.entries {
            if *code != ' ' {
                lines.push(format!("{code}    {name}"));
            }
        }

        if !self.warnings.is_empty() || !self.hints.is_empty() {
            lines.push(String::new());
        }
        lines.extend(self.warnings.iter().map(|w| format!("warning: {w}")));
        lines.extend(self.hints.iter().map(|h| format!("hint: {h}")));
        lines.join("\n")
    }
}

/// Word for a file or package status code.
pub fn code_label(code: char) -> &'static str {
    match code {
        'M' => "modified",
        'A' => "added",
        'R' => "replaced",
        'D' => "deleted",
        'C' => "conflicted",
        'S' => "skipped",
        '!' => "missing",
        '?' => "unversioned",
        _ => "unchanged",
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    schema_version: &'static str,
    command: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    next_steps: Vec<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    code: i32,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

pub fn emit_success<T: Serialize>(
    options: OutputOptions,
    command: &str,
    data: &T,
    listing: &Listing,
) -> Result<()> {
    if options.json {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            status: "success",
            data: Some(data),
            error: None,
            warnings: listing.warnings.clone(),
            next_steps: listing.hints.clone(),
        };
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    } else if !options.quiet {
        println!("{}", listing.render());
    }
    Ok(())
}

pub fn emit_error(command: &str, err: &Error, json: bool) -> Result<()> {
    let hints = error_hints(err);
    if json {
        let envelope: Envelope<'_, ()> = Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            status: "error",
            data: None,
            error: Some(ErrorBody {
                message: err.to_string(),
                code: err.exit_code(),
                kind: error_kind(err),
                details: err.details(),
            }),
            warnings: Vec::new(),
            next_steps: hints,
        };
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }

    eprintln!("error: {err}");
    if let Some(hint) = hints.first() {
        eprintln!("hint: {hint}");
    }
    Ok(())
}

pub fn infer_command_name_from_args() -> String {
    command_name(std::env::args().skip(1))
}

/// First positional argument, skipping the value of `-C`/`--dir`.
fn command_name(args: impl IntoIterator<Item = String>) -> String {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-C" | "--dir" => {
                args.next();
            }
            flag if flag.starts_with('-') => {}
            _ => return arg,
        }
    }
    "pkgwc".to_string()
}

fn error_kind(err: &Error) -> &'static str {
    match err.exit_code() {
        2 => "user_error",
        _ => "operation_failed",
    }
}

fn error_hints(err: &Error) -> Vec<String> {
    match err {
        Error::WorkingCopyInconsistent { .. } => vec!["pkgwc check".to_string()],
        Error::WorkingCopyOutdated { .. } => vec!["update the working copy, then retry".to_string()],
        Error::WorkingCopyWrongVersion { .. } => vec!["do a fresh checkout".to_string()],
        Error::PackageFileConflict { file, .. } => vec![format!("pkgwc status {file}")],
        Error::StagingInProgress(path) => vec![format!(
            "make sure no other pkgwc runs here, then inspect {}",
            path.display()
        )],
        Error::InvalidConfig(_) | Error::Pattern(_) => {
            vec!["fix .pkgwc.toml then retry".to_string()]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_shows_changed_entries_and_tally() {
        let mut listing = Listing::new("pkgwc status: home:tester/foo");
        listing.fact("rev", "3");
        listing.entry('M', "foo.spec");
        listing.entry(' ', "README");
        listing.entry('A', "fix.patch");
        listing.entry('M', "foo.changes");
        listing.warn("1 file(s) in conflict");
        listing.hint("pkgwc resolved <file>");

        assert_eq!(listing.tally(), "1 added, 2 modified");
        let text = listing.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "pkgwc status: home:tester/foo");
        assert_eq!(lines[1], "rev 3, 1 added, 2 modified");
        assert_eq!(lines[2], "M    foo.spec");
        assert!(!text.contains("README"));
        assert!(text.ends_with("warning: 1 file(s) in conflict\nhint: pkgwc resolved <file>"));
    }

    #[test]
    fn clean_listing_is_just_the_header() {
        let mut listing = Listing::new("pkgwc status: foo");
        listing.entry(' ', "README");
        assert_eq!(listing.render(), "pkgwc status: foo");
    }

    #[test]
    fn errors_map_to_kinds_and_hints() {
        let err = Error::WorkingCopyInconsistent {
            path: "pkg".into(),
            files: vec!["a.spec".to_string()],
        };
        assert_eq!(error_kind(&err), "operation_failed");
        assert_eq!(error_hints(&err), vec!["pkgwc check".to_string()]);

        let err = Error::InvalidArgument("x".to_string());
        assert_eq!(error_kind(&err), "user_error");
        assert!(error_hints(&err).is_empty());
    }

    #[test]
    fn command_name_skips_directory_value() {
        let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(command_name(args(&["-C", "pkg", "status"])), "status");
        assert_eq!(command_name(args(&["--json", "add", "x"])), "add");
        assert_eq!(command_name(args(&["--dir", "pkg"])), "pkgwc");
    }
}
