//! Error types for pkgwc
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (misuse, stale or foreign working copy)
//! - 4: Operation failed (I/O, server, internal consistency, external tool)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the pkgwc CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for working-copy operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Not a working copy: {0}")]
    NoWorkingCopy(PathBuf),

    #[error("Working copy {path} has format version {found:?}; do a fresh checkout")]
    WorkingCopyWrongVersion { path: PathBuf, found: String },

    #[error("Working copy {path} is at revision {local} but the server is at {upstream}; update first")]
    WorkingCopyOutdated {
        path: PathBuf,
        local: String,
        upstream: String,
    },

    #[error("Package {package} already exists: {reason}")]
    PackageExists { package: String, reason: String },

    #[error("Package {package} is missing: {reason}")]
    PackageMissing { package: String, reason: String },

    #[error("{package}/{file}: {reason}")]
    PackageFileConflict {
        package: String,
        file: String,
        reason: String,
    },

    #[error("Staging directory {0} exists; another operation is running or was interrupted")]
    StagingInProgress(PathBuf),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Operation failures (exit code 4)
    #[error("Working copy {path} is inconsistent ({}); run a repair", files.join(", "))]
    WorkingCopyInconsistent { path: PathBuf, files: Vec<String> },

    #[error("Internal error in package {package}: {reason}")]
    PackageInternalError { package: String, reason: String },

    #[error("{command} exited with status {status}")]
    ExtRuntime { command: String, status: i32 },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Malformed metadata: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("XML attribute error: {0}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::NoWorkingCopy(_)
            | Error::WorkingCopyWrongVersion { .. }
            | Error::WorkingCopyOutdated { .. }
            | Error::PackageExists { .. }
            | Error::PackageMissing { .. }
            | Error::PackageFileConflict { .. }
            | Error::StagingInProgress(_)
            | Error::InvalidArgument(_)
            | Error::InvalidConfig(_) => exit_codes::USER_ERROR,

            // Operation failures
            Error::WorkingCopyInconsistent { .. }
            | Error::PackageInternalError { .. }
            | Error::ExtRuntime { .. }
            | Error::Server(_)
            | Error::Malformed(_)
            | Error::Io(_)
            | Error::Xml(_)
            | Error::XmlAttr(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::Pattern(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Structured fields for machine-readable output.
    pub fn details(&self) -> Option<serde_json::Value> {
        use serde_json::json;

        match self {
            Error::WorkingCopyInconsistent { path, files } => Some(json!({
                "path": path.to_string_lossy(),
                "files": files,
            })),
            Error::WorkingCopyOutdated {
                path,
                local,
                upstream,
            } => Some(json!({
                "path": path.to_string_lossy(),
                "local": local,
                "upstream": upstream,
            })),
            Error::PackageFileConflict {
                package,
                file,
                reason,
            } => Some(json!({
                "package": package,
                "file": file,
                "reason": reason,
            })),
            Error::ExtRuntime { command, status } => Some(json!({
                "command": command,
                "status": status,
            })),
            Error::InvalidConfig(message) | Error::InvalidArgument(message) => {
                Some(json!({ "message": message }))
            }
            _ => None,
        }
    }

    pub(crate) fn internal(package: &str, reason: impl Into<String>) -> Self {
        Error::PackageInternalError {
            package: package.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn file_conflict(package: &str, file: &str, reason: impl Into<String>) -> Self {
        Error::PackageFileConflict {
            package: package.to_string(),
            file: file.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for pkgwc operations
pub type Result<T> = std::result::Result<T, Error>;
