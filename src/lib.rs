//! pkgwc - working copies for a package build service
//!
//! This library keeps a local directory tree in sync with server-side
//! package and project state, in the manner of a version-control checkout
//! layered on an XML API.
//!
//! # Core Concepts
//!
//! - **Store**: the hidden per-directory metadata namespace (`.pkgwc/`)
//! - **Pristine cache**: the last-known server copy of every tracked file
//! - **Package**: one flat directory of files with a status state machine,
//!   an update protocol (three-way merge, resumable) and a commit protocol
//!   (staged, bounded retry)
//! - **Project**: a directory of packages with project-level add/delete intent
//!
//! # Module Organization
//!
//! - `cli`: Offline command-line interface using clap
//! - `config`: Configuration loading from `.pkgwc.toml`
//! - `context`: Server, merge tool and configuration injected into operations
//! - `error`: Error types and result aliases
//! - `file`, `manifest`, `package_list`, `xml`: on-disk data model and codecs
//! - `lock`: Atomic writes and staging-directory markers
//! - `merge`: Three-way merge tools
//! - `package`: Package working copy, update and commit
//! - `project`: Project working copy
//! - `server`: Remote capability consumed by the protocols
//! - `status`: Per-file status derivation
//! - `store`: Metadata store and format migration

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod file;
pub mod lock;
pub mod manifest;
pub mod merge;
pub mod output;
pub mod package;
pub mod package_list;
pub mod project;
pub mod server;
pub mod status;
pub mod store;
pub mod xml;

pub use context::Context;
pub use error::{Error, Result};
pub use package::Package;
pub use project::Project;
