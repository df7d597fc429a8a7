//! Command-line interface for pkgwc
//!
//! This module defines the CLI structure using clap derive macros.
//! Each subcommand is defined in its own submodule. Only offline
//! commands are exposed; talking to a build service needs a [`Server`]
//! implementation supplied by the embedding application.
//!
//! [`Server`]: crate::server::Server

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::{Config, CONFIG_FILE};
use crate::context::Context;
use crate::error::Result;
use crate::output::OutputOptions;

mod check;
mod files;
mod status;

/// pkgwc - package build service working copies
///
/// Inspect and edit a package or project checkout without a server
/// connection: file status, pending additions and deletions, reverts and
/// conflict resolution.
#[derive(Parser, Debug)]
#[command(name = "pkgwc")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Working-copy directory (defaults to current directory)
    #[arg(long, short = 'C', global = true, env = "PKGWC_DIR")]
    pub dir: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show file status (package) or package status (project)
    #[command(alias = "st")]
    Status {
        /// Limit output to these files
        files: Vec<String>,
    },

    /// Schedule files for addition
    Add {
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Remove files and schedule their deletion
    #[command(alias = "delete")]
    Rm {
        #[arg(required = true)]
        files: Vec<String>,

        /// Also remove files with local changes
        #[arg(short, long)]
        force: bool,
    },

    /// Discard local changes
    Revert {
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Mark conflicts as resolved
    Resolved {
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Verify working-copy metadata
    Check,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let dir = match self.dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let output = OutputOptions {
            json: self.json,
            quiet: self.quiet,
        };

        match self.command {
            Commands::Status { files } => status::run(status::StatusOptions {
                dir,
                files,
                output,
            }),
            Commands::Add { files } => files::run(files::FileOptions {
                dir,
                files,
                action: files::FileAction::Add,
                output,
            }),
            Commands::Rm { files, force } => files::run(files::FileOptions {
                dir,
                files,
                action: files::FileAction::Remove { force },
                output,
            }),
            Commands::Revert { files } => files::run(files::FileOptions {
                dir,
                files,
                action: files::FileAction::Revert,
                output,
            }),
            Commands::Resolved { files } => files::run(files::FileOptions {
                dir,
                files,
                action: files::FileAction::Resolved,
                output,
            }),
            Commands::Check => check::run(check::CheckOptions { dir, output }),
        }
    }
}

/// Offline context configured from the nearest `.pkgwc.toml` at or above `dir`.
pub(crate) fn offline_context(dir: &Path) -> Result<Context> {
    let config = match dir.ancestors().map(|d| d.join(CONFIG_FILE)).find(|p| p.is_file()) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    Ok(Context::offline(config))
}
