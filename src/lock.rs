//! Atomic writes and staging markers for working-copy metadata
//!
//! This module provides the two filesystem primitives every multi-step
//! protocol builds on:
//! - Atomic write pattern (write temp in the same directory + rename)
//! - Staging directories created with a single `mkdir`, which doubles as a
//!   cross-process marker for the update and commit protocols
//!
//! Staging markers are advisory. They detect a concurrent or interrupted
//! operation; they do not stop another process from deleting the marker.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Atomically write data to a file
///
/// This writes to a temporary file in the same directory, then renames
/// it to the target path. This ensures the file is either fully written
/// or not modified at all.
pub fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Create temp file in same directory (important for atomic rename)
    let temp_path = temp_sibling(path);

    let mut temp_file = File::create(&temp_path)?;
    temp_file.write_all(data)?;
    temp_file.sync_all()?;
    drop(temp_file);

    fs::rename(&temp_path, path)?;

    Ok(())
}

/// Atomically write string data to a file
pub fn write_atomic_str(path: impl AsRef<Path>, data: &str) -> Result<()> {
    write_atomic(path, data.as_bytes())
}

/// Atomically replace `dest` with a copy of `src`.
pub fn copy_atomic(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let dest = dest.as_ref();
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = temp_sibling(dest);
    fs::copy(src.as_ref(), &temp_path)?;
    fs::rename(&temp_path, dest)?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: impl AsRef<Path>) -> Result<bool> {
    match fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()))
}

/// A staging directory inside the metadata namespace.
///
/// Creation is a single `mkdir`, so at most one caller acquires it. The
/// directory is never removed on drop; protocols call [`StagingDir::finish`]
/// once their last step has succeeded, and leave it in place on failure so
/// the next invocation can see what happened.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Create the directory or fail if another operation holds it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match fs::create_dir(&path) {
            Ok(()) => Ok(StagingDir { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(Error::StagingInProgress(path))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Adopt a staging directory left behind by an earlier invocation.
    pub fn existing(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        path.is_dir().then(|| StagingDir {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Names of the entries currently staged.
    pub fn entries(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Remove the directory and everything left in it.
    pub fn finish(self) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
