//! Per-file status derivation.
//!
//! A file's status is a pure function of three facts about it (on disk, in
//! the pristine cache, in the manifest) plus its membership in the pending
//! sets. [`classify`] is the whole table; anything it does not cover is an
//! inconsistent working copy.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// `' '` tracked and identical to the manifest checksum
    Unchanged,
    /// `M` tracked and locally modified
    Modified,
    /// `A` scheduled for addition
    Added,
    /// `R` scheduled for addition over a tracked file
    Replaced,
    /// `D` scheduled for deletion
    Deleted,
    /// `C` unresolved conflict
    Conflicted,
    /// `S` excluded by size limit or glob policy
    Skipped,
    /// `!` tracked (or pending add) but gone from disk
    Missing,
    /// `?` on disk only
    Unversioned,
}

impl FileStatus {
    pub fn code(self) -> char {
        match self {
            FileStatus::Unchanged => ' ',
            FileStatus::Modified => 'M',
            FileStatus::Added => 'A',
            FileStatus::Replaced => 'R',
            FileStatus::Deleted => 'D',
            FileStatus::Conflicted => 'C',
            FileStatus::Skipped => 'S',
            FileStatus::Missing => '!',
            FileStatus::Unversioned => '?',
        }
    }

    /// Local state that a delete would throw away.
    pub fn has_local_changes(self) -> bool {
        matches!(
            self,
            FileStatus::Modified
                | FileStatus::Added
                | FileStatus::Replaced
                | FileStatus::Unversioned
                | FileStatus::Conflicted
        )
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Everything the status of one file depends on, apart from its content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFacts {
    pub on_disk: bool,
    pub in_cache: bool,
    pub in_manifest: bool,
    pub to_be_added: bool,
    pub to_be_deleted: bool,
    pub in_conflict: bool,
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Status(FileStatus),
    /// Tracked and present: `' '` or `M` depending on content.
    CompareContent,
}

/// Map facts to a status. `None` means the combination cannot occur in a
/// consistent working copy.
pub fn classify(facts: FileFacts) -> Option<Verdict> {
    use FileStatus::*;
    use Verdict::*;

    let verdict = match facts {
        FileFacts {
            to_be_deleted: true,
            ..
        } => Status(Deleted),
        FileFacts {
            in_conflict: true, ..
        } => Status(Conflicted),
        FileFacts { skipped: true, .. } => Status(Skipped),
        FileFacts {
            to_be_added: true,
            on_disk: true,
            in_cache: true,
            ..
        } => Status(Replaced),
        FileFacts {
            to_be_added: true,
            on_disk: true,
            ..
        } => Status(Added),
        FileFacts {
            to_be_added: true,
            on_disk: false,
            ..
        } => Status(Missing),
        FileFacts {
            on_disk: true,
            in_cache: true,
            in_manifest: true,
            ..
        } => CompareContent,
        FileFacts {
            on_disk: true,
            in_cache: false,
            in_manifest: false,
            ..
        } => Status(Unversioned),
        FileFacts {
            on_disk: false,
            in_cache: true,
            in_manifest: true,
            ..
        } => Status(Missing),
        _ => return None,
    };
    Some(verdict)
}
