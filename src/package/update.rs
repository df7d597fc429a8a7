//! Update protocol
//!
//! Brings a package working copy to a server revision while preserving local
//! edits. The new manifest is staged under `_in_update/_files` before any
//! file is touched, and each working file is backed up into the staging
//! directory while it is being replaced, so an interrupted update can be
//! finished by the next invocation.
//!
//! # Classification
//!
//! Upstream entries are split against the current manifest into
//! - `added`: unknown locally, or previously skipped and now wanted
//! - `kept`: present on both sides
//! - `deleted`: gone upstream, or flagged skipped upstream

use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{Package, MINE_SUFFIX, NEW_SUFFIX};
use crate::error::{Error, Result};
use crate::file::{is_binary, is_binary_file, md5_file, File};
use crate::lock::{copy_atomic, remove_if_exists, write_atomic, write_atomic_str, StagingDir};
use crate::manifest::Manifest;
use crate::merge::MergeOutcome;
use crate::status::FileStatus;
use crate::store::{FILES_KEY, TO_BE_DELETED_KEY};

/// Suffix of a backup that was still being copied when interrupted
const PARTIAL_BACKUP_SUFFIX: &str = ".copy";

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Target revision; latest when unset
    pub revision: Option<String>,
    /// Materialize `_service:*` files instead of skipping them
    pub service_files: bool,
}

/// What happened to one file during an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    /// `A` new upstream file fetched
    Added,
    /// `D` removed locally
    Deleted,
    /// `U` replaced with the upstream copy
    Updated,
    /// `G` local edits merged cleanly
    Merged,
    /// `C` merge left conflicts
    Conflicted,
    /// Missing working file restored
    Restored,
    /// Left untouched because of an unresolved conflict or local edits
    Kept,
    /// Working file edited while an interrupted update held its backup;
    /// the edit was moved aside under the reported name
    Preserved,
}

impl UpdateAction {
    pub fn code(self) -> &'static str {
        match self {
            UpdateAction::Added => "A",
            UpdateAction::Deleted => "D",
            UpdateAction::Updated => "U",
            UpdateAction::Merged => "G",
            UpdateAction::Conflicted => "C",
            UpdateAction::Restored => "Restored",
            UpdateAction::Kept => "Kept",
            UpdateAction::Preserved => "Preserved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateEvent {
    pub action: UpdateAction,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    pub events: Vec<UpdateEvent>,
    /// Revision the working copy ended up at
    pub rev: Option<String>,
    /// An interrupted update was finished first
    pub resumed: bool,
}

impl UpdateReport {
    fn push(&mut self, action: UpdateAction, name: &str) {
        debug!(action = action.code(), file = name, "update");
        self.events.push(UpdateEvent {
            action,
            name: name.to_string(),
        });
    }

    /// Files left in conflict by this update.
    pub fn conflicts(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| e.action == UpdateAction::Conflicted)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// True when no working file was touched.
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

/// Upstream entries split against the current manifest.
#[derive(Debug, Default)]
struct Changes {
    added: Vec<File>,
    kept: Vec<File>,
    deleted: Vec<File>,
}

impl Package {
    /// Update the working copy to `options.revision` (latest when unset).
    ///
    /// Running it twice against an unchanged server touches no working file
    /// the second time.
    pub fn update(&mut self, options: &UpdateOptions) -> Result<UpdateReport> {
        self.ensure_classic()?;
        let mut report = UpdateReport::default();

        let staging_path = self.store.update_staging_dir();
        if let Some(staging) = StagingDir::existing(&staging_path) {
            if !staging.join(FILES_KEY).is_file() {
                return Err(Error::StagingInProgress(staging_path));
            }
            warn!(package = %self.name, "finishing an interrupted update");
            self.resume_update(staging, &mut report)?;
            report.resumed = true;
        }

        let mut upstream = self.ctx.server.fetch_manifest(
            &self.project,
            &self.name,
            options.revision.as_deref(),
        )?;
        self.mark_skipped(&mut upstream, options.service_files);

        let changes = self.classify_changes(&upstream);
        self.check_collisions(&changes.added)?;

        let staging = StagingDir::acquire(&staging_path)?;
        write_atomic_str(staging.join(FILES_KEY), &upstream.to_xml()?)?;
        self.apply_update(staging, upstream, changes, &mut report)?;

        report.rev = self.manifest.rev.clone();
        info!(
            package = %self.name,
            rev = ?report.rev,
            changed = report.events.len(),
            "update finished"
        );
        Ok(report)
    }

    fn classify_changes(&self, upstream: &Manifest) -> Changes {
        let mut changes = Changes::default();
        let known = |name: &str| self.manifest.find(name).is_some_and(|f| !f.skipped);

        for entry in &upstream.files {
            if entry.skipped {
                if known(&entry.name) {
                    changes.deleted.push(entry.clone());
                }
            } else if known(&entry.name) {
                changes.kept.push(entry.clone());
            } else {
                changes.added.push(entry.clone());
            }
        }
        for entry in &self.manifest.files {
            if !upstream.contains(&entry.name) {
                changes.deleted.push(entry.clone());
            }
        }
        changes
    }

    /// An upstream addition must not overwrite an untracked local file.
    fn check_collisions(&self, added: &[File]) -> Result<()> {
        for entry in added {
            let name = entry.name.as_str();
            if self.manifest.contains(name) || !self.path_of(name).exists() {
                continue;
            }
            let reason = if self.to_be_added.iter().any(|n| n == name) {
                "a pending local addition has the same name as an upstream addition"
            } else {
                "an unversioned local file is in the way of an upstream addition"
            };
            return Err(Error::file_conflict(&self.name, name, reason));
        }
        Ok(())
    }

    fn apply_update(
        &mut self,
        staging: StagingDir,
        upstream: Manifest,
        changes: Changes,
        report: &mut UpdateReport,
    ) -> Result<()> {
        let revision = upstream.rev.clone();
        let revision = revision.as_deref();

        for entry in &changes.deleted {
            self.apply_deleted(entry, report)?;
        }

        for entry in &changes.added {
            self.fetch_to_working(&staging, &entry.name, revision)?;
            report.push(UpdateAction::Added, &entry.name);
        }

        for entry in &changes.kept {
            self.apply_kept(&staging, entry, revision, report)?;
        }

        if upstream != self.manifest {
            self.store.write_manifest(FILES_KEY, Some(&upstream))?;
            self.manifest = upstream;
        }
        self.store.set_size_limit(self.size_limit)?;
        staging.finish()
    }

    fn apply_deleted(&mut self, entry: &File, report: &mut UpdateReport) -> Result<()> {
        let name = entry.name.as_str();
        if self.manifest.find(name).is_some_and(|f| f.skipped) {
            return Ok(());
        }
        let status = if self.store.has_source(name) {
            Some(self.status(name)?)
        } else {
            None
        };

        match status {
            Some(FileStatus::Modified) | Some(FileStatus::Conflicted) => {
                warn!(package = %self.name, file = name, "deleted upstream but modified locally; kept as conflict");
                self.add_conflict(name)?;
                report.push(UpdateAction::Conflicted, name);
            }
            // Re-added locally: the file stays as a plain pending addition.
            Some(FileStatus::Replaced) | Some(FileStatus::Added) => {
                debug!(package = %self.name, file = name, "deleted upstream; local re-add kept");
                report.push(UpdateAction::Kept, name);
            }
            _ => {
                remove_if_exists(self.path_of(name))?;
                report.push(UpdateAction::Deleted, name);
            }
        }
        self.store.remove_source(name)?;

        if self.to_be_deleted.iter().any(|n| n == name) {
            self.to_be_deleted.retain(|n| n != name);
            self.persist(TO_BE_DELETED_KEY)?;
        }
        Ok(())
    }

    fn apply_kept(
        &mut self,
        staging: &StagingDir,
        entry: &File,
        revision: Option<&str>,
        report: &mut UpdateReport,
    ) -> Result<()> {
        let name = entry.name.as_str();
        let old_md5 = self
            .manifest
            .find(name)
            .map(|f| f.md5.clone())
            .ok_or_else(|| Error::internal(&self.name, format!("{name} vanished from the manifest")))?;
        let changed_upstream = old_md5 != entry.md5;

        match self.status(name)? {
            FileStatus::Modified if changed_upstream => {
                let action = self.merge_file(staging, name, revision)?;
                report.push(action, name);
            }
            FileStatus::Missing => {
                self.fetch_to_working(staging, name, revision)?;
                report.push(UpdateAction::Restored, name);
            }
            FileStatus::Conflicted => {
                if changed_upstream {
                    let content = self.fetch(name, revision)?;
                    self.store.write_source(name, &content)?;
                }
                report.push(UpdateAction::Kept, name);
            }
            FileStatus::Replaced if changed_upstream => {
                let content = self.fetch(name, revision)?;
                self.store.write_source(name, &content)?;
                report.push(UpdateAction::Kept, name);
            }
            FileStatus::Deleted if changed_upstream => {
                if self.path_of(name).exists() {
                    let action = self.merge_file(staging, name, revision)?;
                    if action == UpdateAction::Conflicted {
                        self.to_be_deleted.retain(|n| n != name);
                        self.persist(TO_BE_DELETED_KEY)?;
                    }
                    report.push(action, name);
                } else {
                    let content = self.fetch(name, revision)?;
                    self.store.write_source(name, &content)?;
                    report.push(UpdateAction::Kept, name);
                }
            }
            FileStatus::Unchanged if changed_upstream => {
                self.fetch_to_working(staging, name, revision)?;
                report.push(UpdateAction::Updated, name);
            }
            _ => {}
        }
        Ok(())
    }

    fn fetch(&self, name: &str, revision: Option<&str>) -> Result<Vec<u8>> {
        self.ctx
            .server
            .fetch_file(&self.project, &self.name, name, revision)
    }

    /// Replace the pristine and working copies of `name` with upstream
    /// content, keeping a backup of the working file in `staging` meanwhile.
    fn fetch_to_working(
        &mut self,
        staging: &StagingDir,
        name: &str,
        revision: Option<&str>,
    ) -> Result<()> {
        let backup = self.backup(staging, name)?;
        let content = self.fetch(name, revision)?;
        self.store.write_source(name, &content)?;
        write_atomic(self.path_of(name), &content)?;
        if let Some(backup) = backup {
            fs::remove_file(backup)?;
        }
        Ok(())
    }

    /// Three-way merge of a locally modified file with its upstream copy.
    ///
    /// The local side is kept as `<name>.mine` and upstream as `<name>.new`;
    /// both are removed again after a clean merge. Binary files are never
    /// merged: upstream wins and the file is flagged as a conflict.
    fn merge_file(
        &mut self,
        staging: &StagingDir,
        name: &str,
        revision: Option<&str>,
    ) -> Result<UpdateAction> {
        let local = self.path_of(name);
        let mine = self.path_of(&format!("{name}{MINE_SUFFIX}"));
        let theirs = self.path_of(&format!("{name}{NEW_SUFFIX}"));

        let backup = self.backup(staging, name)?;
        fs::rename(&local, &mine)?;
        let content = self.fetch(name, revision)?;
        write_atomic(&theirs, &content)?;

        if is_binary_file(&mine)? || is_binary(&content) {
            warn!(package = %self.name, file = name, "binary file changed on both sides; took upstream");
            copy_atomic(&theirs, &local)?;
            self.store.write_source(name, &content)?;
            self.add_conflict(name)?;
            remove_backup(backup)?;
            return Ok(UpdateAction::Conflicted);
        }

        let base = self.store.source_path(name);
        let outcome = self.ctx.merge.merge(&mine, &base, &theirs, &local)?;
        self.store.copy_to_source(&theirs, name)?;

        let action = match outcome {
            MergeOutcome::Clean => {
                remove_if_exists(&mine)?;
                remove_if_exists(&theirs)?;
                UpdateAction::Merged
            }
            MergeOutcome::Conflict => {
                self.add_conflict(name)?;
                UpdateAction::Conflicted
            }
        };
        remove_backup(backup)?;
        Ok(action)
    }

    /// Copy the working file into staging under a temporary name, then
    /// rename it into place so a partial copy is recognizable.
    fn backup(&self, staging: &StagingDir, name: &str) -> Result<Option<PathBuf>> {
        let local = self.path_of(name);
        if !local.is_file() {
            return Ok(None);
        }
        let partial = staging.join(&format!("{name}{PARTIAL_BACKUP_SUFFIX}"));
        let backup = staging.join(name);
        fs::copy(&local, &partial)?;
        fs::rename(&partial, &backup)?;
        Ok(Some(backup))
    }

    /// Finish an update whose staged manifest survived an interruption.
    fn resume_update(&mut self, staging: StagingDir, report: &mut UpdateReport) -> Result<()> {
        let xml = fs::read_to_string(staging.join(FILES_KEY))?;
        let upstream = Manifest::from_xml(&xml)?;

        let leftovers: Vec<String> = staging
            .entries()?
            .into_iter()
            .filter(|n| n != FILES_KEY)
            .collect();
        match leftovers.as_slice() {
            [] => {}
            [name] => self.recover_backup(&staging, name, report)?,
            _ => {
                return Err(Error::internal(
                    &self.name,
                    format!(
                        "too many files in {}: {}",
                        staging.path().display(),
                        leftovers.join(", ")
                    ),
                ))
            }
        }

        let mut changes = self.classify_changes(&upstream);
        let mut finished = Vec::new();
        for entries in [&mut changes.added, &mut changes.kept] {
            entries.retain(|entry| {
                let done = self.pristine_matches(entry);
                if done {
                    finished.push(entry.clone());
                }
                !done
            });
        }
        for entry in &finished {
            self.settle_finished(entry)?;
        }

        self.check_collisions(&changes.added)?;
        self.apply_update(staging, upstream, changes, report)
    }

    fn recover_backup(
        &mut self,
        staging: &StagingDir,
        name: &str,
        report: &mut UpdateReport,
    ) -> Result<()> {
        let backup = staging.join(name);
        if name.ends_with(PARTIAL_BACKUP_SUFFIX) {
            return Ok(fs::remove_file(backup)?);
        }
        if !self.manifest.contains(name) {
            return Err(Error::internal(
                &self.name,
                format!("{name} is not known by the manifest but exists in the update staging area"),
            ));
        }

        let local = self.path_of(name);
        if local.is_file() {
            if md5_file(&local)? != md5_file(&backup)? {
                let aside = tempfile::Builder::new()
                    .prefix(&format!("{name}."))
                    .tempfile_in(self.dir())?
                    .into_temp_path()
                    .keep()
                    .map_err(|e| Error::Io(e.error))?;
                fs::rename(&local, &aside)?;
                fs::rename(&backup, &local)?;
                let aside_name = super::dir_name(&aside);
                warn!(
                    package = %self.name,
                    file = name,
                    saved_as = %aside_name,
                    "working file changed during an interrupted update"
                );
                report.push(UpdateAction::Preserved, &aside_name);
            } else {
                fs::remove_file(backup)?;
            }
        } else {
            fs::rename(&backup, &local)?;
            report.push(UpdateAction::Restored, name);
        }
        Ok(())
    }

    fn pristine_matches(&self, entry: &File) -> bool {
        self.store.has_source(&entry.name)
            && md5_file(self.store.source_path(&entry.name)).is_ok_and(|md5| md5 == entry.md5)
    }

    /// The pristine copy already holds upstream content; make sure the
    /// working file did not stay behind at the old revision.
    fn settle_finished(&self, entry: &File) -> Result<()> {
        let local = self.path_of(&entry.name);
        if self.to_be_deleted.contains(&entry.name) {
            return Ok(());
        }
        let stale = match self.manifest.find(&entry.name) {
            _ if !local.exists() => true,
            Some(old) => md5_file(&local)? == old.md5,
            None => false,
        };
        if stale {
            copy_atomic(self.store.source_path(&entry.name), &local)?;
        }
        Ok(())
    }
}

fn remove_backup(backup: Option<PathBuf>) -> Result<()> {
    if let Some(path) = backup {
        remove_if_exists(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_collects_conflicts() {
        let mut report = UpdateReport::default();
        assert!(report.is_noop());
        report.push(UpdateAction::Merged, "a.spec");
        report.push(UpdateAction::Conflicted, "b.spec");
        assert_eq!(report.conflicts(), vec!["b.spec"]);
        assert!(!report.is_noop());
    }

    #[test]
    fn partial_backups_are_recognizable() {
        assert_eq!(UpdateAction::Merged.code(), "G");
        assert!(format!("x.tar{PARTIAL_BACKUP_SUFFIX}").ends_with(".copy"));
    }
}
