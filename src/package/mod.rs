//! Package working copy
//!
//! A package checkout is a flat directory of files plus its metadata store.
//! This module owns the local half of the working copy: status derivation,
//! the pending-change sets (`add`, `delete`, `revert`, `resolved`) and the
//! consistency check. The network protocols live in [`update`] and
//! [`commit`].
//!
//! # Pending sets
//!
//! `to_be_added`, `to_be_deleted` and `in_conflict` are persisted after every
//! mutation; an empty set removes its key from the store.

mod commit;
mod update;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::file::md5_file;
use crate::lock::{copy_atomic, remove_if_exists};
use crate::manifest::{LinkInfo, Manifest, ServiceInfo};
use crate::server::SourceInfo;
use crate::status::{classify, FileFacts, FileStatus, Verdict};
use crate::store::{
    Store, APIURL_KEY, FILES_KEY, IN_CONFLICT_KEY, PACKAGE_KEY, PROJECT_KEY, STORE_DIR,
    TO_BE_ADDED_KEY, TO_BE_DELETED_KEY,
};

pub use commit::{CommitOptions, CommitOutcome, CommitReport, MAX_COMMIT_ROUNDS};
pub use update::{UpdateAction, UpdateEvent, UpdateOptions, UpdateReport};

/// Suffix of the local side kept next to a conflicted file
pub const MINE_SUFFIX: &str = ".mine";

/// Suffix of the upstream side kept next to a conflicted file
pub const NEW_SUFFIX: &str = ".new";

/// Result of [`Package::delete_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    /// Whether anything was removed or scheduled
    pub deleted: bool,
    /// Status of the file before the call
    pub status: FileStatus,
}

/// One package working copy.
pub struct Package {
    ctx: Context,
    store: Store,
    project: String,
    name: String,
    scm_url: Option<String>,
    manifest: Manifest,
    to_be_added: Vec<String>,
    to_be_deleted: Vec<String>,
    in_conflict: Vec<String>,
    size_limit: Option<u64>,
}

impl Package {
    /// Open a package working copy and verify its metadata.
    ///
    /// Fails with [`Error::WorkingCopyInconsistent`] when [`Package::check`]
    /// reports anything; [`Package::repair`] fixes most of it.
    pub fn open(dir: impl AsRef<Path>, ctx: Context) -> Result<Self> {
        let package = Self::open_unchecked(dir, ctx)?;
        let dirty = package.check()?;
        if !dirty.is_empty() {
            return Err(Error::WorkingCopyInconsistent {
                path: package.dir().to_path_buf(),
                files: dirty,
            });
        }
        Ok(package)
    }

    /// Open without the consistency check. Used by `check` and `repair`.
    pub fn open_unchecked(dir: impl AsRef<Path>, ctx: Context) -> Result<Self> {
        let store = Store::open(dir)?;
        let project = store
            .project()?
            .ok_or_else(|| Error::NoWorkingCopy(store.root().to_path_buf()))?;
        let scm_url = store.scm_url()?;

        let name = match store.package()? {
            Some(name) => name,
            None if scm_url.is_some() => dir_name(store.root()),
            None => return Err(Error::NoWorkingCopy(store.root().to_path_buf())),
        };

        let manifest = store.read_manifest(FILES_KEY)?.unwrap_or_default();
        let size_limit = store.size_limit()?;

        let package = Self {
            to_be_added: store.read_list(TO_BE_ADDED_KEY)?.unwrap_or_default(),
            to_be_deleted: store.read_list(TO_BE_DELETED_KEY)?.unwrap_or_default(),
            in_conflict: store.read_list(IN_CONFLICT_KEY)?.unwrap_or_default(),
            ctx,
            store,
            project,
            name,
            scm_url,
            manifest,
            size_limit,
        };
        debug!(package = %package.name, dir = %package.dir().display(), "opened package");
        Ok(package)
    }

    /// Create an empty working copy for `project/name` in `dir`.
    pub fn init(
        dir: impl AsRef<Path>,
        ctx: Context,
        project: &str,
        name: &str,
        size_limit: Option<u64>,
    ) -> Result<Self> {
        let store = Store::init(dir)?;
        store.set_apiurl(Some(&ctx.server.apiurl()))?;
        store.set_project(project)?;
        store.set_package(name)?;
        let manifest = Manifest {
            name: Some(name.to_string()),
            ..Manifest::default()
        };
        store.write_manifest(FILES_KEY, Some(&manifest))?;
        store.set_size_limit(size_limit)?;
        info!(project, package = name, "initialized package working copy");

        Ok(Self {
            ctx,
            store,
            project: project.to_string(),
            name: name.to_string(),
            scm_url: None,
            manifest,
            to_be_added: Vec::new(),
            to_be_deleted: Vec::new(),
            in_conflict: Vec::new(),
            size_limit,
        })
    }

    /// Initialize `dir` and bring it to `options.revision` (latest when unset).
    pub fn checkout(
        dir: impl AsRef<Path>,
        ctx: Context,
        project: &str,
        name: &str,
        options: &UpdateOptions,
    ) -> Result<(Self, UpdateReport)> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let size_limit = ctx.config.size_limit;
        let meta = ctx.server.fetch_package_meta(project, name)?;

        let mut package = Self::init(dir, ctx, project, name, size_limit)?;
        package.store.set_meta(Some(&meta))?;
        let report = package.update(options)?;
        Ok((package, report))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn dir(&self) -> &Path {
        self.store.root()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn rev(&self) -> Option<&str> {
        self.manifest.rev.as_deref()
    }

    pub fn srcmd5(&self) -> Option<&str> {
        self.manifest.srcmd5.as_deref()
    }

    pub fn linkinfo(&self) -> Option<&LinkInfo> {
        self.manifest.linkinfo.as_ref()
    }

    pub fn serviceinfo(&self) -> Option<&ServiceInfo> {
        self.manifest.serviceinfo.as_ref()
    }

    pub fn is_link(&self) -> bool {
        self.manifest.is_link()
    }

    pub fn is_expanded_link(&self) -> bool {
        self.manifest.is_expanded_link()
    }

    /// Checkouts managed by an external SCM carry no manifest of their own.
    pub fn is_scm(&self) -> bool {
        self.scm_url.is_some()
    }

    pub fn size_limit(&self) -> Option<u64> {
        self.size_limit
    }

    pub fn to_be_added(&self) -> &[String] {
        &self.to_be_added
    }

    pub fn to_be_deleted(&self) -> &[String] {
        &self.to_be_deleted
    }

    pub fn in_conflict(&self) -> &[String] {
        &self.in_conflict
    }

    /// Manifest entries not materialized locally.
    pub fn skipped(&self) -> Vec<String> {
        self.manifest.skipped()
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir().join(name)
    }

    fn ensure_classic(&self) -> Result<()> {
        match &self.scm_url {
            Some(url) => Err(Error::InvalidArgument(format!(
                "{} is managed by {url}; use the SCM to work on it",
                self.name
            ))),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    fn facts(&self, name: &str) -> FileFacts {
        let skipped = self.manifest.find(name).is_some_and(|f| f.skipped);
        FileFacts {
            on_disk: self.path_of(name).exists(),
            in_cache: self.store.has_source(name),
            in_manifest: self.manifest.contains(name),
            to_be_added: self.to_be_added.iter().any(|n| n == name),
            to_be_deleted: self.to_be_deleted.iter().any(|n| n == name),
            in_conflict: self.in_conflict.iter().any(|n| n == name),
            skipped,
        }
    }

    /// Status of one file.
    pub fn status(&self, name: &str) -> Result<FileStatus> {
        let facts = self.facts(name);
        match classify(facts) {
            Some(Verdict::Status(status)) => Ok(status),
            Some(Verdict::CompareContent) => self.compare_content(name),
            None => Err(Error::internal(
                &self.name,
                format!("no status for {name} ({facts:?})"),
            )),
        }
    }

    fn compare_content(&self, name: &str) -> Result<FileStatus> {
        let entry = self
            .manifest
            .find(name)
            .ok_or_else(|| Error::internal(&self.name, format!("{name} is not in the manifest")))?;
        let local = self.path_of(name);
        if fs::metadata(&local)?.len() != entry.size {
            return Ok(FileStatus::Modified);
        }
        if md5_file(&local)? != entry.md5 {
            return Ok(FileStatus::Modified);
        }
        Ok(FileStatus::Unchanged)
    }

    /// Status of every tracked, pending and unversioned file, sorted by name.
    pub fn status_all(&self) -> Result<Vec<(FileStatus, String)>> {
        let mut names: BTreeSet<String> = self.manifest.names().into_iter().collect();
        names.extend(self.to_be_added.iter().cloned());
        names.extend(self.in_conflict.iter().cloned());
        names.extend(self.unversioned()?);

        names
            .into_iter()
            .map(|name| self.status(&name).map(|status| (status, name)))
            .collect()
    }

    /// Files on disk that are neither tracked nor excluded by configuration.
    pub fn unversioned(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == STORE_DIR
                || self.ctx.config.is_excluded(&name)
                || self.manifest.contains(&name)
                || self.to_be_added.contains(&name)
                || self.in_conflict.contains(&name)
            {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    // =========================================================================
    // Pending changes
    // =========================================================================

    /// Schedule an on-disk file for addition.
    pub fn add_file(&mut self, name: &str) -> Result<FileStatus> {
        check_file_name(name)?;
        if !self.path_of(name).is_file() {
            return Err(Error::InvalidArgument(format!("{name} does not exist")));
        }

        if let Some(pos) = self.to_be_deleted.iter().position(|n| n == name) {
            self.to_be_deleted.remove(pos);
            self.persist(TO_BE_DELETED_KEY)?;
        } else if self.manifest.contains(name) || self.to_be_added.iter().any(|n| n == name) {
            return Err(Error::file_conflict(
                &self.name,
                name,
                "already under version control",
            ));
        }

        self.to_be_added.push(name.to_string());
        self.persist(TO_BE_ADDED_KEY)?;
        debug!(package = %self.name, file = name, "scheduled for addition");
        self.status(name)
    }

    /// Remove a file from disk and schedule its deletion.
    ///
    /// Without `force`, files carrying local state (`?`, `A`, `M`, `R`, `C`)
    /// are left alone and `deleted` is false.
    pub fn delete_file(&mut self, name: &str, force: bool) -> Result<DeleteOutcome> {
        let status = match self.status(name) {
            Ok(status) => status,
            Err(_) if force => FileStatus::Unversioned,
            Err(e) => return Err(e),
        };

        if !force && status.has_local_changes() {
            return Ok(DeleteOutcome {
                deleted: false,
                status,
            });
        }

        if status == FileStatus::Skipped {
            let deleted = remove_if_exists(self.path_of(name))?;
            return Ok(DeleteOutcome { deleted, status });
        }

        remove_if_exists(self.path_of(name))?;
        let was_added = self.to_be_added.iter().any(|n| n == name);

        match status {
            FileStatus::Added | FileStatus::Replaced => self.drop_pending_add(name)?,
            FileStatus::Missing if was_added => self.drop_pending_add(name)?,
            FileStatus::Conflicted => {
                self.in_conflict.retain(|n| n != name);
                self.persist(IN_CONFLICT_KEY)?;
            }
            _ => {}
        }

        let untracked = matches!(status, FileStatus::Added | FileStatus::Unversioned)
            || (status == FileStatus::Missing && was_added)
            || !self.manifest.contains(name);
        if !untracked && !self.to_be_deleted.iter().any(|n| n == name) {
            self.to_be_deleted.push(name.to_string());
            self.persist(TO_BE_DELETED_KEY)?;
        }

        debug!(package = %self.name, file = name, %status, "deleted");
        Ok(DeleteOutcome {
            deleted: true,
            status,
        })
    }

    /// Discard local changes to one file.
    pub fn revert(&mut self, name: &str) -> Result<()> {
        let tracked = self.manifest.contains(name);
        let added = self.to_be_added.iter().any(|n| n == name);
        let conflicted = self.in_conflict.iter().any(|n| n == name);
        if !tracked && !added && !conflicted {
            return Err(Error::InvalidArgument(format!(
                "{name} is not under version control"
            )));
        }
        if self.manifest.find(name).is_some_and(|f| f.skipped) {
            return Err(Error::InvalidArgument(format!(
                "{name} is skipped and cannot be reverted"
            )));
        }
        if tracked && !self.store.has_source(name) {
            return Err(Error::internal(
                &self.name,
                format!("{name} has no pristine copy"),
            ));
        }

        let status = self.status(name)?;
        let pure_add =
            status == FileStatus::Added || (status == FileStatus::Missing && added);
        if !pure_add && self.store.has_source(name) {
            copy_atomic(self.store.source_path(name), self.path_of(name))?;
        }

        match status {
            FileStatus::Deleted => {
                self.to_be_deleted.retain(|n| n != name);
                self.persist(TO_BE_DELETED_KEY)?;
            }
            FileStatus::Conflicted => self.clear_conflict(name)?,
            FileStatus::Added | FileStatus::Replaced => self.drop_pending_add(name)?,
            FileStatus::Missing if added => self.drop_pending_add(name)?,
            _ => {}
        }
        info!(package = %self.name, file = name, %status, "reverted");
        Ok(())
    }

    /// Mark a conflict as resolved, keeping the working file as it is.
    pub fn resolved(&mut self, name: &str) -> Result<()> {
        if !self.in_conflict.iter().any(|n| n == name) {
            return Err(Error::InvalidArgument(format!("{name} is not in conflict")));
        }
        self.clear_conflict(name)
    }

    fn clear_conflict(&mut self, name: &str) -> Result<()> {
        self.in_conflict.retain(|n| n != name);
        self.persist(IN_CONFLICT_KEY)?;
        remove_if_exists(self.path_of(&format!("{name}{MINE_SUFFIX}")))?;
        remove_if_exists(self.path_of(&format!("{name}{NEW_SUFFIX}")))?;
        Ok(())
    }

    fn drop_pending_add(&mut self, name: &str) -> Result<()> {
        self.to_be_added.retain(|n| n != name);
        self.persist(TO_BE_ADDED_KEY)
    }

    pub(crate) fn add_conflict(&mut self, name: &str) -> Result<()> {
        if !self.in_conflict.iter().any(|n| n == name) {
            self.in_conflict.push(name.to_string());
            self.persist(IN_CONFLICT_KEY)?;
        }
        Ok(())
    }

    /// Write one pending set back to the store.
    fn persist(&self, key: &str) -> Result<()> {
        let list = match key {
            TO_BE_ADDED_KEY => &self.to_be_added,
            TO_BE_DELETED_KEY => &self.to_be_deleted,
            IN_CONFLICT_KEY => &self.in_conflict,
            _ => return Err(Error::internal(&self.name, format!("{key} is not a pending set"))),
        };
        let value = (!list.is_empty()).then_some(list.as_slice());
        self.store.write_list(key, value)
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Names of store entries that violate the working-copy invariants.
    pub fn check(&self) -> Result<Vec<String>> {
        if self.is_scm() {
            return Ok(Vec::new());
        }

        let mut dirty = Vec::new();
        for key in [APIURL_KEY, PROJECT_KEY, PACKAGE_KEY, FILES_KEY] {
            if !self.store.key_path(key).is_file() {
                dirty.push(key.to_string());
            }
        }

        for entry in &self.manifest.files {
            let exempt = entry.skipped || self.to_be_deleted.contains(&entry.name);
            if !exempt && !self.store.has_source(&entry.name) {
                dirty.push(entry.name.clone());
            }
        }
        for name in self.store.list_sources()? {
            let known = self.manifest.find(&name).is_some_and(|f| !f.skipped);
            if !known {
                dirty.push(name);
            }
        }
        for name in &self.to_be_deleted {
            if !self.manifest.contains(name) {
                dirty.push(name.clone());
            }
        }
        for name in &self.in_conflict {
            if !self.manifest.contains(name) && !self.path_of(name).exists() {
                dirty.push(name.clone());
            }
        }

        dirty.sort();
        dirty.dedup();
        if !dirty.is_empty() {
            warn!(package = %self.name, ?dirty, "working copy is inconsistent");
        }
        Ok(dirty)
    }

    /// Bring the store back in line with the manifest.
    ///
    /// Refetches missing pristine copies at the recorded revision, drops
    /// stray cache entries and stale pending names, and restores a missing
    /// server URL or manifest. Missing project or package names cannot be
    /// recovered.
    pub fn repair(&mut self) -> Result<Vec<String>> {
        self.ensure_classic()?;
        let dirty = self.check()?;
        if dirty.is_empty() {
            return Ok(dirty);
        }

        if self.store.apiurl()?.is_none() {
            self.store.set_apiurl(Some(&self.ctx.server.apiurl()))?;
        }
        if !self.store.key_path(FILES_KEY).is_file() {
            let mut manifest =
                self.ctx
                    .server
                    .fetch_manifest(&self.project, &self.name, None)?;
            self.mark_skipped(&mut manifest, false);
            self.store.write_manifest(FILES_KEY, Some(&manifest))?;
            self.manifest = manifest;
        }

        let revision = self.manifest.rev.clone();
        let missing: Vec<String> = self
            .manifest
            .files
            .iter()
            .filter(|f| !f.skipped && !self.store.has_source(&f.name))
            .map(|f| f.name.clone())
            .collect();
        for name in missing {
            info!(package = %self.name, file = %name, "refetching pristine copy");
            let content = self.ctx.server.fetch_file(
                &self.project,
                &self.name,
                &name,
                revision.as_deref(),
            )?;
            self.store.write_source(&name, &content)?;
        }

        for name in self.store.list_sources()? {
            if !self.manifest.find(&name).is_some_and(|f| !f.skipped) {
                info!(package = %self.name, file = %name, "dropping stray pristine copy");
                self.store.remove_source(&name)?;
            }
        }

        let manifest = &self.manifest;
        self.to_be_deleted.retain(|n| manifest.contains(n));
        self.persist(TO_BE_DELETED_KEY)?;
        let root = self.store.root().to_path_buf();
        self.in_conflict
            .retain(|n| manifest.contains(n) || root.join(n).exists());
        self.persist(IN_CONFLICT_KEY)?;

        let remaining = self.check()?;
        if !remaining.is_empty() {
            return Err(Error::WorkingCopyInconsistent {
                path: self.dir().to_path_buf(),
                files: remaining,
            });
        }
        Ok(dirty)
    }

    // =========================================================================
    // Server-side state
    // =========================================================================

    /// Project the package meta says this package belongs to.
    pub fn meta_project(&self) -> Result<Option<String>> {
        match self.store.meta()? {
            Some(meta) => crate::server::meta_project(&meta),
            None => Ok(None),
        }
    }

    /// Whether the package was inherited from another project.
    pub fn is_link_to_different_project(&self) -> Result<bool> {
        Ok(self
            .meta_project()?
            .is_some_and(|origin| origin != self.project))
    }

    /// Compare local checksums with a project-wide source listing.
    ///
    /// May report an update as needed when none is (service checksums move
    /// with every service run); never the other way round.
    pub fn update_needed(&self, info: Option<&SourceInfo>) -> bool {
        let Some(info) = info else {
            return true;
        };
        let local = self.srcmd5();

        if self.is_link() && self.is_expanded_link() {
            return info.srcmd5.as_deref() != local;
        }
        if let Some(service) = self.serviceinfo() {
            if service.is_expanded() {
                return info.lsrcmd5.as_deref() != local;
            }
            return info.lsrcmd5 != service.xsrcmd5;
        }
        if self.is_link() {
            let upstream = info.lsrcmd5.as_deref().or(info.srcmd5.as_deref());
            return upstream != local;
        }
        info.srcmd5.as_deref() != local
    }

    /// Skip oversized files and, unless requested, service-generated ones.
    pub(crate) fn mark_skipped(&self, manifest: &mut Manifest, service_files: bool) {
        for entry in &mut manifest.files {
            let too_big = self.size_limit.is_some_and(|limit| entry.size > limit);
            let service = !service_files && entry.is_service_file();
            entry.skipped = too_big || service;
        }
    }

    /// Names mapped to their pristine checksums, for tests and diagnostics.
    pub fn pristine_checksums(&self) -> Result<HashMap<String, String>> {
        let mut sums = HashMap::new();
        for name in self.store.list_sources()? {
            let md5 = md5_file(self.store.source_path(&name))?;
            sums.insert(name, md5);
        }
        Ok(sums)
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("project", &self.project)
            .field("name", &self.name)
            .field("dir", &self.dir())
            .field("rev", &self.rev())
            .finish_non_exhaustive()
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Working-copy file names are flat and never collide with the store.
fn check_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." || name == STORE_DIR {
        return Err(Error::InvalidArgument(format!(
            "{name:?} is not a valid file name"
        )));
    }
    Ok(())
}
