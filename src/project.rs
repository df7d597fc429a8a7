//! Project working copy
//!
//! A project checkout is a directory of package checkouts plus a store that
//! records the project-level intent for each package (`_packages`):
//! tracked (`' '`), created locally (`A`) or scheduled for deletion (`D`).
//! That list is independent of each package's own file-level state.
//!
//! `update` and `commit` fan out over the member packages. Both rewrite the
//! package list when they finish, whether or not a package operation failed
//! along the way.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::lock::remove_if_exists;
use crate::manifest::ServiceInfo;
use crate::package::{CommitOptions, CommitOutcome, Package, UpdateOptions, UpdateReport};
use crate::package_list::{PackageList, PackageState};
use crate::server::SourceInfo;
use crate::status::FileStatus;
use crate::store::{Store, STORE_DIR};

/// Project-level status of one package directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    /// `' '`
    Tracked,
    /// `A` not yet created on the server
    Added,
    /// `D` scheduled for deletion on the server
    Deleted,
    /// `!` tracked but gone from disk
    Missing,
    /// `?` a directory the project does not track
    Unversioned,
}

impl PackageStatus {
    pub fn code(self) -> char {
        match self {
            PackageStatus::Tracked => ' ',
            PackageStatus::Added => 'A',
            PackageStatus::Deleted => 'D',
            PackageStatus::Missing => '!',
            PackageStatus::Unversioned => '?',
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectUpdateOptions {
    /// Only these packages; the whole project when empty
    pub packages: Vec<String>,
    /// Switch unexpanded links to their expanded sources
    pub expand_link: bool,
    /// Switch expanded links back to the link itself
    pub unexpand_link: bool,
    pub service_files: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct ProjectUpdateReport {
    pub updated: Vec<(String, UpdateReport)>,
    pub unchanged: Vec<String>,
    pub checked_out: Vec<String>,
    /// Removed locally because the server no longer has them
    pub removed: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectCommitOptions {
    /// Only these packages; the whole project when empty
    pub packages: Vec<String>,
    /// Per-package file subsets
    pub files: HashMap<String, Vec<String>>,
    pub message: String,
    pub can_branch: bool,
    pub force: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct ProjectCommitReport {
    pub committed: Vec<(String, CommitOutcome)>,
    /// Created on the server by this commit
    pub created: Vec<String>,
    /// Deleted on the server by this commit
    pub deleted: Vec<String>,
    /// Package directories the project does not track
    pub unversioned: Vec<String>,
    /// Requested packages with no directory on disk
    pub missing: Vec<String>,
}

pub struct Project {
    ctx: Context,
    store: Store,
    name: String,
    packages: PackageList,
}

impl Project {
    /// Open a project checkout.
    ///
    /// When the package list is missing it is rebuilt from the package
    /// working copies found on disk.
    pub fn open(dir: impl AsRef<Path>, ctx: Context) -> Result<Self> {
        let store = Store::open(dir)?;
        if store.package()?.is_some() {
            return Err(Error::InvalidArgument(format!(
                "{} is a package working copy, not a project",
                store.root().display()
            )));
        }
        let name = store
            .project()?
            .ok_or_else(|| Error::NoWorkingCopy(store.root().to_path_buf()))?;

        let packages = match store.read_package_list()? {
            Some(list) => list,
            None => {
                let list = bootstrap_package_list(store.root(), &name)?;
                info!(project = %name, count = list.entries.len(), "rebuilt package list from disk");
                store.write_package_list(&list)?;
                list
            }
        };

        Ok(Self {
            ctx,
            store,
            name,
            packages,
        })
    }

    /// Create an empty project checkout in `dir`.
    pub fn init(dir: impl AsRef<Path>, ctx: Context, name: &str) -> Result<Self> {
        let store = Store::init(dir)?;
        store.set_apiurl(Some(&ctx.server.apiurl()))?;
        store.set_project(name)?;
        let packages = PackageList::new(name);
        store.write_package_list(&packages)?;
        info!(project = name, "initialized project working copy");

        Ok(Self {
            ctx,
            store,
            name: name.to_string(),
            packages,
        })
    }

    /// Initialize `dir` and check out every package of the project.
    pub fn checkout(
        dir: impl AsRef<Path>,
        ctx: Context,
        name: &str,
        options: &ProjectUpdateOptions,
    ) -> Result<(Self, ProjectUpdateReport)> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut project = Self::init(dir, ctx, name)?;
        let report = project.update(options)?;
        Ok((project, report))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        self.store.root()
    }

    pub fn packages(&self) -> &PackageList {
        &self.packages
    }

    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.dir().join(package)
    }

    pub fn open_package(&self, package: &str) -> Result<Package> {
        Package::open(self.package_dir(package), self.ctx.clone())
    }

    fn write_packages(&self) -> Result<()> {
        self.store.write_package_list(&self.packages)
    }

    // =========================================================================
    // Derived package sets
    // =========================================================================

    /// Packages the server knows for this project.
    pub fn available(&self) -> Result<Vec<String>> {
        self.ctx.server.list_packages(&self.name)
    }

    /// Packages in the local list, in list order.
    pub fn have(&self) -> Vec<String> {
        self.packages.names()
    }

    /// Available upstream but not in the local list.
    pub fn missing(&self, available: &[String]) -> Vec<String> {
        available
            .iter()
            .filter(|p| self.packages.state(p).is_none())
            .cloned()
            .collect()
    }

    /// Listed but without a directory on disk.
    pub fn broken(&self) -> Vec<String> {
        self.packages
            .entries
            .iter()
            .filter(|e| !self.package_dir(&e.name).is_dir())
            .map(|e| e.name.clone())
            .collect()
    }

    /// Directories the list does not know and no exclude glob matches.
    pub fn unversioned(&self) -> Result<Vec<String>> {
        Ok(self
            .subdirs()?
            .into_iter()
            .filter(|d| self.packages.state(d).is_none() && !self.ctx.config.is_excluded(d))
            .collect())
    }

    /// Directories hidden by an exclude glob.
    pub fn excluded(&self) -> Result<Vec<String>> {
        Ok(self
            .subdirs()?
            .into_iter()
            .filter(|d| d != STORE_DIR && self.ctx.config.is_excluded(d))
            .collect())
    }

    fn subdirs(&self) -> Result<Vec<String>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(self.dir())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    // =========================================================================
    // Package-level intent
    // =========================================================================

    pub fn status(&self, package: &str) -> Result<PackageStatus> {
        let on_disk = self.package_dir(package).is_dir();
        let status = match (self.packages.state(package), on_disk) {
            (Some(PackageState::Deleted), _) => PackageStatus::Deleted,
            (Some(_), false) => PackageStatus::Missing,
            (Some(PackageState::Added), true) => PackageStatus::Added,
            (Some(PackageState::Tracked), true) => PackageStatus::Tracked,
            (None, true) if !self.ctx.config.is_excluded(package) => PackageStatus::Unversioned,
            (None, _) => {
                return Err(Error::InvalidArgument(format!(
                    "{package} is not under version control"
                )))
            }
        };
        Ok(status)
    }

    /// Status of every listed and unversioned package, sorted by name.
    pub fn status_all(&self) -> Result<Vec<(PackageStatus, String)>> {
        let mut names: BTreeSet<String> = self.have().into_iter().collect();
        names.extend(self.unversioned()?);
        names
            .into_iter()
            .map(|name| self.status(&name).map(|status| (status, name)))
            .collect()
    }

    /// Record `package` as added. Re-adding a package scheduled for
    /// deletion flips it back to `A`. An existing plain directory gets an
    /// empty package working copy; its files stay unversioned.
    pub fn add_package(&mut self, package: &str) -> Result<()> {
        self.check_addable(package)?;
        let dir = self.package_dir(package);
        if dir.is_dir() && !Store::exists(&dir) {
            Package::init(
                &dir,
                self.ctx.clone(),
                &self.name,
                package,
                self.ctx.config.size_limit,
            )?;
        }
        self.packages.set_state(package, PackageState::Added);
        self.write_packages()?;
        debug!(project = %self.name, package, "package added");
        Ok(())
    }

    /// Create a package directory with an empty working copy and add it.
    pub fn create_package(&mut self, package: &str) -> Result<Package> {
        self.check_addable(package)?;
        let dir = self.package_dir(package);
        if Store::exists(&dir) {
            return Err(Error::PackageExists {
                package: package.to_string(),
                reason: format!("{} already holds a working copy", dir.display()),
            });
        }
        fs::create_dir_all(&dir)?;
        let created = Package::init(
            &dir,
            self.ctx.clone(),
            &self.name,
            package,
            self.ctx.config.size_limit,
        )?;
        self.packages.set_state(package, PackageState::Added);
        self.write_packages()?;
        info!(project = %self.name, package, "created package");
        Ok(created)
    }

    fn check_addable(&self, package: &str) -> Result<()> {
        if package.is_empty() || package.contains('/') || package == STORE_DIR {
            return Err(Error::InvalidArgument(format!(
                "{package:?} is not a valid package name"
            )));
        }
        if self.ctx.config.is_excluded(package) {
            return Err(Error::InvalidArgument(format!(
                "{package} is excluded by an exclude_glob pattern"
            )));
        }
        match self.packages.state(package) {
            None | Some(PackageState::Deleted) => Ok(()),
            Some(_) => Err(Error::PackageExists {
                package: package.to_string(),
                reason: "already under version control".to_string(),
            }),
        }
    }

    /// Schedule a package for deletion, removing its files locally.
    ///
    /// A package with local modifications, conflicts, pending additions or
    /// unversioned files is left alone unless `force` is set; the return
    /// value says whether anything happened.
    pub fn delete_package(&mut self, package: &str, force: bool) -> Result<bool> {
        match self.packages.state(package) {
            None => Err(Error::InvalidArgument(format!(
                "{package} is not under version control"
            ))),
            Some(PackageState::Added) => {
                if !force {
                    return Ok(false);
                }
                let dir = self.package_dir(package);
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
                self.packages.remove(package);
                self.write_packages()?;
                Ok(true)
            }
            Some(PackageState::Tracked) | Some(PackageState::Deleted) => {
                if !self.package_dir(package).is_dir() {
                    self.packages.set_state(package, PackageState::Deleted);
                    self.write_packages()?;
                    return Ok(true);
                }
                let mut target = self.open_package(package)?;
                let files = target.status_all()?;
                let clean = files.iter().all(|(status, _)| {
                    !matches!(
                        status,
                        FileStatus::Modified
                            | FileStatus::Conflicted
                            | FileStatus::Added
                            | FileStatus::Unversioned
                    )
                });
                if !clean && !force {
                    return Ok(false);
                }
                for (_, name) in &files {
                    target.delete_file(name, true)?;
                }
                self.packages.set_state(package, PackageState::Deleted);
                self.write_packages()?;
                info!(project = %self.name, package, "package scheduled for deletion");
                Ok(true)
            }
        }
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Reconcile local packages with the server and update each of them.
    pub fn update(&mut self, options: &ProjectUpdateOptions) -> Result<ProjectUpdateReport> {
        let mut report = ProjectUpdateReport::default();
        let result = if options.packages.is_empty() {
            self.update_all(options, &mut report)
        } else {
            self.update_selected(options, &mut report)
        };
        let written = self.write_packages();
        result?;
        written?;
        Ok(report)
    }

    fn update_selected(
        &mut self,
        options: &ProjectUpdateOptions,
        report: &mut ProjectUpdateReport,
    ) -> Result<()> {
        for package in &options.packages {
            match self.packages.state(package) {
                Some(PackageState::Added) => report.skipped.push(package.clone()),
                Some(_) => self.update_package(package, None, options, report)?,
                None => {
                    if !self.available()?.contains(package) {
                        return Err(Error::PackageMissing {
                            package: package.clone(),
                            reason: format!("not available in {}", self.name),
                        });
                    }
                    self.checkout_package(package, options, report)?;
                }
            }
        }
        Ok(())
    }

    fn update_all(
        &mut self,
        options: &ProjectUpdateOptions,
        report: &mut ProjectUpdateReport,
    ) -> Result<()> {
        let available = self.available()?;

        let gone: Vec<String> = self
            .packages
            .entries
            .iter()
            .filter(|e| e.state != PackageState::Added && !available.contains(&e.name))
            .map(|e| e.name.clone())
            .collect();
        for package in gone {
            info!(project = %self.name, package = %package, "removed on the server");
            self.remove_local(&package)?;
            self.packages.remove(&package);
            report.removed.push(package);
        }

        let missing: Vec<String> = self
            .missing(&available)
            .into_iter()
            .filter(|p| !self.ctx.config.is_excluded(p))
            .collect();
        let mut query: Vec<String> = self
            .packages
            .entries
            .iter()
            .filter(|e| e.state != PackageState::Added)
            .map(|e| e.name.clone())
            .collect();
        query.extend(missing.iter().cloned());
        let infos = self.ctx.server.source_info(&self.name, &query)?;

        for entry in self.packages.entries.clone() {
            let package = entry.name.as_str();
            match entry.state {
                PackageState::Added => {
                    if available.iter().any(|p| p == package) {
                        warn!(project = %self.name, package, "already exists on the server; commit it to track it");
                    }
                    report.skipped.push(package.to_string());
                }
                PackageState::Tracked | PackageState::Deleted => {
                    if self.package_dir(package).is_dir() {
                        self.update_package(package, infos.get(package), options, report)?;
                    } else if entry.state == PackageState::Tracked {
                        self.checkout_package(package, options, report)?;
                    }
                }
            }
        }

        for package in &missing {
            if self.package_dir(package).exists() {
                return Err(Error::PackageExists {
                    package: package.clone(),
                    reason: "an unversioned directory is in the way".to_string(),
                });
            }
            let links_back = infos
                .get(package)
                .and_then(|info| info.linked.as_ref())
                .is_some_and(|(linked_project, _)| linked_project == &self.name);
            if links_back && !options.expand_link && !options.unexpand_link {
                debug!(project = %self.name, package = %package, "skipping link into the same project");
                report.skipped.push(package.clone());
                continue;
            }
            self.checkout_package(package, options, report)?;
        }
        Ok(())
    }

    fn update_package(
        &mut self,
        package: &str,
        info: Option<&SourceInfo>,
        options: &ProjectUpdateOptions,
        report: &mut ProjectUpdateReport,
    ) -> Result<()> {
        let mut target = self.open_package(package)?;
        if target.is_scm() {
            report.skipped.push(package.to_string());
            return Ok(());
        }

        let linkinfo = target.linkinfo().cloned();
        let (needed, revision) = match linkinfo {
            Some(link) if options.expand_link && link.is_link() && !link.is_expanded() => {
                (true, link.xsrcmd5)
            }
            Some(link) if options.unexpand_link && link.is_expanded() => (true, link.lsrcmd5),
            _ if !options.service_files
                && target.serviceinfo().is_some_and(ServiceInfo::is_expanded) =>
            {
                (true, None)
            }
            _ => (target.update_needed(info), None),
        };

        if !needed {
            report.unchanged.push(package.to_string());
            return Ok(());
        }
        let result = target.update(&UpdateOptions {
            revision,
            service_files: options.service_files,
        })?;
        report.updated.push((package.to_string(), result));
        Ok(())
    }

    fn checkout_package(
        &mut self,
        package: &str,
        options: &ProjectUpdateOptions,
        report: &mut ProjectUpdateReport,
    ) -> Result<()> {
        info!(project = %self.name, package, "checking out");
        let dir = self.package_dir(package);
        let fresh = !dir.exists();
        let checkout = Package::checkout(
            &dir,
            self.ctx.clone(),
            &self.name,
            package,
            &UpdateOptions {
                revision: None,
                service_files: options.service_files,
            },
        );
        if let Err(e) = checkout {
            // A half-made checkout would look like an unversioned directory.
            if fresh && dir.exists() {
                warn!(project = %self.name, package, error = %e, "removing incomplete checkout");
                fs::remove_dir_all(&dir)?;
            }
            return Err(e);
        }
        self.packages.set_state(package, PackageState::Tracked);
        report.checked_out.push(package.to_string());
        Ok(())
    }

    /// Remove a package's tracked files and store; unversioned files stay.
    fn remove_local(&self, package: &str) -> Result<()> {
        let dir = self.package_dir(package);
        if !dir.is_dir() {
            return Ok(());
        }
        if let Ok(existing) = Package::open_unchecked(&dir, self.ctx.clone()) {
            let mut names = existing.manifest().names();
            names.extend(existing.to_be_added().iter().cloned());
            for name in names {
                remove_if_exists(dir.join(name))?;
            }
        }
        remove_store(&dir)
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commit every package according to its project-level state.
    pub fn commit(&mut self, options: &ProjectCommitOptions) -> Result<ProjectCommitReport> {
        let mut report = ProjectCommitReport::default();
        let result = self.commit_packages(options, &mut report);
        let written = self.write_packages();
        result?;
        written?;
        Ok(report)
    }

    fn commit_packages(
        &mut self,
        options: &ProjectCommitOptions,
        report: &mut ProjectCommitReport,
    ) -> Result<()> {
        let targets = if options.packages.is_empty() {
            for package in self.broken() {
                if self.packages.state(&package) != Some(PackageState::Deleted) {
                    return Err(Error::PackageMissing {
                        package,
                        reason: "tracked but missing on disk".to_string(),
                    });
                }
            }
            report.unversioned = self.unversioned()?;
            self.have()
        } else {
            options.packages.clone()
        };

        for package in &targets {
            let package_options = CommitOptions {
                message: options.message.clone(),
                files: options.files.get(package).cloned().unwrap_or_default(),
                can_branch: options.can_branch,
                force: options.force,
                wait_for_services: None,
            };
            let on_disk = self.package_dir(package).is_dir();

            match self.packages.state(package) {
                Some(PackageState::Added) => {
                    self.commit_new_package(package, &package_options, report)?
                }
                Some(PackageState::Deleted) => self.commit_deleted_package(package, report)?,
                Some(PackageState::Tracked) if on_disk => {
                    let outcome = self.open_package(package)?.commit(&package_options)?;
                    report.committed.push((package.clone(), outcome));
                }
                Some(PackageState::Tracked) => report.missing.push(package.clone()),
                None if on_disk => report.unversioned.push(package.clone()),
                None => report.missing.push(package.clone()),
            }
        }
        Ok(())
    }

    fn commit_new_package(
        &mut self,
        package: &str,
        options: &CommitOptions,
        report: &mut ProjectCommitReport,
    ) -> Result<()> {
        let server = self.ctx.server.clone();
        let mut target = self.open_package(package)?;
        if self.available()?.iter().any(|p| p == package) {
            info!(project = %self.name, package, "already on the server; committing its content");
        } else {
            server.create_package(&self.name, package)?;
            report.created.push(package.to_string());
        }

        let meta = server.fetch_package_meta(&self.name, package)?;
        target.store().set_meta(Some(&meta))?;
        let outcome = target.commit(options)?;

        self.packages.set_state(package, PackageState::Tracked);
        report.committed.push((package.to_string(), outcome));
        Ok(())
    }

    fn commit_deleted_package(
        &mut self,
        package: &str,
        report: &mut ProjectCommitReport,
    ) -> Result<()> {
        self.ctx.server.delete_package(&self.name, package)?;
        let dir = self.package_dir(package);
        if dir.is_dir() {
            remove_store(&dir)?;
        }
        self.packages.remove(package);
        report.deleted.push(package.to_string());
        info!(project = %self.name, package, "deleted package");
        Ok(())
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.name)
            .field("dir", &self.dir())
            .field("packages", &self.packages.entries.len())
            .finish_non_exhaustive()
    }
}

/// Drop a package's store and, if nothing else is left, its directory.
fn remove_store(dir: &Path) -> Result<()> {
    let store_dir = dir.join(STORE_DIR);
    if store_dir.exists() {
        fs::remove_dir_all(&store_dir)?;
    }
    if let Err(e) = fs::remove_dir(dir) {
        warn!(dir = %dir.display(), error = %e, "left package directory in place");
    }
    Ok(())
}

/// Rebuild the package list from package working copies on disk.
fn bootstrap_package_list(root: &Path, project: &str) -> Result<PackageList> {
    let mut list = PackageList::new(project);
    let mut dirs: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && Store::exists(entry.path()) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    for dir in dirs {
        let Some(dir_name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let store = match Store::open(&dir) {
            Ok(store) => store,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "ignoring unreadable package directory");
                continue;
            }
        };
        if store.package()?.as_deref() == Some(dir_name.as_str()) {
            list.set_state(&dir_name, PackageState::Tracked);
        }
    }
    Ok(list)
}
