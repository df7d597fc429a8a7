//! Commit protocol
//!
//! Sends local changes to the server as one new revision:
//!
//! 1. Refuse a stale working copy (local revision behind the server).
//! 2. Branch first when the package is inherited from another project.
//! 3. Build the complete new file list and copy changed files into
//!    `_in_commit/`.
//! 4. Submit the list; upload whatever the server reports as missing and
//!    resubmit, for at most [`MAX_COMMIT_ROUNDS`] upload rounds.
//! 5. Promote the staged files into the pristine cache and adopt the
//!    server's manifest.
//!
//! A failure before the server accepts the revision leaves the working copy
//! untouched. A crash after acceptance leaves `_in_commit/` behind; it must
//! be discarded explicitly before the next commit.

use std::collections::BTreeSet;
use std::fs;
use std::thread;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::update::{UpdateOptions, UpdateReport};
use super::Package;
use crate::error::{Error, Result};
use crate::file::{md5_file, File};
use crate::lock::{copy_atomic, StagingDir};
use crate::manifest::Manifest;
use crate::server::CommitResponse;
use crate::status::FileStatus;
use crate::store::{FILES_KEY, TO_BE_ADDED_KEY, TO_BE_DELETED_KEY};

/// Upload-and-resubmit rounds attempted before giving up on missing uploads.
/// The initial submission is not a round, so the server sees at most
/// `MAX_COMMIT_ROUNDS + 1` submissions.
pub const MAX_COMMIT_ROUNDS: usize = 3;

/// Name of the file that configures server-side source services
const SERVICE_FILE: &str = "_service";

#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub message: String,
    /// Restrict the commit to these files; all changes when empty
    pub files: Vec<String>,
    /// Allow branching an inherited package into this project first
    pub can_branch: bool,
    /// Create a revision even without changes
    pub force: bool,
    /// Override the configured wait for service runs
    pub wait_for_services: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    /// Revision created by the commit
    pub rev: Option<String>,
    /// Files whose content was sent
    pub sent: Vec<String>,
    /// Files removed by the commit
    pub deleted: Vec<String>,
    /// Submissions needed until the server accepted
    pub rounds: usize,
    /// The package was branched from its origin project first
    pub branched: bool,
    /// Update run after server-side services finished
    pub service_update: Option<UpdateReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed(CommitReport),
    NothingToDo,
}

/// The file list a commit would submit.
#[derive(Debug, Default)]
struct CommitPlan {
    entries: Vec<File>,
    send: Vec<String>,
    delete: Vec<String>,
}

impl Package {
    pub fn commit(&mut self, options: &CommitOptions) -> Result<CommitOutcome> {
        self.ensure_classic()?;

        let branched = self.branch_if_inherited(options.can_branch)?;
        self.check_up_to_date()?;

        let commit_dir = self.store.commit_staging_dir();
        if commit_dir.exists() {
            return Err(Error::StagingInProgress(commit_dir));
        }

        let plan = self.plan_commit(&options.files)?;
        if plan.send.is_empty() && plan.delete.is_empty() && !options.force {
            info!(package = %self.name, "nothing to commit");
            return Ok(CommitOutcome::NothingToDo);
        }

        let staging = StagingDir::acquire(&commit_dir)?;
        let (accepted, rounds) = match self.submit(&staging, &plan, &options.message) {
            Ok(result) => result,
            Err(e) => {
                staging.finish()?;
                return Err(e);
            }
        };
        self.promote_commit(staging, &plan, accepted)?;
        info!(
            package = %self.name,
            rev = ?self.rev(),
            sent = plan.send.len(),
            deleted = plan.delete.len(),
            rounds,
            "committed"
        );

        let wait = options
            .wait_for_services
            .unwrap_or(self.ctx.config.service.wait);
        let service_update = if wait && self.manifest.contains(SERVICE_FILE) {
            Some(self.wait_for_services()?)
        } else {
            None
        };

        Ok(CommitOutcome::Committed(CommitReport {
            rev: self.manifest.rev.clone(),
            sent: plan.send,
            deleted: plan.delete,
            rounds,
            branched,
            service_update,
        }))
    }

    /// Remove commit staging left by a crash after the server accepted.
    pub fn discard_commit_staging(&self) -> Result<bool> {
        match StagingDir::existing(self.store.commit_staging_dir()) {
            Some(staging) => {
                warn!(package = %self.name, "discarding commit staging");
                staging.finish()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn branch_if_inherited(&mut self, can_branch: bool) -> Result<bool> {
        let Some(origin) = self.meta_project()? else {
            return Ok(false);
        };
        if origin == self.project {
            return Ok(false);
        }
        if !can_branch {
            return Err(Error::InvalidArgument(format!(
                "{} is inherited from {origin}; allow branching to commit it into {}",
                self.name, self.project
            )));
        }

        info!(package = %self.name, from = %origin, to = %self.project, "branching before commit");
        let server = self.ctx.server.clone();
        server.branch(&origin, &self.name, &self.project)?;
        let meta = server.fetch_package_meta(&self.project, &self.name)?;
        self.store.set_meta(Some(&meta))?;
        self.update(&UpdateOptions::default())?;
        Ok(true)
    }

    fn check_up_to_date(&self) -> Result<()> {
        let upstream = self
            .ctx
            .server
            .latest_revision(&self.project, &self.name)?;
        if upstream.as_deref() != self.rev() {
            return Err(Error::WorkingCopyOutdated {
                path: self.dir().to_path_buf(),
                local: self.rev().unwrap_or("none").to_string(),
                upstream: upstream.unwrap_or_else(|| "none".to_string()),
            });
        }
        Ok(())
    }

    fn plan_commit(&self, files: &[String]) -> Result<CommitPlan> {
        let mut names: BTreeSet<String> = self.manifest.names().into_iter().collect();
        names.extend(self.to_be_added.iter().cloned());
        names.extend(self.in_conflict.iter().cloned());

        for name in files {
            if !names.contains(name) {
                return Err(Error::InvalidArgument(format!(
                    "{name} is not under version control"
                )));
            }
        }
        let selected = |name: &str| files.is_empty() || files.iter().any(|f| f == name);

        let mut plan = CommitPlan::default();
        for name in &names {
            if name.starts_with(crate::file::SERVICE_FILE_PREFIX) {
                continue;
            }
            let status = self.status(name)?;
            if status == FileStatus::Conflicted {
                return Err(Error::file_conflict(
                    &self.name,
                    name,
                    "unresolved conflict; mark it resolved first",
                ));
            }
            let pending_add = self.to_be_added.contains(name);

            if selected(name) {
                match status {
                    FileStatus::Added | FileStatus::Replaced | FileStatus::Modified => {
                        plan.entries.push(self.describe_local(name)?);
                        plan.send.push(name.clone());
                    }
                    FileStatus::Missing if pending_add => {
                        return Err(Error::file_conflict(
                            &self.name,
                            name,
                            "scheduled for addition but missing from disk",
                        ));
                    }
                    FileStatus::Deleted => plan.delete.push(name.clone()),
                    _ => plan.entries.push(self.recorded(name)?),
                }
            } else {
                match status {
                    FileStatus::Added => {}
                    FileStatus::Missing if pending_add => {}
                    _ => plan.entries.push(self.recorded(name)?),
                }
            }
        }
        debug!(package = %self.name, send = ?plan.send, delete = ?plan.delete, "commit plan");
        Ok(plan)
    }

    fn describe_local(&self, name: &str) -> Result<File> {
        let path = self.path_of(name);
        let metadata = fs::metadata(&path)?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(File::new(name, md5_file(&path)?, metadata.len(), mtime))
    }

    fn recorded(&self, name: &str) -> Result<File> {
        let mut entry = self
            .manifest
            .find(name)
            .cloned()
            .ok_or_else(|| Error::internal(&self.name, format!("{name} is not in the manifest")))?;
        entry.skipped = false;
        Ok(entry)
    }

    /// Submit the plan until accepted, uploading what the server lacks.
    fn submit(
        &self,
        staging: &StagingDir,
        plan: &CommitPlan,
        message: &str,
    ) -> Result<(Manifest, usize)> {
        for name in &plan.send {
            copy_atomic(self.path_of(name), staging.join(name))?;
        }

        let proposal = Manifest {
            name: Some(self.name.clone()),
            files: plan.entries.clone(),
            ..Manifest::default()
        };
        let server = &self.ctx.server;

        let mut submissions = 0;
        let mut round = 0;
        loop {
            submissions += 1;
            let response = server.submit_commit(&self.project, &self.name, &proposal, message)?;
            let missing = match response {
                CommitResponse::Accepted(manifest) => return Ok((manifest, submissions)),
                CommitResponse::Missing(missing) => missing,
            };
            if round >= MAX_COMMIT_ROUNDS {
                let names: Vec<&str> = missing.iter().map(|f| f.name.as_str()).collect();
                return Err(Error::internal(
                    &self.name,
                    format!(
                        "server still misses {} after {round} upload rounds",
                        names.join(", ")
                    ),
                ));
            }
            round += 1;
            for entry in &missing {
                debug!(package = %self.name, file = %entry.name, round, "uploading");
                let content = self.commit_content(staging, &entry.name)?;
                server.upload_file(&self.project, &self.name, &entry.name, &content)?;
            }
        }
    }

    /// Content of a file the server asked for, staged if it is not already.
    fn commit_content(&self, staging: &StagingDir, name: &str) -> Result<Vec<u8>> {
        if !self.manifest.contains(name) && !self.to_be_added.iter().any(|n| n == name) {
            return Err(Error::internal(
                &self.name,
                format!("server asked for {name}, which is not part of the package"),
            ));
        }
        let staged = staging.join(name);
        if !staged.is_file() {
            let source = if self.path_of(name).is_file() {
                self.path_of(name)
            } else {
                self.store.source_path(name)
            };
            copy_atomic(source, &staged)?;
        }
        Ok(fs::read(staged)?)
    }

    fn promote_commit(
        &mut self,
        staging: StagingDir,
        plan: &CommitPlan,
        accepted: Manifest,
    ) -> Result<()> {
        for name in staging.entries()? {
            self.store.move_to_source(staging.join(&name), &name)?;
        }
        for name in &plan.delete {
            self.store.remove_source(name)?;
        }

        self.to_be_deleted.retain(|n| !plan.delete.contains(n));
        self.to_be_added.retain(|n| !accepted.contains(n));
        self.persist(TO_BE_DELETED_KEY)?;
        self.persist(TO_BE_ADDED_KEY)?;

        self.store.write_manifest(FILES_KEY, Some(&accepted))?;
        self.manifest = accepted;
        staging.finish()
    }

    /// Poll until the server-side service run finishes, then update.
    fn wait_for_services(&mut self) -> Result<UpdateReport> {
        let interval = self.ctx.config.service.poll_interval();
        loop {
            let manifest = self
                .ctx
                .server
                .fetch_manifest(&self.project, &self.name, None)?;
            if !manifest.serviceinfo.as_ref().is_some_and(|s| s.is_running()) {
                break;
            }
            debug!(package = %self.name, "waiting for service run");
            thread::sleep(interval);
        }
        self.update(&UpdateOptions::default())
    }
}
