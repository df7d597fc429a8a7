#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use pkgwc::config::Config;
use pkgwc::context::Context;
use pkgwc::error::{Error, Result};
use pkgwc::file::{md5_hex, File};
use pkgwc::manifest::{LinkInfo, Manifest, ServiceInfo};
use pkgwc::package::{Package, UpdateOptions};
use pkgwc::server::{CommitResponse, Server, SourceInfo};
use tempfile::TempDir;

pub const PROJECT: &str = "home:tester";

type Files = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Default)]
struct MockPackage {
    /// `revisions[n - 1]` holds revision `n`
    revisions: Vec<Files>,
    meta_project: Option<String>,
    linked: Option<(String, String)>,
    linkinfo: Option<LinkInfo>,
}

#[derive(Debug, Default)]
struct State {
    packages: BTreeMap<(String, String), MockPackage>,
    /// Content the server holds, by checksum
    blobs: HashMap<String, Vec<u8>>,
    submits: usize,
    uploads: Vec<String>,
    ignore_uploads: bool,
    fail_create: bool,
    /// Packages whose file downloads fail
    unreachable: Vec<String>,
    running_service_polls: usize,
    branches: Vec<(String, String, String)>,
    messages: Vec<String>,
}

/// In-memory build service with scripted behavior.
#[derive(Debug, Default)]
pub struct MockServer {
    state: Mutex<State>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Create a package with a first revision holding `files`.
    pub fn add_package(&self, project: &str, package: &str, files: &[(&str, &str)]) {
        let mut state = self.state();
        let contents: Files = files
            .iter()
            .map(|(name, content)| (name.to_string(), content.as_bytes().to_vec()))
            .collect();
        for content in contents.values() {
            state.blobs.insert(md5_hex(content), content.clone());
        }
        let entry = state
            .packages
            .entry((project.to_string(), package.to_string()))
            .or_default();
        entry.revisions.push(contents);
    }

    /// New upstream revision: `Some(content)` writes a file, `None` removes it.
    pub fn commit_upstream(&self, project: &str, package: &str, changes: &[(&str, Option<&[u8]>)]) {
        let mut state = self.state();
        let mut new_blobs = Vec::new();
        let pkg = state
            .packages
            .get_mut(&(project.to_string(), package.to_string()))
            .expect("unknown package");
        let mut files = pkg.revisions.last().cloned().unwrap_or_default();
        for (name, change) in changes {
            match change {
                Some(content) => {
                    files.insert(name.to_string(), content.to_vec());
                    new_blobs.push(content.to_vec());
                }
                None => {
                    files.remove(*name);
                }
            }
        }
        pkg.revisions.push(files);
        for blob in new_blobs {
            state.blobs.insert(md5_hex(&blob), blob);
        }
    }

    /// Repeat the latest revision until the package is at `rev`.
    pub fn advance_to(&self, project: &str, package: &str, rev: usize) {
        while self.revision_count(project, package) < rev {
            self.commit_upstream(project, package, &[]);
        }
    }

    /// Make content known to the server without committing it anywhere.
    pub fn seed_blob(&self, content: &[u8]) {
        self.state().blobs.insert(md5_hex(content), content.to_vec());
    }

    pub fn set_meta_project(&self, project: &str, package: &str, meta_project: &str) {
        let mut state = self.state();
        if let Some(pkg) = state.packages.get_mut(&(project.to_string(), package.to_string())) {
            pkg.meta_project = Some(meta_project.to_string());
        }
    }

    pub fn set_linked(&self, project: &str, package: &str, target: (&str, &str)) {
        let mut state = self.state();
        if let Some(pkg) = state.packages.get_mut(&(project.to_string(), package.to_string())) {
            pkg.linked = Some((target.0.to_string(), target.1.to_string()));
        }
    }

    pub fn set_ignore_uploads(&self, ignore: bool) {
        self.state().ignore_uploads = ignore;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    /// Make file downloads of `package` fail until called with `false`.
    pub fn set_unreachable(&self, package: &str, unreachable: bool) {
        let mut state = self.state();
        state.unreachable.retain(|p| p != package);
        if unreachable {
            state.unreachable.push(package.to_string());
        }
    }

    pub fn set_running_service_polls(&self, polls: usize) {
        self.state().running_service_polls = polls;
    }

    pub fn revision_count(&self, project: &str, package: &str) -> usize {
        self.state()
            .packages
            .get(&(project.to_string(), package.to_string()))
            .map(|p| p.revisions.len())
            .unwrap_or(0)
    }

    pub fn latest_file(&self, project: &str, package: &str, name: &str) -> Option<Vec<u8>> {
        self.state()
            .packages
            .get(&(project.to_string(), package.to_string()))
            .and_then(|p| p.revisions.last())
            .and_then(|files| files.get(name).cloned())
    }

    pub fn has_package(&self, project: &str, package: &str) -> bool {
        self.state()
            .packages
            .contains_key(&(project.to_string(), package.to_string()))
    }

    pub fn submits(&self) -> usize {
        self.state().submits
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state().uploads.clone()
    }

    pub fn branches(&self) -> Vec<(String, String, String)> {
        self.state().branches.clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.state().messages.clone()
    }

    /// Manifest of `revision` as the server would list it.
    pub fn manifest(&self, project: &str, package: &str, revision: Option<&str>) -> Manifest {
        self.fetch_manifest(project, package, revision)
            .expect("manifest")
    }
}

fn not_found(project: &str, package: &str) -> Error {
    Error::Server(format!("404 unknown package {project}/{package}"))
}

fn build_manifest(package: &str, rev: usize, files: &Files) -> Manifest {
    let entries: Vec<File> = files
        .iter()
        .map(|(name, content)| File::from_content(name.as_str(), content, rev as u64))
        .collect();
    let listing: String = entries
        .iter()
        .map(|f| format!("{}:{}\n", f.name, f.md5))
        .collect();
    let mut manifest = Manifest::new(rev.to_string(), md5_hex(listing.as_bytes()), entries);
    manifest.name = Some(package.to_string());
    manifest
}

fn select(pkg: &MockPackage, revision: Option<&str>) -> Result<Option<(usize, Files)>> {
    let rev = match revision {
        Some(r) => r
            .parse::<usize>()
            .map_err(|_| Error::Server(format!("bad revision {r}")))?,
        None => pkg.revisions.len(),
    };
    if rev == 0 {
        return Ok(None);
    }
    pkg.revisions
        .get(rev - 1)
        .cloned()
        .map(|files| Some((rev, files)))
        .ok_or_else(|| Error::Server(format!("no revision {rev}")))
}

impl Server for MockServer {
    fn apiurl(&self) -> String {
        "https://api.example.test".to_string()
    }

    fn fetch_manifest(&self, project: &str, package: &str, revision: Option<&str>) -> Result<Manifest> {
        let mut state = self.state();
        let running = revision.is_none() && state.running_service_polls > 0;
        if running {
            state.running_service_polls -= 1;
        }
        let pkg = state
            .packages
            .get(&(project.to_string(), package.to_string()))
            .ok_or_else(|| not_found(project, package))?;

        let mut manifest = match select(pkg, revision)? {
            Some((rev, files)) => build_manifest(package, rev, &files),
            None => Manifest {
                name: Some(package.to_string()),
                ..Manifest::default()
            },
        };
        manifest.linkinfo = pkg.linkinfo.clone();
        if running {
            manifest.serviceinfo = Some(ServiceInfo {
                code: Some("running".to_string()),
                ..ServiceInfo::default()
            });
        }
        Ok(manifest)
    }

    fn fetch_file(&self, project: &str, package: &str, name: &str, revision: Option<&str>) -> Result<Vec<u8>> {
        let state = self.state();
        if state.unreachable.iter().any(|p| p == package) {
            return Err(Error::Server("network down".to_string()));
        }
        let pkg = state
            .packages
            .get(&(project.to_string(), package.to_string()))
            .ok_or_else(|| not_found(project, package))?;
        let (_, files) = select(pkg, revision)?
            .ok_or_else(|| Error::Server(format!("{package} has no revisions")))?;
        files
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Server(format!("404 {name}")))
    }

    fn submit_commit(
        &self,
        project: &str,
        package: &str,
        manifest: &Manifest,
        message: &str,
    ) -> Result<CommitResponse> {
        let mut state = self.state();
        state.submits += 1;

        let missing: Vec<File> = manifest
            .files
            .iter()
            .filter(|f| !state.blobs.contains_key(&f.md5))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Ok(CommitResponse::Missing(missing));
        }

        let files: Files = manifest
            .files
            .iter()
            .map(|f| (f.name.clone(), state.blobs[&f.md5].clone()))
            .collect();
        state.messages.push(message.to_string());
        let pkg = state
            .packages
            .get_mut(&(project.to_string(), package.to_string()))
            .ok_or_else(|| not_found(project, package))?;
        pkg.revisions.push(files.clone());
        let rev = pkg.revisions.len();
        Ok(CommitResponse::Accepted(build_manifest(package, rev, &files)))
    }

    fn upload_file(&self, _project: &str, _package: &str, name: &str, content: &[u8]) -> Result<()> {
        let mut state = self.state();
        state.uploads.push(name.to_string());
        if !state.ignore_uploads {
            state.blobs.insert(md5_hex(content), content.to_vec());
        }
        Ok(())
    }

    fn branch(&self, project: &str, package: &str, target_project: &str) -> Result<()> {
        let mut state = self.state();
        let files = state
            .packages
            .get(&(project.to_string(), package.to_string()))
            .and_then(|p| p.revisions.last().cloned())
            .ok_or_else(|| not_found(project, package))?;
        state.branches.push((
            project.to_string(),
            package.to_string(),
            target_project.to_string(),
        ));
        let branched = state
            .packages
            .entry((target_project.to_string(), package.to_string()))
            .or_default();
        branched.revisions.push(files);
        branched.meta_project = Some(target_project.to_string());
        Ok(())
    }

    fn create_package(&self, project: &str, package: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_create {
            return Err(Error::Server(format!("403 cannot create {project}/{package}")));
        }
        state
            .packages
            .entry((project.to_string(), package.to_string()))
            .or_default();
        Ok(())
    }

    fn delete_package(&self, project: &str, package: &str) -> Result<()> {
        self.state()
            .packages
            .remove(&(project.to_string(), package.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(project, package))
    }

    fn list_packages(&self, project: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .packages
            .keys()
            .filter(|(p, _)| p == project)
            .map(|(_, name)| name.clone())
            .collect())
    }

    fn latest_revision(&self, project: &str, package: &str) -> Result<Option<String>> {
        let state = self.state();
        let pkg = state
            .packages
            .get(&(project.to_string(), package.to_string()))
            .ok_or_else(|| not_found(project, package))?;
        Ok(match pkg.revisions.len() {
            0 => None,
            n => Some(n.to_string()),
        })
    }

    fn fetch_package_meta(&self, project: &str, package: &str) -> Result<String> {
        let state = self.state();
        let pkg = state
            .packages
            .get(&(project.to_string(), package.to_string()))
            .ok_or_else(|| not_found(project, package))?;
        let owner = pkg.meta_project.as_deref().unwrap_or(project);
        Ok(format!(
            "<package name=\"{package}\" project=\"{owner}\">\n  <title/>\n</package>\n"
        ))
    }

    fn source_info(&self, project: &str, packages: &[String]) -> Result<HashMap<String, SourceInfo>> {
        let state = self.state();
        let mut infos = HashMap::new();
        for ((p, name), pkg) in &state.packages {
            if p != project || (!packages.is_empty() && !packages.contains(name)) {
                continue;
            }
            let srcmd5 = match select(pkg, None)? {
                Some((rev, files)) => build_manifest(name, rev, &files).srcmd5,
                None => None,
            };
            infos.insert(
                name.clone(),
                SourceInfo {
                    package: name.clone(),
                    srcmd5,
                    lsrcmd5: None,
                    linked: pkg.linked.clone(),
                    error: None,
                },
            );
        }
        Ok(infos)
    }
}

/// Context wired to `server`, with the built-in merge and fast polling.
pub fn context(server: &Arc<MockServer>) -> Context {
    let mut config = Config::default();
    config.merge.tool = "builtin".to_string();
    config.service.poll_interval_ms = 1;
    Context::new(server.clone(), config)
}

/// A package checked out into a fresh temporary directory.
pub struct Checkout {
    dir: TempDir,
    pub package: Package,
}

impl Checkout {
    pub fn new(server: &Arc<MockServer>, package: &str) -> Self {
        Self::with_options(server, package, &UpdateOptions::default())
    }

    pub fn with_options(server: &Arc<MockServer>, package: &str, options: &UpdateOptions) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let (package, _) = Package::checkout(
            dir.path().join(package),
            context(server),
            PROJECT,
            package,
            options,
        )
        .expect("checkout");
        Self { dir, package }
    }

    pub fn path(&self) -> PathBuf {
        self.package.dir().to_path_buf()
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, content: &str) {
        fs::write(self.path().join(name), content).expect("write working file");
    }

    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.path().join(name)).expect("read working file")
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path().join(name).exists()
    }

    pub fn pristine(&self, name: &str) -> String {
        let bytes = self.package.store().read_source(name).expect("read pristine");
        String::from_utf8(bytes).expect("utf8 pristine")
    }
}
