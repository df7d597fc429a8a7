//! Metadata store for one working-copy directory
//!
//! Every package or project checkout keeps its metadata in a hidden
//! directory next to the files it tracks.
//!
//! # Directory Structure
//!
//! ```text
//! .pkgwc/
//!   _format_version       # store layout version
//!   _apiurl               # server the checkout belongs to
//!   _project              # project name
//!   _package              # package name (absent for project checkouts)
//!   _scm                  # SCM url, mutually exclusive with _package/_files
//!   _files                # live manifest (XML)
//!   _to_be_added          # pending additions, one name per line
//!   _to_be_deleted        # pending deletions, one name per line
//!   _in_conflict          # unresolved conflicts, one name per line
//!   _size_limit           # files above this size are skipped
//!   _last_buildroot       # repo / arch / vm type, one per line
//!   _meta                 # package meta (XML) as last seen on the server
//!   _packages             # project checkouts only: package list (XML)
//!   sources/<name>        # pristine copy of every manifest file
//!   _in_update/           # update staging (see package::update)
//!   _in_commit/           # commit staging (see package::commit)
//! ```
//!
//! Scalar, list and XML writes are atomic; writing `None` removes the key.
//! Reads of a missing key return `None`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lock::{copy_atomic, remove_if_exists, write_atomic, write_atomic_str};
use crate::manifest::Manifest;
use crate::package_list::PackageList;

/// Name of the per-directory metadata namespace
pub const STORE_DIR: &str = ".pkgwc";

/// Current store layout version
pub const FORMAT_VERSION: &str = "2.0";

/// Versions that only need their tag bumped to reach `1.0`.
const LEGACY_VERSIONS: &[&str] = &[
    "0.2", "0.3", "0.4", "0.5", "0.6", "0.7", "0.8", "0.9", "0.95", "0.96", "0.97", "0.98",
    "0.99",
];

pub const VERSION_KEY: &str = "_format_version";
pub const APIURL_KEY: &str = "_apiurl";
pub const PROJECT_KEY: &str = "_project";
pub const PACKAGE_KEY: &str = "_package";
pub const SCM_KEY: &str = "_scm";
pub const FILES_KEY: &str = "_files";
pub const TO_BE_ADDED_KEY: &str = "_to_be_added";
pub const TO_BE_DELETED_KEY: &str = "_to_be_deleted";
pub const IN_CONFLICT_KEY: &str = "_in_conflict";
pub const SIZE_LIMIT_KEY: &str = "_size_limit";
pub const LAST_BUILDROOT_KEY: &str = "_last_buildroot";
pub const META_KEY: &str = "_meta";
pub const FROZENLINK_KEY: &str = "_frozenlink";
pub const PACKAGES_KEY: &str = "_packages";

pub const SOURCES_DIR: &str = "sources";
pub const IN_UPDATE_DIR: &str = "_in_update";
pub const IN_COMMIT_DIR: &str = "_in_commit";

/// Bookkeeping names that never hold pristine file content.
pub const RESERVED_NAMES: &[&str] = &[
    VERSION_KEY,
    APIURL_KEY,
    PROJECT_KEY,
    PACKAGE_KEY,
    SCM_KEY,
    FILES_KEY,
    TO_BE_ADDED_KEY,
    TO_BE_DELETED_KEY,
    IN_CONFLICT_KEY,
    SIZE_LIMIT_KEY,
    LAST_BUILDROOT_KEY,
    META_KEY,
    FROZENLINK_KEY,
    PACKAGES_KEY,
    SOURCES_DIR,
    IN_UPDATE_DIR,
    IN_COMMIT_DIR,
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name) || name.starts_with("_build")
}

/// The build root used by the last local build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildRoot {
    pub repo: String,
    pub arch: String,
    pub vm_type: Option<String>,
}

/// Metadata store bound to one working-copy directory
#[derive(Debug, Clone)]
pub struct Store {
    /// Working-copy directory
    root: PathBuf,
    /// `<root>/.pkgwc`
    dir: PathBuf,
}

impl Store {
    /// Open an existing store, migrating older layouts forward.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let store = Self::at(root);
        if !store.dir.is_dir() {
            return Err(Error::NoWorkingCopy(store.root.clone()));
        }
        store.migrate()?;
        Ok(store)
    }

    /// Create a fresh store in `root` (the directory is created if needed).
    pub fn init(root: impl AsRef<Path>) -> Result<Self> {
        let store = Self::at(root);
        if store.dir.exists() {
            return Err(Error::InvalidArgument(format!(
                "{} already contains a working copy",
                store.root.display()
            )));
        }
        fs::create_dir_all(store.sources_dir())?;
        store.write_string(VERSION_KEY, Some(FORMAT_VERSION))?;
        Ok(store)
    }

    /// Whether `root` carries a metadata directory at all.
    pub fn exists(root: impl AsRef<Path>) -> bool {
        root.as_ref().join(STORE_DIR).is_dir()
    }

    fn at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let dir = root.join(STORE_DIR);
        Self { root, dir }
    }

    // =========================================================================
    // Path accessors
    // =========================================================================

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the metadata directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.dir.join(SOURCES_DIR)
    }

    pub fn update_staging_dir(&self) -> PathBuf {
        self.dir.join(IN_UPDATE_DIR)
    }

    pub fn commit_staging_dir(&self) -> PathBuf {
        self.dir.join(IN_COMMIT_DIR)
    }

    // =========================================================================
    // Scalars and lists
    // =========================================================================

    /// Read a one-line value, without its trailing newline.
    pub fn read_string(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(content) => Ok(Some(content.trim_end_matches(['\n', '\r']).to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write a one-line value, or remove the key when `value` is `None`.
    pub fn write_string(&self, key: &str, value: Option<&str>) -> Result<()> {
        let path = self.key_path(key);
        match value {
            Some(value) => write_atomic_str(&path, &format!("{value}\n")),
            None => remove_if_exists(&path).map(|_| ()),
        }
    }

    /// Read a list stored one entry per line, preserving order.
    pub fn read_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        Ok(self.read_string(key)?.map(|content| {
            content
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        }))
    }

    /// Write a list one entry per line, or remove the key when `None`.
    pub fn write_list<S: AsRef<str>>(&self, key: &str, value: Option<&[S]>) -> Result<()> {
        match value {
            Some(items) => {
                let mut content = String::new();
                for item in items {
                    let item = item.as_ref();
                    if item.contains('\n') {
                        return Err(Error::InvalidArgument(format!(
                            "list entry {item:?} contains a newline"
                        )));
                    }
                    content.push_str(item);
                    content.push('\n');
                }
                write_atomic_str(self.key_path(key), &content)
            }
            None => remove_if_exists(self.key_path(key)).map(|_| ()),
        }
    }

    pub fn read_int(&self, key: &str) -> Result<Option<u64>> {
        match self.read_string(key)? {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::Malformed(format!("{key}: {raw:?} is not an integer"))),
        }
    }

    pub fn write_int(&self, key: &str, value: Option<u64>) -> Result<()> {
        self.write_string(key, value.map(|v| v.to_string()).as_deref())
    }

    // =========================================================================
    // Named accessors
    // =========================================================================

    pub fn apiurl(&self) -> Result<Option<String>> {
        self.read_string(APIURL_KEY)
    }

    pub fn set_apiurl(&self, apiurl: Option<&str>) -> Result<()> {
        self.write_string(APIURL_KEY, apiurl)
    }

    pub fn project(&self) -> Result<Option<String>> {
        self.read_string(PROJECT_KEY)
    }

    pub fn set_project(&self, project: &str) -> Result<()> {
        self.write_string(PROJECT_KEY, Some(project))
    }

    pub fn package(&self) -> Result<Option<String>> {
        self.read_string(PACKAGE_KEY)
    }

    /// Record the package name; a package is never both classic and SCM-managed.
    pub fn set_package(&self, package: &str) -> Result<()> {
        if self.key_path(SCM_KEY).exists() {
            return Err(Error::InvalidArgument(format!(
                "{} is SCM-managed and cannot carry a package name",
                self.root.display()
            )));
        }
        self.write_string(PACKAGE_KEY, Some(package))
    }

    pub fn scm_url(&self) -> Result<Option<String>> {
        self.read_string(SCM_KEY)
    }

    pub fn set_scm_url(&self, url: &str) -> Result<()> {
        if self.key_path(PACKAGE_KEY).exists() || self.key_path(FILES_KEY).exists() {
            return Err(Error::InvalidArgument(format!(
                "{} has a classic manifest and cannot become SCM-managed",
                self.root.display()
            )));
        }
        self.write_string(SCM_KEY, Some(url))
    }

    pub fn size_limit(&self) -> Result<Option<u64>> {
        self.read_int(SIZE_LIMIT_KEY)
    }

    pub fn set_size_limit(&self, limit: Option<u64>) -> Result<()> {
        self.write_int(SIZE_LIMIT_KEY, limit)
    }

    pub fn last_buildroot(&self) -> Result<Option<BuildRoot>> {
        let Some(lines) = self.read_list(LAST_BUILDROOT_KEY)? else {
            return Ok(None);
        };
        match lines.as_slice() {
            [repo, arch] => Ok(Some(BuildRoot {
                repo: repo.clone(),
                arch: arch.clone(),
                vm_type: None,
            })),
            [repo, arch, vm_type] => Ok(Some(BuildRoot {
                repo: repo.clone(),
                arch: arch.clone(),
                vm_type: Some(vm_type.clone()),
            })),
            _ => Err(Error::Malformed(format!(
                "{LAST_BUILDROOT_KEY} has {} lines",
                lines.len()
            ))),
        }
    }

    pub fn set_last_buildroot(&self, buildroot: Option<&BuildRoot>) -> Result<()> {
        match buildroot {
            None => self.write_list::<&str>(LAST_BUILDROOT_KEY, None),
            Some(root) => {
                let mut lines = vec![root.repo.as_str(), root.arch.as_str()];
                if let Some(vm) = root.vm_type.as_deref() {
                    lines.push(vm);
                }
                self.write_list(LAST_BUILDROOT_KEY, Some(lines.as_slice()))
            }
        }
    }

    /// Raw package meta as last fetched from the server.
    pub fn meta(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(META_KEY)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn set_meta(&self, meta: Option<&str>) -> Result<()> {
        match meta {
            Some(meta) => write_atomic_str(self.key_path(META_KEY), meta),
            None => remove_if_exists(self.key_path(META_KEY)).map(|_| ()),
        }
    }

    // =========================================================================
    // XML documents
    // =========================================================================

    /// Read a manifest; `None` when the key is absent.
    pub fn read_manifest(&self, key: &str) -> Result<Option<Manifest>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(xml) => Manifest::from_xml(&xml).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn write_manifest(&self, key: &str, manifest: Option<&Manifest>) -> Result<()> {
        match manifest {
            Some(manifest) => write_atomic_str(self.key_path(key), &manifest.to_xml()?),
            None => remove_if_exists(self.key_path(key)).map(|_| ()),
        }
    }

    pub fn read_package_list(&self) -> Result<Option<PackageList>> {
        match fs::read_to_string(self.key_path(PACKAGES_KEY)) {
            Ok(xml) if xml.trim().is_empty() => Ok(None),
            Ok(xml) => PackageList::from_xml(&xml).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn write_package_list(&self, list: &PackageList) -> Result<()> {
        write_atomic_str(self.key_path(PACKAGES_KEY), &list.to_xml()?)
    }

    // =========================================================================
    // Pristine cache
    // =========================================================================

    /// Path of the pristine copy of `name`.
    pub fn source_path(&self, name: &str) -> PathBuf {
        self.sources_dir().join(name)
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.source_path(name).is_file()
    }

    pub fn read_source(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.source_path(name))?)
    }

    pub fn write_source(&self, name: &str, content: &[u8]) -> Result<()> {
        check_flat_name(name)?;
        write_atomic(self.source_path(name), content)
    }

    /// Replace the pristine copy of `name` with a copy of `src`.
    pub fn copy_to_source(&self, src: impl AsRef<Path>, name: &str) -> Result<()> {
        check_flat_name(name)?;
        copy_atomic(src, self.source_path(name))
    }

    /// Move `src` into the pristine cache under `name`.
    pub fn move_to_source(&self, src: impl AsRef<Path>, name: &str) -> Result<()> {
        check_flat_name(name)?;
        fs::create_dir_all(self.sources_dir())?;
        fs::rename(src.as_ref(), self.source_path(name))?;
        Ok(())
    }

    pub fn remove_source(&self, name: &str) -> Result<bool> {
        remove_if_exists(self.source_path(name))
    }

    /// Names present in the pristine cache, sorted.
    pub fn list_sources(&self) -> Result<Vec<String>> {
        let dir = self.sources_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    // =========================================================================
    // Format migration
    // =========================================================================

    pub fn format_version(&self) -> Result<Option<String>> {
        self.read_string(VERSION_KEY)
    }

    fn migrate(&self) -> Result<()> {
        loop {
            let version = self.format_version()?.unwrap_or_default();
            let version = version.trim();
            match version {
                FORMAT_VERSION => return Ok(()),
                "" => return Err(Error::NoWorkingCopy(self.root.clone())),
                "1.0" => self.migrate_flat_sources()?,
                v if LEGACY_VERSIONS.contains(&v) => {
                    info!(root = %self.root.display(), from = v, "bumping store format to 1.0");
                    self.write_string(VERSION_KEY, Some("1.0"))?;
                }
                other => {
                    return Err(Error::WorkingCopyWrongVersion {
                        path: self.root.clone(),
                        found: other.to_string(),
                    })
                }
            }
        }
    }

    /// 1.0 -> 2.0: pristine copies move from the metadata directory into
    /// `sources/`. Only names the manifest knows are promoted.
    fn migrate_flat_sources(&self) -> Result<()> {
        info!(root = %self.root.display(), "migrating store format 1.0 -> 2.0");
        fs::create_dir_all(self.sources_dir())?;
        let known = self
            .read_manifest(FILES_KEY)?
            .map(|m| m.names())
            .unwrap_or_default();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_reserved(&name) || !known.contains(&name) {
                debug!(%name, "left in place during migration");
                continue;
            }
            fs::rename(entry.path(), self.source_path(&name))?;
        }

        self.write_string(VERSION_KEY, Some(FORMAT_VERSION))
    }
}

/// Pristine copies are addressed by a single path component.
fn check_flat_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(Error::InvalidArgument(format!(
            "{name:?} is not a valid file name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::File;

    fn fresh() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::init(dir.path()).expect("init");
        (dir, store)
    }

    #[test]
    fn list_round_trip_preserves_order() {
        let (_dir, store) = fresh();
        store
            .write_list(TO_BE_ADDED_KEY, Some(&["a", "b", "c"][..]))
            .expect("write");
        assert_eq!(
            store.read_list(TO_BE_ADDED_KEY).expect("read"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn writing_none_removes_key() {
        let (_dir, store) = fresh();
        store.write_string(PROJECT_KEY, Some("home:me")).expect("write");
        assert!(store.key_path(PROJECT_KEY).exists());

        store.write_string(PROJECT_KEY, None).expect("delete");
        assert!(!store.key_path(PROJECT_KEY).exists());
        assert_eq!(store.read_string(PROJECT_KEY).expect("read"), None);
    }

    #[test]
    fn missing_keys_read_as_absent() {
        let (_dir, store) = fresh();
        assert_eq!(store.read_string("_nothing").unwrap(), None);
        assert_eq!(store.read_list("_nothing").unwrap(), None);
        assert_eq!(store.read_manifest(FILES_KEY).unwrap(), None);
        assert_eq!(store.size_limit().unwrap(), None);
    }

    #[test]
    fn list_entries_cannot_smuggle_newlines() {
        let (_dir, store) = fresh();
        let result = store.write_list(IN_CONFLICT_KEY, Some(&["a\nb"][..]));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn package_and_scm_are_exclusive() {
        let (_dir, store) = fresh();
        store.set_scm_url("https://git.example/foo.git").expect("scm");
        assert!(store.set_package("foo").is_err());

        let (_dir2, other) = fresh();
        other.set_package("foo").expect("package");
        assert!(other.set_scm_url("https://git.example/foo.git").is_err());
    }

    #[test]
    fn buildroot_round_trip() {
        let (_dir, store) = fresh();
        let root = BuildRoot {
            repo: "openSUSE_Tumbleweed".to_string(),
            arch: "x86_64".to_string(),
            vm_type: Some("kvm".to_string()),
        };
        store.set_last_buildroot(Some(&root)).expect("write");
        assert_eq!(store.last_buildroot().expect("read"), Some(root));
    }

    #[test]
    fn pristine_names_must_be_flat() {
        let (_dir, store) = fresh();
        assert!(store.write_source("../escape", b"x").is_err());
        assert!(store.write_source("sub/file", b"x").is_err());
        store.write_source("ok.txt", b"x").expect("flat name");
        assert_eq!(store.list_sources().unwrap(), vec!["ok.txt"]);
    }

    #[test]
    fn open_without_version_is_not_a_working_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join(STORE_DIR)).expect("mkdir");
        assert!(matches!(Store::open(dir.path()), Err(Error::NoWorkingCopy(_))));
        assert!(matches!(
            Store::open(dir.path().join("elsewhere")),
            Err(Error::NoWorkingCopy(_))
        ));
    }

    #[test]
    fn unknown_version_is_fatal() {
        let (dir, store) = fresh();
        store.write_string(VERSION_KEY, Some("3.7")).expect("write");
        match Store::open(dir.path()) {
            Err(Error::WorkingCopyWrongVersion { found, .. }) => assert_eq!(found, "3.7"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn legacy_versions_migrate_to_current() {
        let (dir, store) = fresh();
        store.write_string(VERSION_KEY, Some("0.98")).expect("write");
        let reopened = Store::open(dir.path()).expect("open");
        assert_eq!(
            reopened.format_version().unwrap().as_deref(),
            Some(FORMAT_VERSION)
        );
    }

    #[test]
    fn version_one_moves_known_files_into_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let meta = dir.path().join(STORE_DIR);
        fs::create_dir(&meta).expect("mkdir");
        fs::write(meta.join(VERSION_KEY), "1.0\n").expect("version");
        let manifest = Manifest::new("3", "abc", vec![File::new("foo.spec", "1", 1, 1)]);
        fs::write(meta.join(FILES_KEY), manifest.to_xml().unwrap()).expect("files");
        fs::write(meta.join("foo.spec"), "spec").expect("pristine");
        fs::write(meta.join("junk.txt"), "junk").expect("junk");
        fs::write(meta.join(PROJECT_KEY), "home:me\n").expect("project");

        let store = Store::open(dir.path()).expect("open");

        assert_eq!(store.read_source("foo.spec").unwrap(), b"spec");
        assert!(meta.join("junk.txt").exists());
        assert!(!store.has_source("junk.txt"));
        assert_eq!(store.project().unwrap().as_deref(), Some("home:me"));
        assert_eq!(store.format_version().unwrap().as_deref(), Some(FORMAT_VERSION));
    }
}
