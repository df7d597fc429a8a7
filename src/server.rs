//! Remote capability consumed by the working-copy protocols.
//!
//! Transport, authentication and URL layout live outside this crate; callers
//! inject an implementation of [`Server`] into packages and projects.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::file::File;
use crate::manifest::Manifest;

/// Server reply to a commit submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResponse {
    /// The new revision's manifest.
    Accepted(Manifest),
    /// Entries whose content the server does not hold yet.
    Missing(Vec<File>),
}

/// Per-package revision vector from a project-wide source listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    pub package: String,
    /// Expanded sources checksum
    pub srcmd5: Option<String>,
    /// Unexpanded (link / service) checksum
    pub lsrcmd5: Option<String>,
    /// Link target `(project, package)` for source links
    pub linked: Option<(String, String)>,
    pub error: Option<String>,
}

pub trait Server {
    /// Base URL recorded in new working copies.
    fn apiurl(&self) -> String;

    /// Manifest of `revision`, or of the latest revision when `None`.
    fn fetch_manifest(
        &self,
        project: &str,
        package: &str,
        revision: Option<&str>,
    ) -> Result<Manifest>;

    fn fetch_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        revision: Option<&str>,
    ) -> Result<Vec<u8>>;

    fn submit_commit(
        &self,
        project: &str,
        package: &str,
        manifest: &Manifest,
        message: &str,
    ) -> Result<CommitResponse>;

    /// Upload content for a pending commit (not a new revision by itself).
    fn upload_file(&self, project: &str, package: &str, name: &str, content: &[u8])
        -> Result<()>;

    /// Branch `project/package` into `target_project`.
    fn branch(&self, project: &str, package: &str, target_project: &str) -> Result<()>;

    fn create_package(&self, project: &str, package: &str) -> Result<()>;

    fn delete_package(&self, project: &str, package: &str) -> Result<()>;

    fn list_packages(&self, project: &str) -> Result<Vec<String>>;

    /// Current revision identifier of a package, `None` before its first commit.
    fn latest_revision(&self, project: &str, package: &str) -> Result<Option<String>>;

    /// Raw package meta XML.
    fn fetch_package_meta(&self, project: &str, package: &str) -> Result<String>;

    /// Revision vectors for `packages` (all packages when empty).
    fn source_info(&self, project: &str, packages: &[String])
        -> Result<HashMap<String, SourceInfo>>;
}

/// A server that refuses every call; used by offline commands.
#[derive(Debug, Clone, Default)]
pub struct Offline;

impl Offline {
    fn refuse<T>(&self, what: &str) -> Result<T> {
        Err(Error::Server(format!("{what} needs a server connection")))
    }
}

impl Server for Offline {
    fn apiurl(&self) -> String {
        String::new()
    }

    fn fetch_manifest(&self, _: &str, _: &str, _: Option<&str>) -> Result<Manifest> {
        self.refuse("fetching a manifest")
    }

    fn fetch_file(&self, _: &str, _: &str, _: &str, _: Option<&str>) -> Result<Vec<u8>> {
        self.refuse("fetching a file")
    }

    fn submit_commit(&self, _: &str, _: &str, _: &Manifest, _: &str) -> Result<CommitResponse> {
        self.refuse("committing")
    }

    fn upload_file(&self, _: &str, _: &str, _: &str, _: &[u8]) -> Result<()> {
        self.refuse("uploading")
    }

    fn branch(&self, _: &str, _: &str, _: &str) -> Result<()> {
        self.refuse("branching")
    }

    fn create_package(&self, _: &str, _: &str) -> Result<()> {
        self.refuse("creating a package")
    }

    fn delete_package(&self, _: &str, _: &str) -> Result<()> {
        self.refuse("deleting a package")
    }

    fn list_packages(&self, _: &str) -> Result<Vec<String>> {
        self.refuse("listing packages")
    }

    fn latest_revision(&self, _: &str, _: &str) -> Result<Option<String>> {
        self.refuse("querying the latest revision")
    }

    fn fetch_package_meta(&self, _: &str, _: &str) -> Result<String> {
        self.refuse("fetching package meta")
    }

    fn source_info(&self, _: &str, _: &[String]) -> Result<HashMap<String, SourceInfo>> {
        self.refuse("querying source info")
    }
}

/// Project named in a package meta document (`<package name=".." project="..">`).
pub fn meta_project(meta: &str) -> Result<Option<String>> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(meta);
    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e) if e.name().as_ref() == b"package" => {
                return Ok(crate::xml::attributes(e)?.remove("project"));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_server_refuses_network_calls() {
        let err = Offline.latest_revision("p", "x").unwrap_err();
        assert!(matches!(err, Error::Server(_)));
    }

    #[test]
    fn meta_project_reads_package_element() {
        let meta = r#"<package name="foo" project="openSUSE:Factory"><title/></package>"#;
        assert_eq!(
            meta_project(meta).unwrap().as_deref(),
            Some("openSUSE:Factory")
        );
        assert_eq!(meta_project("<project name=\"x\"/>").unwrap(), None);
    }
}
