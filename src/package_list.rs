//! Project-level package list (`_packages`).
//!
//! ```text
//! <project name="home:user">
//!   <package name="foo" state=" "/>
//!   <package name="bar" state="A"/>
//! </project>
//! ```

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::xml::{attributes, required, Doc};

/// Project-level intent for one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PackageState {
    /// Tracked and present on the server.
    Tracked,
    /// Created locally, not yet on the server.
    Added,
    /// Scheduled for deletion on the server.
    Deleted,
}

impl PackageState {
    pub fn as_char(self) -> char {
        match self {
            PackageState::Tracked => ' ',
            PackageState::Added => 'A',
            PackageState::Deleted => 'D',
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            " " | "" => Ok(PackageState::Tracked),
            "A" => Ok(PackageState::Added),
            "D" => Ok(PackageState::Deleted),
            other => Err(Error::Malformed(format!("unknown package state {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageEntry {
    pub name: String,
    pub state: PackageState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageList {
    pub project: String,
    pub entries: Vec<PackageEntry>,
}

impl PackageList {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            entries: Vec::new(),
        }
    }

    pub fn state(&self, name: &str) -> Option<PackageState> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.state)
    }

    /// Set the state of a package, appending an entry if it is new.
    pub fn set_state(&mut self, name: &str, state: PackageState) {
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.state = state,
            None => self.entries.push(PackageEntry {
                name: name.to_string(),
                state,
            }),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        before != self.entries.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn from_xml(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut list: Option<PackageList> = None;
        loop {
            match reader.read_event()? {
                Event::Start(ref e) | Event::Empty(ref e) => match e.name().as_ref() {
                    b"project" => {
                        let attrs = attributes(e)?;
                        list = Some(PackageList::new(required(&attrs, "name", "project")?));
                    }
                    b"package" => {
                        let attrs = attributes(e)?;
                        let target = list.as_mut().ok_or_else(|| {
                            Error::Malformed("<package> outside <project>".to_string())
                        })?;
                        let state = attrs.get("state").map(String::as_str).unwrap_or(" ");
                        target.entries.push(PackageEntry {
                            name: required(&attrs, "name", "package")?,
                            state: PackageState::from_code(state)?,
                        });
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        list.ok_or_else(|| Error::Malformed("package list without <project> root".to_string()))
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut doc = Doc::new();
        let root = [("name", self.project.as_str())];
        if self.entries.is_empty() {
            doc.empty("project", &root)?;
            return Ok(doc.finish());
        }
        doc.start("project", &root)?;
        for entry in &self.entries {
            let state = entry.state.as_char().to_string();
            doc.empty(
                "package",
                &[("name", entry.name.as_str()), ("state", state.as_str())],
            )?;
        }
        doc.end("project")?;
        Ok(doc.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_states() {
        let xml = r#"<project name="home:me">
  <package name="foo" state=" "/>
  <package name="bar" state="A"/>
  <package name="baz" state="D"/>
</project>"#;
        let list = PackageList::from_xml(xml).expect("parse");
        assert_eq!(list.project, "home:me");
        assert_eq!(list.state("foo"), Some(PackageState::Tracked));
        assert_eq!(list.state("bar"), Some(PackageState::Added));
        assert_eq!(list.state("baz"), Some(PackageState::Deleted));
        assert_eq!(list.state("qux"), None);
    }

    #[test]
    fn keeps_blank_state_through_writes() {
        let mut list = PackageList::new("home:me");
        list.set_state("foo", PackageState::Tracked);
        list.set_state("bar", PackageState::Added);
        list.set_state("bar", PackageState::Tracked);

        let xml = list.to_xml().expect("write");
        assert!(xml.contains(r#"state=" ""#));
        let parsed = PackageList::from_xml(&xml).expect("reparse");
        assert_eq!(parsed, list);
        assert_eq!(parsed.names(), vec!["foo", "bar"]);
    }

    #[test]
    fn rejects_unknown_state() {
        let xml = r#"<project name="p"><package name="x" state="Z"/></project>"#;
        assert!(matches!(PackageList::from_xml(xml), Err(Error::Malformed(_))));
    }
}
