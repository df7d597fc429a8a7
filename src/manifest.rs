//! Package manifests (`_files`).
//!
//! A manifest is the server's description of one package revision:
//!
//! ```text
//! <directory name="foo" rev="5" srcmd5="...">
//!   <linkinfo project="base" package="foo" lsrcmd5="..."/>
//!   <serviceinfo code="succeeded" xsrcmd5="..."/>
//!   <entry name="foo.spec" md5="..." size="1024" mtime="1700000000"/>
//!   <entry name="big.tar" md5="..." size="9999999" mtime="1700000000" skipped="true"/>
//! </directory>
//! ```

use std::collections::BTreeMap;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::file::File;
use crate::xml::{attributes, parse_u64, required, Doc};

/// Source-link state attached to a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub project: String,
    pub package: String,
    pub srcmd5: Option<String>,
    /// Present on unexpanded listings: checksum of the expanded sources.
    pub xsrcmd5: Option<String>,
    /// Present on expanded listings: checksum of the link itself.
    pub lsrcmd5: Option<String>,
    pub baserev: Option<String>,
    pub rev: Option<String>,
    pub error: Option<String>,
}

impl LinkInfo {
    pub fn is_link(&self) -> bool {
        self.xsrcmd5.is_some() || self.lsrcmd5.is_some()
    }

    pub fn is_expanded(&self) -> bool {
        self.lsrcmd5.is_some() && self.xsrcmd5.is_none()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Source-service state attached to a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub code: Option<String>,
    pub xsrcmd5: Option<String>,
    pub lsrcmd5: Option<String>,
    pub error: Option<String>,
}

impl ServiceInfo {
    pub fn is_expanded(&self) -> bool {
        self.lsrcmd5.is_some() && self.xsrcmd5.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.code.as_deref() == Some("running")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub name: Option<String>,
    pub rev: Option<String>,
    pub srcmd5: Option<String>,
    pub files: Vec<File>,
    pub linkinfo: Option<LinkInfo>,
    pub serviceinfo: Option<ServiceInfo>,
}

impl Manifest {
    pub fn new(rev: impl Into<String>, srcmd5: impl Into<String>, files: Vec<File>) -> Self {
        let mut manifest = Self {
            rev: Some(rev.into()),
            srcmd5: Some(srcmd5.into()),
            files,
            ..Self::default()
        };
        manifest.files.sort();
        manifest
    }

    pub fn find(&self, name: &str) -> Option<&File> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    pub fn skipped(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| f.skipped)
            .map(|f| f.name.clone())
            .collect()
    }

    pub fn is_link(&self) -> bool {
        self.linkinfo.as_ref().is_some_and(LinkInfo::is_link)
    }

    pub fn is_expanded_link(&self) -> bool {
        self.linkinfo.as_ref().is_some_and(LinkInfo::is_expanded)
    }

    pub fn from_xml(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut manifest = Manifest::default();
        let mut seen_root = false;

        loop {
            match reader.read_event()? {
                Event::Start(ref e) | Event::Empty(ref e) => match e.name().as_ref() {
                    b"directory" => {
                        let attrs = attributes(e)?;
                        manifest.name = attrs.get("name").cloned();
                        manifest.rev = attrs.get("rev").cloned();
                        manifest.srcmd5 = attrs.get("srcmd5").cloned();
                        seen_root = true;
                    }
                    b"entry" => manifest.files.push(parse_entry(&attributes(e)?)?),
                    b"linkinfo" => manifest.linkinfo = Some(parse_linkinfo(attributes(e)?)),
                    b"serviceinfo" => {
                        manifest.serviceinfo = Some(parse_serviceinfo(attributes(e)?))
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(Error::Malformed("manifest without <directory> root".to_string()));
        }
        manifest.files.sort();
        Ok(manifest)
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut doc = Doc::new();
        let mut root = Vec::new();
        push_opt(&mut root, "name", &self.name);
        push_opt(&mut root, "rev", &self.rev);
        push_opt(&mut root, "srcmd5", &self.srcmd5);

        let has_children =
            !self.files.is_empty() || self.linkinfo.is_some() || self.serviceinfo.is_some();
        if !has_children {
            doc.empty("directory", &root)?;
            return Ok(doc.finish());
        }

        doc.start("directory", &root)?;
        if let Some(link) = &self.linkinfo {
            let mut attrs = vec![("project", link.project.as_str()), ("package", link.package.as_str())];
            push_opt(&mut attrs, "srcmd5", &link.srcmd5);
            push_opt(&mut attrs, "xsrcmd5", &link.xsrcmd5);
            push_opt(&mut attrs, "lsrcmd5", &link.lsrcmd5);
            push_opt(&mut attrs, "baserev", &link.baserev);
            push_opt(&mut attrs, "rev", &link.rev);
            push_opt(&mut attrs, "error", &link.error);
            doc.empty("linkinfo", &attrs)?;
        }
        if let Some(service) = &self.serviceinfo {
            let mut attrs = Vec::new();
            push_opt(&mut attrs, "code", &service.code);
            push_opt(&mut attrs, "xsrcmd5", &service.xsrcmd5);
            push_opt(&mut attrs, "lsrcmd5", &service.lsrcmd5);
            push_opt(&mut attrs, "error", &service.error);
            doc.empty("serviceinfo", &attrs)?;
        }
        for file in &self.files {
            let size = file.size.to_string();
            let mtime = file.mtime.to_string();
            let mut attrs = vec![
                ("name", file.name.as_str()),
                ("md5", file.md5.as_str()),
                ("size", size.as_str()),
                ("mtime", mtime.as_str()),
            ];
            if file.skipped {
                attrs.push(("skipped", "true"));
            }
            doc.empty("entry", &attrs)?;
        }
        doc.end("directory")?;
        Ok(doc.finish())
    }
}

fn push_opt<'a>(attrs: &mut Vec<(&'a str, &'a str)>, key: &'a str, value: &'a Option<String>) {
    if let Some(value) = value {
        attrs.push((key, value.as_str()));
    }
}

fn parse_entry(attrs: &BTreeMap<String, String>) -> Result<File> {
    Ok(File {
        name: required(attrs, "name", "entry")?,
        md5: required(attrs, "md5", "entry")?,
        size: parse_u64(attrs.get("size"), "size")?,
        mtime: parse_u64(attrs.get("mtime"), "mtime")?,
        skipped: attrs.get("skipped").is_some_and(|v| v == "true"),
    })
}

fn parse_linkinfo(mut attrs: BTreeMap<String, String>) -> LinkInfo {
    LinkInfo {
        project: attrs.remove("project").unwrap_or_default(),
        package: attrs.remove("package").unwrap_or_default(),
        srcmd5: attrs.remove("srcmd5"),
        xsrcmd5: attrs.remove("xsrcmd5"),
        lsrcmd5: attrs.remove("lsrcmd5"),
        baserev: attrs.remove("baserev"),
        rev: attrs.remove("rev"),
        error: attrs.remove("error"),
    }
}

fn parse_serviceinfo(mut attrs: BTreeMap<String, String>) -> ServiceInfo {
    ServiceInfo {
        code: attrs.remove("code"),
        xsrcmd5: attrs.remove("xsrcmd5"),
        lsrcmd5: attrs.remove("lsrcmd5"),
        error: attrs.remove("error"),
    }
}
