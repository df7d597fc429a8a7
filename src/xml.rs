//! Small quick-xml helpers shared by the metadata codecs.

use std::collections::BTreeMap;
use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::writer::Writer;

use crate::error::{Error, Result};

/// Collect the attributes of a start or empty tag, unescaped.
pub(crate) fn attributes(element: &BytesStart<'_>) -> Result<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    for attr in element.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Xml(e.into()))?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

pub(crate) fn required(
    attrs: &BTreeMap<String, String>,
    key: &str,
    element: &str,
) -> Result<String> {
    attrs
        .get(key)
        .cloned()
        .ok_or_else(|| Error::Malformed(format!("<{element}> without {key:?} attribute")))
}

pub(crate) fn parse_u64(value: Option<&String>, key: &str) -> Result<u64> {
    match value {
        None => Ok(0),
        Some(raw) if raw.is_empty() => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Malformed(format!("{key}={raw:?} is not a number"))),
    }
}

/// Indented document writer.
pub(crate) struct Doc {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl Doc {
    pub(crate) fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2),
        }
    }

    pub(crate) fn with_declaration() -> Result<Self> {
        let mut doc = Self::new();
        doc.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        Ok(doc)
    }

    pub(crate) fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        self.writer.write_event(Event::Start(tag(name, attrs)))?;
        Ok(())
    }

    pub(crate) fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        self.writer.write_event(Event::Empty(tag(name, attrs)))?;
        Ok(())
    }

    pub(crate) fn end(&mut self, name: &str) -> Result<()> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))?;
        Ok(())
    }

    pub(crate) fn finish(self) -> String {
        let mut out = String::from_utf8_lossy(&self.writer.into_inner().into_inner()).into_owned();
        out.push('\n');
        out
    }
}

fn tag<'a>(name: &'a str, attrs: &[(&str, &str)]) -> BytesStart<'a> {
    let mut start = BytesStart::new(name);
    for (key, value) in attrs {
        start.push_attribute((*key, *value));
    }
    start
}
