//! File entries as the server describes them, plus local checksum helpers.

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;

/// Prefix of files produced by server-side source services.
pub const SERVICE_FILE_PREFIX: &str = "_service:";

/// One manifest entry.
///
/// Field order is significant: the derived ordering sorts by name first, so
/// sorted manifests diff deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct File {
    pub name: String,
    pub md5: String,
    pub size: u64,
    pub mtime: u64,
    pub skipped: bool,
}

impl File {
    pub fn new(name: impl Into<String>, md5: impl Into<String>, size: u64, mtime: u64) -> Self {
        Self {
            name: name.into(),
            md5: md5.into(),
            size,
            mtime,
            skipped: false,
        }
    }

    /// Build an entry describing in-memory content.
    pub fn from_content(name: impl Into<String>, content: &[u8], mtime: u64) -> Self {
        Self::new(name, md5_hex(content), content.len() as u64, mtime)
    }

    pub fn is_service_file(&self) -> bool {
        self.name.starts_with(SERVICE_FILE_PREFIX)
    }
}

/// Hex-encoded MD5 of a byte slice.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Hex-encoded MD5 of a file, streamed.
pub fn md5_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = fs::File::open(path.as_ref())?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Heuristic text/binary split: a NUL byte in the first 4 KiB means binary.
pub fn is_binary(data: &[u8]) -> bool {
    data.iter().take(4096).any(|b| *b == 0)
}

pub fn is_binary_file(path: impl AsRef<Path>) -> Result<bool> {
    let mut file = fs::File::open(path.as_ref())?;
    let mut buf = Vec::with_capacity(4096);
    file.by_ref().take(4096).read_to_end(&mut buf)?;
    Ok(is_binary(&buf))
}
