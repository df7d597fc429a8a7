//! Configuration loading and management
//!
//! Handles parsing of `.pkgwc.toml` configuration files found at the root of
//! a checkout.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name looked up in the checkout root
pub const CONFIG_FILE: &str = ".pkgwc.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Names never reported as unversioned files or packages
    #[serde(default = "default_exclude_glob")]
    pub exclude_glob: Vec<String>,

    /// Files larger than this are skipped on checkout
    #[serde(default)]
    pub size_limit: Option<u64>,

    /// Merge tool configuration
    #[serde(default)]
    pub merge: MergeConfig,

    /// Server-side source service handling
    #[serde(default)]
    pub service: ServiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exclude_glob: default_exclude_glob(),
            size_limit: None,
            merge: MergeConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

fn default_exclude_glob() -> Vec<String> {
    [
        ".pkgwc",
        "CVS",
        ".svn",
        ".*",
        "_linkerror",
        "*~",
        "#*#",
        "*.orig",
        "*.bak",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

/// Merge-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// `"builtin"` or a diff3-compatible program
    #[serde(default = "default_merge_tool")]
    pub tool: String,
}

fn default_merge_tool() -> String {
    "diff3".to_string()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            tool: default_merge_tool(),
        }
    }
}

/// Post-commit service run handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Wait for server-side service runs after a commit
    #[serde(default = "default_true")]
    pub wait: bool,

    /// Delay between polls while a service run is in progress
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            wait: true,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a checkout root, or return defaults
    pub fn load_from_dir(root: &Path) -> Self {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path).unwrap_or_default()
        } else {
            Self::default()
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Whether `name` matches one of the exclude globs.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude_glob.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(name))
                .unwrap_or(false)
        })
    }

    fn validate(&self) -> Result<()> {
        for pattern in &self.exclude_glob {
            glob::Pattern::new(pattern)?;
        }
        if self.merge.tool.trim().is_empty() {
            return Err(Error::InvalidConfig("merge.tool must not be empty".to_string()));
        }
        if self.size_limit == Some(0) {
            return Err(Error::InvalidConfig(
                "size_limit must be positive; omit it to disable".to_string(),
            ));
        }
        Ok(())
    }
}
