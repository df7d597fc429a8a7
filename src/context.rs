//! Collaborators shared by every package of a checkout.

use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::merge::{self, MergeTool};
use crate::server::{Offline, Server};

/// Server, merge tool and configuration handed to packages and projects.
#[derive(Clone)]
pub struct Context {
    pub server: Arc<dyn Server>,
    pub merge: Arc<dyn MergeTool>,
    pub config: Config,
}

impl Context {
    pub fn new(server: Arc<dyn Server>, config: Config) -> Self {
        let merge = merge::from_config(&config.merge);
        Self {
            server,
            merge,
            config,
        }
    }

    /// Context for commands that never talk to a server.
    pub fn offline(config: Config) -> Self {
        Self::new(Arc::new(Offline), config)
    }

    pub fn with_merge_tool(mut self, merge: Arc<dyn MergeTool>) -> Self {
        self.merge = merge;
        self
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("apiurl", &self.server.apiurl())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
