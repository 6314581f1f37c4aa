//! Service configuration.
//!
//! Defaults are compile-time constants; `from_env()` lets each one be
//! overridden by a `LAUNCHER_*` environment variable.

use std::path::{Path, PathBuf};

use launcher_core::env::{env_get, env_get_str};
use launcher_module::uring_reactor::UringReactorConfig;

pub mod defaults {
    pub const SOCKET_PATH: &str = "/tmp/launcher.sock";
    pub const MAX_CONNECTIONS: usize = 256;
    /// Messages drained per readiness event.
    pub const MAX_BATCH: usize = 64;
    pub const SQ_ENTRIES: u32 = 256;
    pub const BACKLOG: i32 = 128;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    pub socket_path: PathBuf,
    pub max_connections: usize,
    pub max_batch: usize,
    pub sq_entries: u32,
    pub backlog: i32,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LauncherConfig {
    /// Built-in defaults, ignoring the environment.
    pub fn new() -> Self {
        Self {
            socket_path: PathBuf::from(defaults::SOCKET_PATH),
            max_connections: defaults::MAX_CONNECTIONS,
            max_batch: defaults::MAX_BATCH,
            sq_entries: defaults::SQ_ENTRIES,
            backlog: defaults::BACKLOG,
        }
    }

    pub fn from_env() -> Self {
        Self {
            socket_path: PathBuf::from(env_get_str("LAUNCHER_SOCKET", defaults::SOCKET_PATH)),
            max_connections: env_get("LAUNCHER_MAX_CONNECTIONS", defaults::MAX_CONNECTIONS).max(1),
            max_batch: env_get("LAUNCHER_MAX_BATCH", defaults::MAX_BATCH).max(1),
            sq_entries: env_get("LAUNCHER_SQ_ENTRIES", defaults::SQ_ENTRIES),
            backlog: env_get("LAUNCHER_BACKLOG", defaults::BACKLOG),
        }
    }

    pub fn socket_path(mut self, path: impl AsRef<Path>) -> Self {
        self.socket_path = path.as_ref().to_path_buf();
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n.max(1);
        self
    }

    pub fn max_batch(mut self, n: usize) -> Self {
        self.max_batch = n.max(1);
        self
    }

    pub fn sq_entries(mut self, n: u32) -> Self {
        self.sq_entries = n;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub(crate) fn reactor_config(&self) -> UringReactorConfig {
        UringReactorConfig { sq_entries: self.sq_entries, batch: self.max_batch }
    }
}
