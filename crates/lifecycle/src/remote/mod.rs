//! Remote execution against cluster hosts.
//!
//! Everything the lifecycle engine does on a host goes through
//! [`RemoteExecutor`]. The engine never opens sockets itself.

pub mod retry;
pub mod sealctl;
pub mod ssh;

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

pub use retry::{retry_transport, TransportRetry};
pub use sealctl::Sealctl;
pub use ssh::OpenSshExecutor;

/// Command execution and file transfer on a host addressed as `ip:port`.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` and return its stdout.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ClusterError::Remote`] on a non-zero exit.
    async fn cmd(&self, host: &str, command: &str) -> Result<String>;

    /// Run `commands` in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first command failure.
    async fn cmd_async(&self, host: &str, commands: &[String]) -> Result<()> {
        for command in commands.iter().filter(|c| !c.trim().is_empty()) {
            let out = self.cmd(host, command).await?;
            if !out.trim().is_empty() {
                debug!(host, output = %out.trim(), "command output");
            }
        }
        Ok(())
    }

    /// Copy a local file or directory to `dst` on `host`.
    async fn copy(&self, host: &str, src: &Path, dst: &str) -> Result<()>;

    /// Copy `src` on `host` to the local path `dst`.
    async fn fetch(&self, host: &str, src: &str, dst: &Path) -> Result<()>;

    /// Check that `host` accepts commands.
    async fn ping(&self, host: &str) -> Result<()>;
}
