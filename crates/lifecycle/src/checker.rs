//! Preflight checks run before a pipeline mutates anything.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{ClusterError, Result};
use crate::fanout;
use crate::remote::RemoteExecutor;

/// A check over a set of hosts.
#[async_trait]
pub trait Checker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, hosts: &[String]) -> Result<()>;
}

/// Every host answers a trivial command.
pub struct HostChecker {
    exec: Arc<dyn RemoteExecutor>,
    max_parallel: usize,
}

impl HostChecker {
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExecutor>, max_parallel: usize) -> Self {
        Self { exec, max_parallel }
    }
}

#[async_trait]
impl Checker for HostChecker {
    fn name(&self) -> &'static str {
        "host reachability"
    }

    async fn check(&self, hosts: &[String]) -> Result<()> {
        fanout::for_each_host(hosts, self.max_parallel, |host| {
            let exec = Arc::clone(&self.exec);
            async move { exec.ping(&host).await }
        })
        .await
    }
}

/// No host runs a containerd that was installed outside the rootfs.
pub struct ContainerdChecker {
    exec: Arc<dyn RemoteExecutor>,
    max_parallel: usize,
}

impl ContainerdChecker {
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExecutor>, max_parallel: usize) -> Self {
        Self { exec, max_parallel }
    }
}

#[async_trait]
impl Checker for ContainerdChecker {
    fn name(&self) -> &'static str {
        "containerd"
    }

    async fn check(&self, hosts: &[String]) -> Result<()> {
        fanout::for_each_host(hosts, self.max_parallel, |host| {
            let exec = Arc::clone(&self.exec);
            async move {
                let command = "command -v containerd || true";
                let found = exec.cmd(&host, command).await?;
                if found.trim().is_empty() {
                    Ok(())
                } else {
                    Err(ClusterError::remote(
                        &host,
                        command,
                        format!(
                            "containerd is already installed at {}, uninstall it first",
                            found.trim()
                        ),
                    ))
                }
            }
        })
        .await
    }
}

/// Run `checkers` in order over `hosts`, failing with
/// [`ClusterError::Preflight`] on the first failed check.
///
/// # Errors
///
/// Returns [`ClusterError::Preflight`] naming the failed check.
pub async fn run_checks(checkers: &[Box<dyn Checker>], hosts: &[String]) -> Result<()> {
    for checker in checkers {
        info!(check = checker.name(), hosts = hosts.len(), "Running preflight check...");
        checker
            .check(hosts)
            .await
            .map_err(|e| ClusterError::Preflight(format!("{}: {e}", checker.name())))?;
    }
    Ok(())
}
