//! OS-level prerequisites on hosts: image preflight and registry resolution.

use std::sync::Arc;

use tracing::info;

use crate::config::PathResolver;
use crate::error::Result;
use crate::fanout;
use crate::hosts;
use crate::remote::{RemoteExecutor, Sealctl};
use crate::types::Cluster;

/// Domain of the image registry served from master0.
pub const REGISTRY_DOMAIN: &str = "sealos.hub";

#[derive(Clone)]
pub struct OsBootstrap {
    exec: Arc<dyn RemoteExecutor>,
    sealctl: Sealctl,
    paths: PathResolver,
    max_parallel: usize,
}

impl OsBootstrap {
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExecutor>, paths: PathResolver, max_parallel: usize) -> Self {
        Self {
            sealctl: Sealctl::new(Arc::clone(&exec)),
            exec,
            paths,
            max_parallel,
        }
    }

    /// Run the image's `check.sh` and resolve the registry to master0.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ClusterError::HostFailures`] for failed hosts.
    pub async fn bootstrap(&self, cluster: &Cluster, hosts: &[String]) -> Result<()> {
        let registry_ip = hosts::host_ip(&cluster.master0()?).to_string();
        let dir = format!("{}/scripts", self.paths.remote_rootfs());
        let check = format!("if [ -f {dir}/check.sh ]; then cd {dir} && bash check.sh; fi");
        fanout::for_each_host(hosts, self.max_parallel, |host| {
            let this = self.clone();
            let check = check.clone();
            let registry_ip = registry_ip.clone();
            async move {
                this.exec.cmd(&host, &check).await?;
                this.sealctl
                    .hosts_add(&host, &registry_ip, REGISTRY_DOMAIN)
                    .await?;
                info!(host = %host, "host prepared");
                Ok(())
            }
        })
        .await
    }

    /// Undo [`OsBootstrap::bootstrap`] on `hosts`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ClusterError::HostFailures`] for failed hosts.
    pub async fn unbootstrap(&self, hosts: &[String]) -> Result<()> {
        fanout::for_each_host(hosts, self.max_parallel, |host| {
            let sealctl = self.sealctl.clone();
            async move { sealctl.hosts_delete(&host, REGISTRY_DOMAIN).await }
        })
        .await
    }
}
