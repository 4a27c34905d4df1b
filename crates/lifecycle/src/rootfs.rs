//! Copying mounted images to hosts and running their init/clean scripts.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::PathResolver;
use crate::error::Result;
use crate::fanout;
use crate::guest::{export_prefix, merged_env, remote_workdir};
use crate::remote::RemoteExecutor;
use crate::types::Cluster;

/// Mounts and unmounts the cluster rootfs on hosts.
#[derive(Clone)]
pub struct RootfsMounter {
    exec: Arc<dyn RemoteExecutor>,
    paths: PathResolver,
    max_parallel: usize,
}

impl RootfsMounter {
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExecutor>, paths: PathResolver, max_parallel: usize) -> Self {
        Self {
            exec,
            paths,
            max_parallel,
        }
    }

    fn script(&self, cluster: &Cluster, host: &str, script: &str) -> Option<String> {
        let rootfs = cluster.rootfs_mount()?;
        let env = merged_env(rootfs, &cluster.env_for(host));
        let dir = format!("{}/scripts", self.paths.remote_rootfs());
        Some(format!(
            "{}if [ -f {dir}/{script} ]; then cd {dir} && bash {script}; fi",
            export_prefix(&env)
        ))
    }

    /// Copy every mounted image to `hosts` and run the rootfs init script.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ClusterError::HostFailures`] for failed hosts.
    pub async fn mount(&self, cluster: &Cluster, hosts: &[String]) -> Result<()> {
        let cluster = Arc::new(cluster.clone());
        fanout::for_each_host(hosts, self.max_parallel, |host| {
            let this = self.clone();
            let cluster = Arc::clone(&cluster);
            async move { this.mount_host(&cluster, &host).await }
        })
        .await
    }

    async fn mount_host(&self, cluster: &Cluster, host: &str) -> Result<()> {
        for mount in &cluster.status.mounts {
            let dst = remote_workdir(&self.paths, mount);
            self.exec
                .copy(host, Path::new(&mount.mount_point), &dst)
                .await?;
        }
        if let Some(init) = self.script(cluster, host, "init.sh") {
            self.exec.cmd(host, &init).await?;
        }
        info!(host, "rootfs mounted");
        Ok(())
    }

    /// Run the rootfs clean script on `hosts` and remove the cluster data.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ClusterError::HostFailures`] for failed hosts.
    pub async fn unmount(&self, cluster: &Cluster, hosts: &[String]) -> Result<()> {
        let cluster = Arc::new(cluster.clone());
        fanout::for_each_host(hosts, self.max_parallel, |host| {
            let this = self.clone();
            let cluster = Arc::clone(&cluster);
            async move {
                if let Some(clean) = this.script(&cluster, &host, "clean.sh") {
                    this.exec.cmd(&host, &clean).await?;
                }
                this.exec
                    .cmd(&host, &format!("rm -rf {}", this.paths.remote_data_dir()))
                    .await?;
                info!(host = %host, "rootfs unmounted");
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::testing::{mounted_cluster, FakeExecutor};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mount_copies_every_image_then_runs_init() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let cluster = mounted_cluster(dir.path(), &["10.0.0.1:22"], &["10.0.0.2:22"]);
        let paths = RuntimeConfig::default().paths("default");
        let mounter = RootfsMounter::new(exec.clone(), paths, 4);

        mounter.mount(&cluster, &cluster.all_ips()).await.unwrap();

        for host in ["10.0.0.1:22", "10.0.0.2:22"] {
            let copies = exec.copies_to(host);
            assert!(copies.contains(&"/var/lib/sealos/data/default/rootfs".to_string()));
            assert!(copies
                .contains(&"/var/lib/sealos/data/default/applications/default-1/workdir".to_string()));
            let cmds = exec.commands_on(host);
            assert_eq!(cmds.len(), 1);
            assert!(cmds[0].contains("bash init.sh"));
        }
    }

    #[tokio::test]
    async fn test_unmount_removes_data_dir() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let cluster = mounted_cluster(dir.path(), &["10.0.0.1:22"], &[]);
        let mounter = RootfsMounter::new(exec.clone(), RuntimeConfig::default().paths("default"), 4);

        mounter
            .unmount(&cluster, &["10.0.0.1:22".to_string()])
            .await
            .unwrap();
        let cmds = exec.commands_on("10.0.0.1:22");
        assert!(cmds[0].contains("bash clean.sh"));
        assert_eq!(cmds[1], "rm -rf /var/lib/sealos/data/default");
    }
}
