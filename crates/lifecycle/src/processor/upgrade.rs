//! Moving a running cluster to a new set of images.
//!
//! The rootfs version decides whether the control plane is upgraded; the
//! guest commands of every image run again either way.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::create::{ApplyConfigs, ReleaseImages, RunGuest};
use super::{Context, Pipeline, Step};
use crate::error::{ClusterError, Result};
use crate::kubeadm::version::KubeVersion;
use crate::store::Manifest;
use crate::types::Cluster;

/// Steps of the upgrade pipeline for a cluster currently at `from`.
#[must_use]
pub fn pipeline(ctx: &Arc<Context>, from: KubeVersion) -> Pipeline {
    Pipeline::new()
        .step(InspectImages {
            ctx: Arc::clone(ctx),
            from,
        })
        .step(Preflight(Arc::clone(ctx)))
        .step(ApplyConfigs(Arc::clone(ctx)))
        .step(RemountRootfs(Arc::clone(ctx)))
        .step(UpgradeCluster {
            ctx: Arc::clone(ctx),
            from,
        })
        .step(RunGuest(Arc::clone(ctx)))
        .step(UpdateManifest(Arc::clone(ctx)))
        .step(ReleaseImages(Arc::clone(ctx)))
}

/// Mount the new images and refuse to go back in version.
pub struct InspectImages {
    ctx: Arc<Context>,
    from: KubeVersion,
}

#[async_trait]
impl Step for InspectImages {
    fn name(&self) -> &'static str {
        "inspect images"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.ctx.mount_images(cluster).await?;
        let to = self.ctx.build_runtime(cluster)?.version().await;
        if to < self.from {
            return Err(ClusterError::Validation(format!(
                "cannot downgrade kubernetes from {} to {to}",
                self.from
            )));
        }
        info!(from = %self.from, %to, "rootfs inspected");
        Ok(())
    }
}

/// Every host must answer before anything is replaced.
pub struct Preflight(Arc<Context>);

#[async_trait]
impl Step for Preflight {
    fn name(&self) -> &'static str {
        "preflight"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0.preflight(&cluster.all_ips(), &[]).await
    }
}

pub struct RemountRootfs(Arc<Context>);

#[async_trait]
impl Step for RemountRootfs {
    fn name(&self) -> &'static str {
        "mount rootfs"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let hosts = cluster.all_ips();
        self.0.mounter().mount(cluster, &hosts).await
    }
}

pub struct UpgradeCluster {
    ctx: Arc<Context>,
    from: KubeVersion,
}

#[async_trait]
impl Step for UpgradeCluster {
    fn name(&self) -> &'static str {
        "upgrade cluster"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let runtime = self.ctx.runtime()?;
        let to = runtime.version().await;
        if to == self.from {
            info!(version = %to, "kubernetes version unchanged, skipping upgrade");
            return Ok(());
        }
        runtime.upgrade(cluster, self.from).await
    }
}

pub struct UpdateManifest(Arc<Context>);

#[async_trait]
impl Step for UpdateManifest {
    fn name(&self) -> &'static str {
        "update manifest"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0.store.save_manifest(&Manifest::for_cluster(cluster))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::store::{ClusterStore, Clusterfile};
    use crate::testing::{mounted_cluster, FakeExecutor, FakeImageService, APP_IMAGE};
    use tempfile::TempDir;

    fn context(dir: &TempDir, exec: &Arc<FakeExecutor>) -> Arc<Context> {
        let config = RuntimeConfig::default().with_cluster_root(dir.path().join("root"));
        let store = ClusterStore::new(config.paths("default"));
        let images = Arc::new(FakeImageService::new(&dir.path().join("mounts")));
        let cluster = mounted_cluster(dir.path(), &["10.0.0.1:22"], &[]);
        Arc::new(Context::new(
            config,
            exec.clone(),
            images,
            store,
            &Clusterfile::new(cluster),
        ))
    }

    #[tokio::test]
    async fn test_same_version_only_reruns_guest() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let ctx = context(&dir, &exec);
        let mut cluster = mounted_cluster(dir.path(), &["10.0.0.1:22"], &["10.0.0.3:22"]);

        pipeline(&ctx, KubeVersion::new(1, 27, 3))
            .run(&mut cluster)
            .await
            .unwrap();
        assert_eq!(exec.count_matching("kubeadm upgrade"), 0);
        assert!(exec
            .commands_on("10.0.0.1:22")
            .iter()
            .any(|c| c.contains("helm install calico")));
        let manifest = ctx.store.load_manifest().unwrap().unwrap();
        assert!(manifest.images.contains(&APP_IMAGE.to_string()));
    }

    #[tokio::test]
    async fn test_downgrade_is_rejected_before_hosts_are_contacted() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let ctx = context(&dir, &exec);
        let mut cluster = mounted_cluster(dir.path(), &["10.0.0.1:22"], &[]);

        let err = pipeline(&ctx, KubeVersion::new(1, 28, 0))
            .run(&mut cluster)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), ClusterError::Validation(msg) if msg.contains("downgrade")));
        assert_eq!(exec.call_count(), 0);
    }
}
