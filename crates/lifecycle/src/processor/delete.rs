//! Full teardown of a cluster.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Context, Pipeline, Step};
use crate::error::{ClusterError, Result};
use crate::types::Cluster;

/// Steps of the delete pipeline, in order.
#[must_use]
pub fn pipeline(ctx: &Arc<Context>) -> Pipeline {
    Pipeline::new()
        .step(InspectCluster(Arc::clone(ctx)))
        .step(ResetHosts(Arc::clone(ctx)))
        .step(UnmountRootfs(Arc::clone(ctx)))
        .step(RemoveManifest(Arc::clone(ctx)))
        .step(CleanLocal(Arc::clone(ctx)))
}

/// Read the manifest and primary image, then build the runtime.
pub struct InspectCluster(pub Arc<Context>);

#[async_trait]
impl Step for InspectCluster {
    fn name(&self) -> &'static str {
        "inspect cluster"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let ctx = &self.0;
        match ctx.store.load_manifest()? {
            Some(manifest) => info!(images = ?manifest.images, "found cluster manifest"),
            None => warn!(cluster = %cluster.name(), "no cluster manifest recorded"),
        }
        let primary = cluster.spec.image.first().ok_or_else(|| {
            ClusterError::PreProcess(format!("cluster {} declares no image", cluster.name()))
        })?;
        ctx.images
            .inspect(primary)
            .await
            .map_err(|e| ClusterError::PreProcess(format!("failed to inspect {primary}: {e}")))?;
        if cluster.rootfs_mount().is_none() {
            ctx.mount_images(cluster)
                .await
                .map_err(|e| ClusterError::PreProcess(e.to_string()))?;
        }
        ctx.build_runtime(cluster).map(drop)
    }
}

pub struct ResetHosts(pub Arc<Context>);

#[async_trait]
impl Step for ResetHosts {
    fn name(&self) -> &'static str {
        "reset hosts"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let runtime = self.0.runtime()?;
        runtime.set_topology(cluster).await;
        runtime.reset(&cluster.all_ips()).await
    }
}

pub struct UnmountRootfs(pub Arc<Context>);

#[async_trait]
impl Step for UnmountRootfs {
    fn name(&self) -> &'static str {
        "unmount rootfs"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let hosts = cluster.all_ips();
        self.0.os().unbootstrap(&hosts).await?;
        self.0.mounter().unmount(cluster, &hosts).await
    }
}

/// Drop the working containers and the manifest record.
pub struct RemoveManifest(pub Arc<Context>);

#[async_trait]
impl Step for RemoveManifest {
    fn name(&self) -> &'static str {
        "remove manifest"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0.release_images(cluster).await?;
        self.0.store.remove_manifest()
    }
}

pub struct CleanLocal(pub Arc<Context>);

#[async_trait]
impl Step for CleanLocal {
    fn name(&self) -> &'static str {
        "clean local data"
    }

    async fn run(&self, _cluster: &mut Cluster) -> Result<()> {
        self.0.store.clean()
    }
}
