//! First bring-up of a cluster.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Context, Pipeline, Step};
use crate::configs::apply_configs;
use crate::error::Result;
use crate::store::Manifest;
use crate::types::Cluster;

/// Steps of the create pipeline, in order.
#[must_use]
pub fn pipeline(ctx: &Arc<Context>) -> Pipeline {
    Pipeline::new()
        .step(PersistCluster(Arc::clone(ctx)))
        .step(PrepareImages(Arc::clone(ctx)))
        .step(CreateManifest(Arc::clone(ctx)))
        .step(ApplyConfigs(Arc::clone(ctx)))
        .step(MountRootfs(Arc::clone(ctx)))
        .step(InitMaster0(Arc::clone(ctx)))
        .step(JoinMasters(Arc::clone(ctx)))
        .step(JoinNodes(Arc::clone(ctx)))
        .step(RunGuest(Arc::clone(ctx)))
        .step(ReleaseImages(Arc::clone(ctx)))
}

/// Record the desired cluster before touching any host.
pub struct PersistCluster(pub Arc<Context>);

#[async_trait]
impl Step for PersistCluster {
    fn name(&self) -> &'static str {
        "persist cluster"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0.store.save(&self.0.clusterfile(cluster))
    }
}

/// Pull and mount images, then build the runtime from the rootfs.
pub struct PrepareImages(pub Arc<Context>);

#[async_trait]
impl Step for PrepareImages {
    fn name(&self) -> &'static str {
        "prepare images"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0.mount_images(cluster).await?;
        let version = self.0.build_runtime(cluster)?.version().await;
        info!(%version, "rootfs inspected");
        Ok(())
    }
}

pub struct CreateManifest(pub Arc<Context>);

#[async_trait]
impl Step for CreateManifest {
    fn name(&self) -> &'static str {
        "create manifest"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0.store.save_manifest(&Manifest::for_cluster(cluster))
    }
}

pub struct ApplyConfigs(pub Arc<Context>);

#[async_trait]
impl Step for ApplyConfigs {
    fn name(&self) -> &'static str {
        "apply configs"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        apply_configs(&self.0.configs, &cluster.status.mounts)
    }
}

/// Copy the rootfs to every host and prepare the OS.
pub struct MountRootfs(pub Arc<Context>);

#[async_trait]
impl Step for MountRootfs {
    fn name(&self) -> &'static str {
        "mount rootfs"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let hosts = cluster.all_ips();
        self.0.mounter().mount(cluster, &hosts).await?;
        self.0.os().bootstrap(cluster, &hosts).await
    }
}

pub struct InitMaster0(pub Arc<Context>);

#[async_trait]
impl Step for InitMaster0 {
    fn name(&self) -> &'static str {
        "init master0"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let runtime = self.0.runtime()?;
        runtime.set_topology(cluster).await;
        runtime.init_master0().await
    }
}

pub struct JoinMasters(pub Arc<Context>);

#[async_trait]
impl Step for JoinMasters {
    fn name(&self) -> &'static str {
        "join masters"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let runtime = self.0.runtime()?;
        runtime.set_topology(cluster).await;
        let masters = cluster.master_ips();
        runtime.join_masters(masters.get(1..).unwrap_or_default()).await
    }
}

pub struct JoinNodes(pub Arc<Context>);

#[async_trait]
impl Step for JoinNodes {
    fn name(&self) -> &'static str {
        "join nodes"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let runtime = self.0.runtime()?;
        runtime.set_topology(cluster).await;
        runtime.join_nodes(&cluster.node_ips()).await
    }
}

pub struct RunGuest(pub Arc<Context>);

#[async_trait]
impl Step for RunGuest {
    fn name(&self) -> &'static str {
        "run guest"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let master0 = cluster.master0()?;
        self.0.guest().run(cluster, &[master0]).await
    }
}

/// Drop the working containers; the mount records stay in the status.
pub struct ReleaseImages(pub Arc<Context>);

#[async_trait]
impl Step for ReleaseImages {
    fn name(&self) -> &'static str {
        "release images"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0.release_images(cluster).await
    }
}
