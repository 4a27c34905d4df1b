//! Scaling an existing cluster up or down.
//!
//! The up and down halves are disjoint; a diff selects exactly one.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::create::ReleaseImages;
use super::{Context, Pipeline, Step};
use crate::diff::ClusterDiff;
use crate::error::{ClusterError, Result};
use crate::types::Cluster;

/// Steps that add `diff`'s joining hosts.
#[must_use]
pub fn up(ctx: &Arc<Context>, diff: &Arc<ClusterDiff>) -> Pipeline {
    let part = || Part {
        ctx: Arc::clone(ctx),
        diff: Arc::clone(diff),
    };
    Pipeline::new()
        .step(UpPreflight(part()))
        .step(SyncMounts(part()))
        .step(MountJoining(part()))
        .step(BootstrapJoining(part()))
        .step(JoinHosts(part()))
        .step(GuestOnJoined(part()))
        .step(SyncLoadBalancer(part()))
        .step(ReleaseImages(Arc::clone(ctx)))
}

/// Steps that remove `diff`'s leaving hosts.
///
/// Only master0 must answer; cleanup on the leaving hosts is best effort.
#[must_use]
pub fn down(ctx: &Arc<Context>, diff: &Arc<ClusterDiff>) -> Pipeline {
    let part = || Part {
        ctx: Arc::clone(ctx),
        diff: Arc::clone(diff),
    };
    Pipeline::new()
        .step(DownPreflight(part()))
        .step(PrepareRuntime(part()))
        .step(DeleteHosts(part()))
        .step(SyncLoadBalancer(part()))
        .step(UnbootstrapLeaving(part()))
        .step(UnmountLeaving(part()))
}

/// What every scale step needs.
pub struct Part {
    ctx: Arc<Context>,
    diff: Arc<ClusterDiff>,
}

pub struct UpPreflight(Part);

#[async_trait]
impl Step for UpPreflight {
    fn name(&self) -> &'static str {
        "preflight"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let joining = self.0.diff.joining();
        let mut reachable = vec![cluster.master0()?];
        reachable.extend(joining.iter().cloned());
        self.0.ctx.preflight(&reachable, &joining).await
    }
}

pub struct DownPreflight(Part);

#[async_trait]
impl Step for DownPreflight {
    fn name(&self) -> &'static str {
        "preflight"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        // Leaving hosts may already be gone.
        self.0.ctx.preflight(&[cluster.master0()?], &[]).await
    }
}

/// Re-mount the recorded images and rebuild the runtime.
pub struct SyncMounts(Part);

#[async_trait]
impl Step for SyncMounts {
    fn name(&self) -> &'static str {
        "sync mounts"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let ctx = &self.0.ctx;
        ctx.mount_images(cluster)
            .await
            .map_err(|e| ClusterError::PreProcess(format!("failed to sync image mounts: {e}")))?;
        ctx.build_runtime(cluster).map(drop)
    }
}

/// Rebuild the runtime from the recorded mounts.
pub struct PrepareRuntime(Part);

#[async_trait]
impl Step for PrepareRuntime {
    fn name(&self) -> &'static str {
        "prepare runtime"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0.ctx.build_runtime(cluster).map(drop)
    }
}

pub struct MountJoining(Part);

#[async_trait]
impl Step for MountJoining {
    fn name(&self) -> &'static str {
        "mount rootfs"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0
            .ctx
            .mounter()
            .mount(cluster, &self.0.diff.joining())
            .await
    }
}

pub struct BootstrapJoining(Part);

#[async_trait]
impl Step for BootstrapJoining {
    fn name(&self) -> &'static str {
        "bootstrap hosts"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0
            .ctx
            .os()
            .bootstrap(cluster, &self.0.diff.joining())
            .await
    }
}

/// Join masters one by one, then nodes in parallel.
pub struct JoinHosts(Part);

#[async_trait]
impl Step for JoinHosts {
    fn name(&self) -> &'static str {
        "join hosts"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let runtime = self.0.ctx.runtime()?;
        let diff = &self.0.diff;
        runtime.set_topology(cluster).await;
        runtime.join_masters(&diff.masters.to_join).await?;
        if !diff.masters.to_join.is_empty() {
            runtime.upload_cluster_config().await?;
        }
        runtime.join_nodes(&diff.nodes.to_join).await
    }
}

pub struct GuestOnJoined(Part);

#[async_trait]
impl Step for GuestOnJoined {
    fn name(&self) -> &'static str {
        "run guest"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        self.0.ctx.guest().run(cluster, &self.0.diff.joining()).await
    }
}

pub struct DeleteHosts(Part);

#[async_trait]
impl Step for DeleteHosts {
    fn name(&self) -> &'static str {
        "delete hosts"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let runtime = self.0.ctx.runtime()?;
        let diff = &self.0.diff;
        runtime.set_topology(cluster).await;
        runtime.delete_masters(&diff.masters.to_delete).await?;
        runtime.delete_nodes(&diff.nodes.to_delete).await
    }
}

/// Point lvscare on the nodes that were already members at the
/// post-change master set. Joining nodes get it from their join.
pub struct SyncLoadBalancer(Part);

#[async_trait]
impl Step for SyncLoadBalancer {
    fn name(&self) -> &'static str {
        "sync load balancer"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let diff = &self.0.diff;
        if diff.masters.is_empty() {
            info!("master set unchanged, load balancer left as is");
            return Ok(());
        }
        let nodes: Vec<String> = cluster
            .node_ips()
            .into_iter()
            .filter(|n| !diff.nodes.to_join.contains(n))
            .collect();
        if nodes.is_empty() {
            info!("no nodes to resync");
            return Ok(());
        }
        let runtime = self.0.ctx.runtime()?;
        runtime.set_topology(cluster).await;
        runtime.sync_lvscare(&nodes).await
    }
}

pub struct UnbootstrapLeaving(Part);

#[async_trait]
impl Step for UnbootstrapLeaving {
    fn name(&self) -> &'static str {
        "unbootstrap hosts"
    }

    async fn run(&self, _cluster: &mut Cluster) -> Result<()> {
        if let Err(e) = self.0.ctx.os().unbootstrap(&self.0.diff.leaving()).await {
            warn!(error = %e, "leaving hosts kept their registry entry");
        }
        Ok(())
    }
}

pub struct UnmountLeaving(Part);

#[async_trait]
impl Step for UnmountLeaving {
    fn name(&self) -> &'static str {
        "unmount rootfs"
    }

    async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let leaving = self.0.diff.leaving();
        if let Err(e) = self.0.ctx.mounter().unmount(cluster, &leaving).await {
            warn!(error = %e, "leaving hosts kept their rootfs");
        }
        Ok(())
    }
}
