//! Processor pipelines: ordered, named steps over a cluster.
//!
//! A pipeline stops at the first failing step and wraps the error with the
//! step name. Completed steps are never rolled back; every pipeline is
//! designed to be re-run.

pub mod create;
pub mod delete;
pub mod scale;
pub mod upgrade;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::checker::{run_checks, Checker, ContainerdChecker, HostChecker};
use crate::config::{PathResolver, RuntimeConfig};
use crate::configs::Config;
use crate::error::{ClusterError, Result};
use crate::guest::GuestRunner;
use crate::image::ImageService;
use crate::prepare::OsBootstrap;
use crate::remote::RemoteExecutor;
use crate::rootfs::RootfsMounter;
use crate::runtime::{KubeadmRuntime, Membership};
use crate::store::{ClusterStore, Clusterfile};
use crate::types::Cluster;

/// One pipeline step.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, cluster: &mut Cluster) -> Result<()>;
}

/// An ordered list of steps.
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Step names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order.
    ///
    /// # Errors
    ///
    /// Returns the first step error, wrapped as [`ClusterError::Step`].
    pub async fn run(&self, cluster: &mut Cluster) -> Result<()> {
        let total = self.steps.len();
        for (i, step) in self.steps.iter().enumerate() {
            info!(step = step.name(), "[{}/{total}] {}", i + 1, step.name());
            step.run(cluster)
                .await
                .map_err(|e| e.in_step(step.name()))?;
        }
        Ok(())
    }
}

/// Collaborators shared by the steps of one pipeline run.
pub struct Context {
    pub config: RuntimeConfig,
    pub exec: Arc<dyn RemoteExecutor>,
    pub images: Arc<dyn ImageService>,
    pub store: ClusterStore,
    pub configs: Vec<Config>,
    pub kubeadm: Option<String>,
    runtime: OnceLock<Arc<KubeadmRuntime>>,
}

impl Context {
    #[must_use]
    pub fn new(
        config: RuntimeConfig,
        exec: Arc<dyn RemoteExecutor>,
        images: Arc<dyn ImageService>,
        store: ClusterStore,
        file: &Clusterfile,
    ) -> Self {
        Self {
            config,
            exec,
            images,
            store,
            configs: file.configs.clone(),
            kubeadm: file.kubeadm.clone(),
            runtime: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn paths(&self) -> &PathResolver {
        self.store.paths()
    }

    /// The record persisted for `cluster`, with this run's documents.
    #[must_use]
    pub fn clusterfile(&self, cluster: &Cluster) -> Clusterfile {
        Clusterfile {
            cluster: cluster.clone(),
            configs: self.configs.clone(),
            kubeadm: self.kubeadm.clone(),
        }
    }

    /// Build the runtime once; later calls return the same instance.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::PreProcess`] when `cluster` has no usable
    /// rootfs mount.
    pub fn build_runtime(&self, cluster: &Cluster) -> Result<Arc<KubeadmRuntime>> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(Arc::clone(runtime));
        }
        let runtime = Arc::new(KubeadmRuntime::new(
            cluster,
            Arc::clone(&self.exec),
            self.config.clone(),
            self.kubeadm.as_deref(),
        )?);
        Ok(Arc::clone(self.runtime.get_or_init(|| runtime)))
    }

    /// The runtime built by an earlier step.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::PreProcess`] when no step built it.
    pub fn runtime(&self) -> Result<Arc<KubeadmRuntime>> {
        self.runtime
            .get()
            .cloned()
            .ok_or_else(|| ClusterError::PreProcess("kubeadm runtime not initialized".into()))
    }

    /// Hosts joined and removed by this run; empty before the runtime
    /// exists.
    #[must_use]
    pub fn membership(&self) -> Membership {
        self.runtime
            .get()
            .map(|runtime| runtime.membership())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn mounter(&self) -> RootfsMounter {
        RootfsMounter::new(
            Arc::clone(&self.exec),
            self.paths().clone(),
            self.config.max_parallel,
        )
    }

    #[must_use]
    pub fn os(&self) -> OsBootstrap {
        OsBootstrap::new(
            Arc::clone(&self.exec),
            self.paths().clone(),
            self.config.max_parallel,
        )
    }

    #[must_use]
    pub fn guest(&self) -> GuestRunner {
        GuestRunner::new(Arc::clone(&self.exec), self.paths().clone())
    }

    /// Pull every image and mount it as `<cluster>-<index>`, recording the
    /// mounts in the cluster status.
    ///
    /// # Errors
    ///
    /// Returns the first image service failure.
    pub async fn mount_images(&self, cluster: &mut Cluster) -> Result<()> {
        self.images.pull(&cluster.spec.image).await?;
        let mut mounts = Vec::with_capacity(cluster.spec.image.len());
        for (i, image) in cluster.spec.image.iter().enumerate() {
            let name = format!("{}-{i}", cluster.name());
            let mount = self.images.mount(&name, image).await?;
            debug!(image = %image, mount = %mount.mount_point, "image mounted");
            mounts.push(mount);
        }
        cluster.status.mounts = mounts;
        Ok(())
    }

    /// Remove the working containers; the status keeps the mount records.
    ///
    /// # Errors
    ///
    /// Returns the first image service failure.
    pub async fn release_images(&self, cluster: &Cluster) -> Result<()> {
        for mount in &cluster.status.mounts {
            self.images.unmount(&mount.name).await?;
        }
        Ok(())
    }

    /// Reachability of `reachable`, then a containerd check on `fresh`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Preflight`] naming the failed check.
    pub async fn preflight(&self, reachable: &[String], fresh: &[String]) -> Result<()> {
        let ping: Vec<Box<dyn Checker>> = vec![Box::new(HostChecker::new(
            Arc::clone(&self.exec),
            self.config.max_parallel,
        ))];
        run_checks(&ping, reachable).await?;
        if fresh.is_empty() {
            return Ok(());
        }
        let runtime: Vec<Box<dyn Checker>> = vec![Box::new(ContainerdChecker::new(
            Arc::clone(&self.exec),
            self.config.max_parallel,
        ))];
        run_checks(&runtime, fresh).await
    }
}
