//! The top-level reconciler: `apply` and `delete` for one cluster.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::RuntimeConfig;
use crate::diff::{ClusterDiff, ScaleAction};
use crate::error::{ClusterError, Result};
use crate::image::ImageService;
use crate::processor::{create, delete, scale, upgrade, Context};
use crate::remote::RemoteExecutor;
use crate::kubeadm::version::KubeVersion;
use crate::runtime::{rootfs_version, Membership};
use crate::store::{ClusterStore, Clusterfile};
use crate::types::{
    Cluster, ClusterCondition, ClusterPhase, ConditionStatus, Host, CONDITION_APPLY,
};

/// External collaborators of the applier.
#[derive(Clone)]
pub struct Environment {
    pub config: RuntimeConfig,
    pub executor: Arc<dyn RemoteExecutor>,
    pub images: Arc<dyn ImageService>,
}

/// Drives a cluster from its recorded state to the desired one.
pub struct Applier {
    env: Environment,
    store: ClusterStore,
    desired: Clusterfile,
    current: Option<Clusterfile>,
}

impl Applier {
    /// Applier for `desired`, loading the record of the same name.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing record cannot be read.
    pub fn new(env: Environment, desired: Clusterfile) -> Result<Self> {
        let store = ClusterStore::new(env.config.paths(desired.cluster.name()));
        let current = store.load()?;
        Ok(Self {
            env,
            store,
            desired,
            current,
        })
    }

    /// The recorded cluster, if any.
    #[must_use]
    pub fn current(&self) -> Option<&Cluster> {
        self.current.as_ref().map(|f| &f.cluster)
    }

    /// The desired cluster, carrying the status of the last run.
    #[must_use]
    pub fn cluster(&self) -> &Cluster {
        &self.desired.cluster
    }

    fn context(&self) -> Arc<Context> {
        Arc::new(Context::new(
            self.env.config.clone(),
            Arc::clone(&self.env.executor),
            Arc::clone(&self.env.images),
            self.store.clone(),
            &self.desired,
        ))
    }

    /// Reconcile, then record the outcome whether or not it succeeded.
    ///
    /// # Errors
    ///
    /// Returns validation errors before any host is contacted, the pipeline
    /// error when a step failed, or a store error when the record could not
    /// be written after a successful run.
    pub async fn apply(&mut self) -> Result<()> {
        let mut cluster = self.desired.cluster.clone();
        cluster.status.phase = Some(ClusterPhase::InProcess);
        cluster.status.conditions.clear();

        let recorded = self
            .current
            .as_ref()
            .map(|f| f.cluster.clone())
            .filter(Cluster::is_created);

        let (result, persisted) = match recorded {
            None => {
                info!(cluster = %cluster.name(), "Creating cluster...");
                let result = create::pipeline(&self.context()).run(&mut cluster).await;
                if result.is_ok() {
                    cluster.metadata.creation_timestamp = Some(Utc::now());
                }
                (result, None)
            }
            Some(current) => {
                cluster.metadata.creation_timestamp = current.metadata.creation_timestamp;
                if cluster.status.mounts.is_empty() {
                    cluster.status.mounts = current.status.mounts.clone();
                }
                let diff = ClusterDiff::between(&current, &cluster);
                diff.validate(&current, &cluster)?;
                if cluster.spec.image == current.spec.image {
                    self.scale(&current, &mut cluster, diff).await
                } else if diff.is_empty() {
                    let from = rootfs_version(&current)?;
                    self.upgrade(&current, &mut cluster, from).await
                } else {
                    return Err(ClusterError::Validation(
                        "images and hosts both changed; apply them separately".into(),
                    ));
                }
            }
        };

        self.finish(cluster, persisted, result)
    }

    /// Run the half of the scale pipeline `diff` selects. Returns the
    /// cluster to persist when it differs from the desired one.
    async fn scale(
        &self,
        current: &Cluster,
        cluster: &mut Cluster,
        diff: ClusterDiff,
    ) -> (Result<()>, Option<Cluster>) {
        let action = diff.action();
        let diff = Arc::new(diff);
        let ctx = self.context();
        let result = match action {
            ScaleAction::None => {
                info!(cluster = %cluster.name(), "✅ cluster already up to date");
                return (Ok(()), None);
            }
            ScaleAction::Up => {
                let leaving = diff.leaving();
                if leaving.is_empty() {
                    info!(joining = ?diff.joining(), "Scaling up...");
                    scale::up(&ctx, &diff).run(cluster).await
                } else {
                    warn!(
                        leaving = ?leaving,
                        "hosts join and leave in one apply; joining first, run apply again to remove the rest"
                    );
                    let mut working = cluster.clone();
                    keep_hosts(&mut working, current, &leaving);
                    let result = scale::up(&ctx, &diff).run(&mut working).await;
                    cluster.status = working.status.clone();
                    result
                }
            }
            ScaleAction::Down => {
                info!(leaving = ?diff.leaving(), "Scaling down...");
                scale::down(&ctx, &diff).run(cluster).await
            }
        };
        let record = settled(current, cluster, &diff, &ctx.membership());
        (result, record)
    }

    /// Run the image pipeline. A failed run keeps the recorded images so
    /// the next apply retries it.
    async fn upgrade(
        &self,
        current: &Cluster,
        cluster: &mut Cluster,
        from: KubeVersion,
    ) -> (Result<()>, Option<Cluster>) {
        info!(from = ?current.spec.image, to = ?cluster.spec.image, "Updating cluster images...");
        let result = upgrade::pipeline(&self.context(), from).run(cluster).await;
        let record = result.is_err().then(|| {
            let mut record = cluster.clone();
            record.spec.image = current.spec.image.clone();
            record.status.mounts = current.status.mounts.clone();
            record
        });
        (result, record)
    }

    fn finish(
        &mut self,
        mut cluster: Cluster,
        persisted: Option<Cluster>,
        result: Result<()>,
    ) -> Result<()> {
        let cancelled = matches!(&result, Err(e) if e.is_cancelled());
        if cancelled {
            warn!(cluster = %cluster.name(), "operation cancelled");
            let previous = self.current.as_ref().map(|f| &f.cluster.status);
            cluster.status.phase = previous.and_then(|s| s.phase);
            cluster.status.conditions = previous
                .map(|s| s.conditions.clone())
                .unwrap_or_default();
        } else {
            let (phase, status, reason, message) = match &result {
                Ok(()) => (
                    ClusterPhase::Success,
                    ConditionStatus::True,
                    "Applied",
                    "Applied to cluster successfully".to_string(),
                ),
                Err(e) => {
                    error!(cluster = %cluster.name(), error = %e, "apply failed");
                    (
                        ClusterPhase::Failed,
                        ConditionStatus::False,
                        "ApplyClusterError",
                        e.to_string(),
                    )
                }
            };
            cluster.status.phase = Some(phase);
            cluster.set_condition(ClusterCondition {
                type_: CONDITION_APPLY.to_string(),
                status,
                last_heartbeat_time: Utc::now(),
                reason: reason.to_string(),
                message,
            });
        }

        let mut record = persisted.unwrap_or_else(|| cluster.clone());
        record.status.phase = cluster.status.phase;
        record.status.conditions = cluster.status.conditions.clone();
        record.metadata.creation_timestamp = cluster.metadata.creation_timestamp;
        let file = Clusterfile {
            cluster: record,
            configs: self.desired.configs.clone(),
            kubeadm: self.desired.kubeadm.clone(),
        };
        let saved = self.store.save(&file);
        self.current = Some(file);
        self.desired.cluster = cluster;

        match (result, saved) {
            (Err(e), Err(save)) => {
                error!(error = %save, "failed to record cluster state");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), saved) => saved,
        }
    }

    /// Tear the cluster down and remove its local record.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub async fn delete(&mut self) -> Result<()> {
        let mut cluster = match &self.current {
            Some(file) => {
                let mut cluster = file.cluster.clone();
                if cluster.spec.image.is_empty() {
                    cluster.spec.image = self.desired.cluster.spec.image.clone();
                }
                cluster
            }
            None => self.desired.cluster.clone(),
        };
        cluster.metadata.deletion_timestamp = Some(Utc::now());
        info!(cluster = %cluster.name(), "Deleting cluster...");
        delete::pipeline(&self.context()).run(&mut cluster).await?;
        self.current = None;
        self.desired.cluster = cluster;
        info!("✅ cluster deleted");
        Ok(())
    }
}

/// The record a scale run leaves behind: `cluster` minus the hosts that
/// never joined, plus the leaving hosts whose node object still exists.
/// `None` when that is `cluster` itself.
fn settled(
    current: &Cluster,
    cluster: &Cluster,
    diff: &ClusterDiff,
    membership: &Membership,
) -> Option<Cluster> {
    let unjoined: Vec<String> = diff
        .joining()
        .into_iter()
        .filter(|h| !membership.joined.contains(h))
        .collect();
    let remaining: Vec<String> = diff
        .leaving()
        .into_iter()
        .filter(|h| !membership.removed.contains(h))
        .collect();
    if unjoined.is_empty() && remaining.is_empty() {
        return None;
    }
    let mut record = cluster.clone();
    record.remove_hosts(&unjoined);
    keep_hosts(&mut record, current, &remaining);
    Some(record)
}

/// Re-add `addrs` from `current` into `cluster`, one group per address so
/// each keeps its roles, credentials and env.
fn keep_hosts(cluster: &mut Cluster, current: &Cluster, addrs: &[String]) {
    for addr in addrs {
        if let Some(group) = current.group_of(addr) {
            cluster.spec.hosts.push(Host {
                ips: vec![addr.clone()],
                roles: group.roles.clone(),
                ssh: Some(current.ssh_for(addr)),
                env: group.env.clone(),
            });
        }
    }
}
