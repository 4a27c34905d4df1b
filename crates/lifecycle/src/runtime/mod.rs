//! kubeadm runtime: init, join, upgrade, delete and reset of cluster nodes.
//!
//! Remote discovery (node facts, rootfs defaults, tokens) always runs with
//! the bootstrap lock released; the lock only covers mutate-and-snapshot.

pub mod bootstrap;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{PathResolver, RuntimeConfig};
use crate::error::{ClusterError, Result};
use crate::fanout;
use crate::hosts;
use crate::image::IMAGE_VERSION_LABEL;
use crate::kubeadm::token::{load_or_create_certificate_key, BootstrapToken};
use crate::kubeadm::version::KubeVersion;
use crate::remote::sealctl::CertRequest;
use crate::remote::{RemoteExecutor, Sealctl};
use crate::types::Cluster;

use bootstrap::{BootstrapState, CompletionHook, NodeFacts};

/// Kubeconfig written by kubeadm on control-plane nodes.
pub const REMOTE_ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

const KUBECONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);
const UPGRADE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// image-cri-shim speaks CRI v1 from this release on.
const CRI_V1_SINCE: KubeVersion = KubeVersion::new(1, 26, 0);
/// kubelet rejects the dockershim-era flags from this release on.
const KUBELET_FLAGS_REMOVED_SINCE: KubeVersion = KubeVersion::new(1, 27, 0);

const CRI_V1_COMMANDS: &[&str] = &[
    r#"sed -i "s/v1alpha2/v1/" /etc/image-cri-shim.yaml"#,
    "systemctl restart image-cri-shim",
    "systemctl restart kubelet",
];

const KUBELET_FLAGS_COMMANDS: &[&str] = &[
    r#"FILE="/etc/systemd/system/kubelet.service.d/10-kubeadm.conf" && [ -f "$FILE" ] && sed -i 's/\(--container-runtime=\|--pod-infra-container-image=\)\([^ ]*\)\?//g' "$FILE""#,
    "systemctl daemon-reload",
    "systemctl restart kubelet",
];

const UPGRADE_NODE_COMMAND: &str =
    "kubeadm upgrade node --certificate-renewal=false --skip-phases preflight";

const RESET_COMMANDS: &[&str] = &[
    "kubeadm reset -f -v 0",
    "rm -rf /etc/cni/net.d /var/lib/cni $HOME/.kube",
    "ipvsadm -C >/dev/null 2>&1 || true",
    "ip link delete kube-ipvs0 >/dev/null 2>&1 || true",
];

/// Hosts whose membership actually changed during this run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    /// Hosts whose `kubeadm join` succeeded.
    pub joined: Vec<String>,
    /// Hosts whose node object was deleted.
    pub removed: Vec<String>,
}

/// Kubernetes version of the rootfs image mounted for `cluster`.
///
/// # Errors
///
/// Returns [`ClusterError::PreProcess`] when no rootfs image is mounted
/// or it carries no usable version label.
pub fn rootfs_version(cluster: &Cluster) -> Result<KubeVersion> {
    let rootfs = cluster.rootfs_mount().ok_or_else(|| {
        ClusterError::PreProcess(format!(
            "cluster {} has no rootfs image mounted",
            cluster.name()
        ))
    })?;
    rootfs
        .labels
        .get(IMAGE_VERSION_LABEL)
        .ok_or_else(|| {
            ClusterError::PreProcess(format!(
                "rootfs image {} has no {IMAGE_VERSION_LABEL} label",
                rootfs.image_name
            ))
        })?
        .parse()
}

/// kubeadm-backed node lifecycle for one cluster.
pub struct KubeadmRuntime {
    exec: Arc<dyn RemoteExecutor>,
    sealctl: Sealctl,
    paths: PathResolver,
    config: RuntimeConfig,
    rootfs_local: Option<PathBuf>,
    state: Mutex<BootstrapState>,
    membership: std::sync::Mutex<Membership>,
}

impl KubeadmRuntime {
    /// Runtime for `cluster`, whose images must already be mounted.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::PreProcess`] when no rootfs image is mounted
    /// or it carries no usable version label.
    pub fn new(
        cluster: &Cluster,
        exec: Arc<dyn RemoteExecutor>,
        config: RuntimeConfig,
        user_kubeadm: Option<&str>,
    ) -> Result<Self> {
        let version = rootfs_version(cluster)?;
        let rootfs_local = cluster
            .rootfs_mount()
            .map(|rootfs| PathBuf::from(&rootfs.mount_point));

        let mut state = BootstrapState::new(version, config.clone(), user_kubeadm)?;
        state.set_topology(cluster.master_ips(), cluster.all_ips().len());
        info!(cluster = %cluster.name(), %version, "kubeadm runtime ready");

        Ok(Self {
            sealctl: Sealctl::new(Arc::clone(&exec)),
            exec,
            paths: config.paths(cluster.name()),
            rootfs_local,
            config,
            state: Mutex::new(state),
            membership: std::sync::Mutex::new(Membership::default()),
        })
    }

    /// Hosts joined and removed so far.
    #[must_use]
    pub fn membership(&self) -> Membership {
        self.membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_joined(&self, host: &str) {
        self.membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .joined
            .push(host.to_string());
    }

    fn record_removed(&self, host: &str) {
        self.membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .removed
            .push(host.to_string());
    }

    pub async fn version(&self) -> KubeVersion {
        self.state.lock().await.version()
    }

    /// Re-read masters and host count after the topology changed.
    pub async fn set_topology(&self, cluster: &Cluster) {
        self.state
            .lock()
            .await
            .set_topology(cluster.master_ips(), cluster.all_ips().len());
    }

    async fn master0(&self) -> Result<String> {
        self.state.lock().await.master0().map(str::to_string)
    }

    /// Masters as `ip:apiPort`, the real servers behind the VIP.
    async fn apiserver_endpoints(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let port = state.api_port();
        state
            .masters()
            .iter()
            .map(|m| hosts::join_host_port(hosts::host_ip(m), port))
            .collect()
    }

    /// CRI socket and cgroup driver as reported by `host` itself.
    pub async fn node_facts(&self, host: &str) -> Result<NodeFacts> {
        Ok(NodeFacts {
            cri_socket: self.sealctl.cri_socket(host).await?,
            cgroup_driver: self.sealctl.cgroup_driver(host).await?,
        })
    }

    /// The kubeadm defaults shipped in the rootfs: read from `host` when
    /// given, else (or on failure) from the local mount.
    async fn rootfs_default(&self, host: Option<&str>) -> Option<String> {
        if let Some(host) = host {
            let path = format!("{}/etc/kubeadm.yml", self.paths.remote_rootfs());
            match self.exec.cmd(host, &format!("cat {path}")).await {
                Ok(out) if !out.trim().is_empty() => return Some(out),
                Ok(_) => debug!(host, "no rootfs kubeadm defaults on host"),
                Err(e) => {
                    warn!(host, error = %e, "failed to read rootfs kubeadm defaults, using local copy");
                }
            }
        }
        let local = self.rootfs_local.as_ref()?.join("etc/kubeadm.yml");
        fs::read_to_string(local).ok()
    }

    /// Complete the shared config for the current topology.
    async fn complete(&self) -> Result<()> {
        let master0 = self.master0().await?;
        let facts = self.node_facts(&master0).await?;
        let rootfs = self.rootfs_default(None).await;
        let key = load_or_create_certificate_key(&self.paths.certificate_key_file())?;
        let hooks: Vec<CompletionHook> = vec![
            Box::new(move |s: &mut BootstrapState| {
                s.apply_node_facts(&facts);
                Ok(())
            }),
            Box::new(move |s: &mut BootstrapState| {
                s.set_certificate_key(&key);
                Ok(())
            }),
        ];
        self.state
            .lock()
            .await
            .complete_kubeadm_config(rootfs.as_deref(), hooks)
    }

    async fn ensure_completed(&self) -> Result<()> {
        if self.state.lock().await.is_completed() {
            return Ok(());
        }
        self.complete().await
    }

    /// Write a rendered config locally and copy it to `host`.
    async fn ship_config(&self, host: &str, content: &str, local: &Path, remote: &str) -> Result<()> {
        write_file(local, content)?;
        self.exec.copy(host, local, remote).await
    }

    /// Initialize master0 and fetch its admin kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns the first failing remote command, or a
    /// [`ClusterError::Remote`] when the kubeconfig does not appear in time.
    pub async fn init_master0(&self) -> Result<()> {
        let master0 = self.master0().await?;
        let node_name = self.sealctl.hostname(&master0).await?;
        self.complete().await?;

        let (snapshot, cert) = {
            let state = self.state.lock().await;
            let cert = CertRequest {
                alt_names: state.cert_sans(),
                node_ip: hosts::host_ip(&master0).to_string(),
                node_name,
                service_cidr: state.service_cidr(),
                dns_domain: state.dns_domain(),
            };
            (state.init_snapshot(), cert)
        };

        let local = self.paths.init_config();
        let remote = self.paths.remote_config(&local);
        self.ship_config(&master0, &snapshot.render()?, &local, &remote)
            .await?;

        info!(host = %master0, "Generating control-plane certificates...");
        self.sealctl.cert(&master0, &cert).await?;

        info!(host = %master0, "Running kubeadm init...");
        self.exec
            .cmd(&master0, &format!("kubeadm init --config {remote} --upload-certs -v 0"))
            .await?;
        self.exec
            .cmd(
                &master0,
                &format!("mkdir -p ~/.kube && cp {REMOTE_ADMIN_KUBECONFIG} ~/.kube/config"),
            )
            .await?;

        self.wait_for_kubeconfig(&master0).await?;
        info!(host = %master0, "✅ master0 initialized");
        Ok(())
    }

    async fn wait_for_kubeconfig(&self, master0: &str) -> Result<()> {
        let timeout = self.config.kubeconfig_timeout;
        let start = Instant::now();
        let dst = self.paths.admin_kubeconfig();
        loop {
            match self.exec.fetch(master0, REMOTE_ADMIN_KUBECONFIG, &dst).await {
                Ok(()) => {
                    info!(path = %dst.display(), "kubeconfig saved");
                    return Ok(());
                }
                Err(e) if start.elapsed() >= timeout => {
                    return Err(ClusterError::remote(
                        master0,
                        &format!("fetch {REMOTE_ADMIN_KUBECONFIG}"),
                        format!("kubeconfig not available after {}s: {e}", timeout.as_secs()),
                    ));
                }
                Err(e) => {
                    debug!(host = master0, error = %e, "kubeconfig not ready yet");
                    tokio::time::sleep(KUBECONFIG_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// The join token: cached, then persisted, then freshly created on
    /// master0. Tokens close to expiry are never reused.
    ///
    /// # Errors
    ///
    /// Returns an error when a new token is needed and cannot be created.
    pub async fn ensure_token(&self) -> Result<BootstrapToken> {
        let threshold = self.config.token_refresh_threshold;
        let usable = |t: &BootstrapToken| !t.needs_regeneration(Utc::now(), threshold);

        if let Some(token) = self.state.lock().await.token().filter(|t| usable(*t)) {
            return Ok(token.clone());
        }

        let token_file = self.paths.token_file();
        let token = match BootstrapToken::load(&token_file)?.filter(|t| usable(t)) {
            Some(token) => {
                debug!(path = %token_file.display(), "reusing persisted bootstrap token");
                token
            }
            None => {
                let master0 = self.master0().await?;
                let key = load_or_create_certificate_key(&self.paths.certificate_key_file())?;
                let config = self.paths.remote_config(&self.paths.init_config());
                info!(host = %master0, "Creating bootstrap token...");
                let mut token = self.sealctl.token(&master0, &config, &key).await?;
                if token.certificate_key.is_empty() {
                    token.certificate_key = key;
                }
                token.save(&token_file)?;
                token
            }
        };
        self.state.lock().await.set_token(token.clone());
        Ok(token)
    }

    /// Join `masters` one at a time.
    ///
    /// # Errors
    ///
    /// Stops at the first master that fails.
    pub async fn join_masters(&self, masters: &[String]) -> Result<()> {
        if masters.is_empty() {
            return Ok(());
        }
        self.ensure_completed().await?;
        self.ensure_token().await?;
        let master0 = self.master0().await?;
        let master0_ip = hosts::host_ip(&master0).to_string();
        let domain = self.config.apiserver_domain.clone();
        let local = self.paths.join_master_config();
        let remote = self.paths.remote_config(&local);

        for master in masters {
            info!(host = %master, "Joining master...");
            let facts = self.node_facts(master).await?;
            let rootfs = self.rootfs_default(Some(master)).await;
            let snapshot = self.state.lock().await.prepare_join_master(
                master,
                &facts,
                rootfs.as_deref(),
            )?;
            self.ship_config(master, &snapshot.render()?, &local, &remote)
                .await?;

            self.sealctl.hosts_add(master, &master0_ip, &domain).await?;
            self.exec
                .cmd(master, &format!("kubeadm join --config {remote} -v 0"))
                .await?;
            self.record_joined(master);
            self.sealctl
                .hosts_add(master, hosts::host_ip(master), &domain)
                .await?;
            self.exec
                .cmd(
                    master,
                    &format!("mkdir -p ~/.kube && cp {REMOTE_ADMIN_KUBECONFIG} ~/.kube/config"),
                )
                .await?;
            info!(host = %master, "✅ master joined");
        }
        Ok(())
    }

    /// Join `nodes` in parallel, each with its own join config.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::HostFailures`] listing every failed node.
    pub async fn join_nodes(self: &Arc<Self>, nodes: &[String]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        self.ensure_completed().await?;
        self.ensure_token().await?;
        let masters = Arc::new(self.apiserver_endpoints().await);

        fanout::for_each_host(nodes, self.config.max_parallel, |node| {
            let runtime = Arc::clone(self);
            let masters = Arc::clone(&masters);
            async move { runtime.join_node(&node, &masters).await }
        })
        .await
    }

    async fn join_node(&self, node: &str, masters: &[String]) -> Result<()> {
        info!(host = %node, "Joining node...");
        let facts = self.node_facts(node).await?;
        let rootfs = self.rootfs_default(Some(node)).await;
        let snapshot = self
            .state
            .lock()
            .await
            .join_node_snapshot(node, &facts, rootfs.as_deref())?;

        let local = per_host_path(&self.paths.tmp_dir(), node, &self.paths.join_node_config());
        let remote = self.paths.remote_config(&self.paths.join_node_config());
        self.ship_config(node, &snapshot.render()?, &local, &remote)
            .await?;

        self.sealctl
            .hosts_add(node, &self.config.vip, &self.config.apiserver_domain)
            .await?;
        self.sealctl
            .lvscare(
                node,
                &self.config.vip_endpoint(),
                &self.config.lvscare_image,
                masters,
            )
            .await?;
        self.exec
            .cmd(node, &format!("kubeadm join --config {remote} -v 0"))
            .await?;
        self.record_joined(node);
        info!(host = %node, "✅ node joined");
        Ok(())
    }

    /// Re-upload the cluster document so new SANs reach the kubeadm-config
    /// map on master0.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub async fn upload_cluster_config(&self) -> Result<()> {
        self.complete().await?;
        let master0 = self.master0().await?;
        let snapshot = self.state.lock().await.update_snapshot();
        let local = self.paths.update_config();
        let remote = self.paths.remote_config(&local);
        self.ship_config(&master0, &snapshot.render()?, &local, &remote)
            .await?;
        self.exec
            .cmd(
                &master0,
                &format!("kubeadm init phase upload-config kubeadm --config {remote}"),
            )
            .await
            .map(drop)
    }

    /// Reset `host` without touching its node object.
    async fn reset_host(&self, host: &str) -> Result<()> {
        let commands: Vec<String> = RESET_COMMANDS.iter().map(ToString::to_string).collect();
        self.exec.cmd_async(host, &commands).await?;
        self.sealctl
            .hosts_delete(host, &self.config.apiserver_domain)
            .await?;
        info!(host, "node reset");
        Ok(())
    }

    /// Take `host` out of the cluster: reset it if it still answers, then
    /// delete its node object through master0.
    ///
    /// The node name comes from the host itself, or from master0's node
    /// list when the host is gone.
    async fn remove_host(&self, host: &str, master0: &str) -> Result<()> {
        let name = match self.sealctl.hostname(host).await {
            Ok(name) => name.to_lowercase(),
            Err(e) => {
                warn!(host, error = %e, "leaving host unreachable, resolving node name on master0");
                self.node_name_by_ip(master0, hosts::host_ip(host)).await?
            }
        };
        if let Err(e) = self.reset_host(host).await {
            warn!(host, error = %e, "reset of leaving host failed, removing its node object anyway");
        }
        self.exec
            .cmd(master0, &format!("kubectl delete node {name} --ignore-not-found"))
            .await?;
        self.record_removed(host);
        Ok(())
    }

    /// Look up the node registered with internal IP `ip`.
    async fn node_name_by_ip(&self, master0: &str, ip: &str) -> Result<String> {
        let command = "kubectl get nodes -o wide --no-headers";
        let out = self.exec.cmd(master0, command).await?;
        out.lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>())
            .find(|cols| cols.get(5) == Some(&ip))
            .and_then(|cols| cols.first().map(|name| (*name).to_string()))
            .ok_or_else(|| ClusterError::remote(master0, command, format!("no node with address {ip}")))
    }

    /// Remove `masters` from the control plane, one at a time.
    ///
    /// # Errors
    ///
    /// Stops at the first master that fails.
    pub async fn delete_masters(&self, masters: &[String]) -> Result<()> {
        let master0 = self.master0().await?;
        for master in masters {
            if *master == master0 {
                return Err(ClusterError::Master0Deletion(master.clone()));
            }
            self.remove_host(master, &master0).await?;
        }
        Ok(())
    }

    /// Remove `nodes` in parallel.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::HostFailures`] listing every failed node.
    pub async fn delete_nodes(self: &Arc<Self>, nodes: &[String]) -> Result<()> {
        let master0 = Arc::new(self.master0().await?);
        fanout::for_each_host(nodes, self.config.max_parallel, |node| {
            let runtime = Arc::clone(self);
            let master0 = Arc::clone(&master0);
            async move { runtime.remove_host(&node, &master0).await }
        })
        .await
    }

    /// Point lvscare on `nodes` at the current masters.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::HostFailures`] listing every failed node.
    pub async fn sync_lvscare(self: &Arc<Self>, nodes: &[String]) -> Result<()> {
        let masters = Arc::new(self.apiserver_endpoints().await);
        info!(nodes = nodes.len(), masters = ?masters, "Syncing load balancer real servers...");
        fanout::for_each_host(nodes, self.config.max_parallel, |node| {
            let runtime = Arc::clone(self);
            let masters = Arc::clone(&masters);
            async move {
                runtime
                    .sealctl
                    .lvscare(
                        &node,
                        &runtime.config.vip_endpoint(),
                        &runtime.config.lvscare_image,
                        &masters,
                    )
                    .await
            }
        })
        .await
    }

    /// Reset every host in `hosts` without touching node objects.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::HostFailures`] listing every failed host.
    pub async fn reset(self: &Arc<Self>, hosts: &[String]) -> Result<()> {
        fanout::for_each_host(hosts, self.config.max_parallel, |host| {
            let runtime = Arc::clone(self);
            async move { runtime.reset_host(&host).await }
        })
        .await
    }

    /// Upgrade every host of `cluster` from `from` to the rootfs version.
    ///
    /// master0 runs `kubeadm upgrade apply` with a freshly rendered config,
    /// the other masters follow one at a time, then workers in parallel.
    /// Each host is cordoned while its kubelet is replaced.
    ///
    /// # Errors
    ///
    /// Stops at the first failing master; worker failures are collected
    /// into [`ClusterError::HostFailures`].
    pub async fn upgrade(self: &Arc<Self>, cluster: &Cluster, from: KubeVersion) -> Result<()> {
        self.set_topology(cluster).await;
        let to = self.version().await;
        let master0 = self.master0().await?;
        self.complete().await?;

        let snapshot = self.state.lock().await.upgrade_snapshot();
        let local = self.paths.upgrade_config();
        let remote = self.paths.remote_config(&local);
        self.ship_config(&master0, &snapshot.render()?, &local, &remote)
            .await?;

        info!(host = %master0, %from, %to, "Upgrading master0...");
        let apply = format!("kubeadm upgrade apply --certificate-renewal=false --config {remote} --yes");
        self.upgrade_host(&master0, &master0, from, &apply).await?;

        for master in cluster.master_ips().iter().skip(1) {
            info!(host = %master, %to, "Upgrading master...");
            self.upgrade_host(master, &master0, from, UPGRADE_NODE_COMMAND)
                .await?;
        }

        let master0 = Arc::new(master0);
        fanout::for_each_host(&cluster.node_ips(), self.config.max_parallel, |node| {
            let runtime = Arc::clone(self);
            let master0 = Arc::clone(&master0);
            async move {
                runtime
                    .upgrade_host(&node, &master0, from, UPGRADE_NODE_COMMAND)
                    .await
            }
        })
        .await?;
        info!(%to, "✅ cluster upgraded");
        Ok(())
    }

    /// Replace kubeadm, run `upgrade`, then replace kubelet with `host`
    /// cordoned. kubectl runs on master0.
    async fn upgrade_host(
        &self,
        host: &str,
        master0: &str,
        from: KubeVersion,
        upgrade: &str,
    ) -> Result<()> {
        let to = self.version().await;
        let mut prepare: Vec<String> = Vec::new();
        if from < CRI_V1_SINCE && CRI_V1_SINCE <= to {
            prepare.extend(CRI_V1_COMMANDS.iter().map(ToString::to_string));
        }
        if from < KUBELET_FLAGS_REMOVED_SINCE && KUBELET_FLAGS_REMOVED_SINCE <= to {
            prepare.extend(KUBELET_FLAGS_COMMANDS.iter().map(ToString::to_string));
        }
        self.exec.cmd_async(host, &prepare).await?;

        // kubelet registers the lowercased hostname.
        let name = self.sealctl.hostname(host).await?.to_lowercase();
        self.wait_for_apiserver(master0).await?;

        let pull = format!("kubeadm config images pull --kubernetes-version {to}");
        if let Err(e) = self.exec.cmd(host, &pull).await {
            warn!(host, error = %e, "image pull before upgrade failed");
        }

        let bin = format!("{}/bin", self.paths.remote_rootfs());
        self.exec
            .cmd_async(
                host,
                &[format!("cp -rf {bin}/kubeadm /usr/bin"), upgrade.to_string()],
            )
            .await?;
        self.exec
            .cmd(master0, &format!("kubectl cordon {name}"))
            .await?;
        self.exec
            .cmd_async(
                host,
                &[
                    format!("cp -rf {bin}/kubectl /usr/bin"),
                    format!("cp -rf {bin}/kubelet /usr/bin"),
                    "systemctl daemon-reload".to_string(),
                    "systemctl restart kubelet".to_string(),
                ],
            )
            .await?;
        self.uncordon(master0, &name).await?;
        info!(host, %to, "✅ host upgraded");
        Ok(())
    }

    /// Poll the API server through master0 until it lists nodes.
    async fn wait_for_apiserver(&self, master0: &str) -> Result<()> {
        self.poll_until_ok(master0, "kubectl get nodes").await
    }

    /// Uncordon `name`, retrying while its kubelet restarts.
    async fn uncordon(&self, master0: &str, name: &str) -> Result<()> {
        self.poll_until_ok(master0, &format!("kubectl uncordon {name}"))
            .await
    }

    /// Run `command` on `host` until it succeeds or the upgrade timeout
    /// passes.
    async fn poll_until_ok(&self, host: &str, command: &str) -> Result<()> {
        let timeout = self.config.upgrade_timeout;
        let interval = UPGRADE_POLL_INTERVAL.min(timeout);
        let start = Instant::now();
        loop {
            match self.exec.cmd(host, command).await {
                Ok(_) => return Ok(()),
                Err(e) if start.elapsed() >= timeout => {
                    return Err(ClusterError::remote(
                        host,
                        command,
                        format!("still failing after {}s: {e}", timeout.as_secs()),
                    ));
                }
                Err(e) => {
                    debug!(host, command, error = %e, "not ready yet");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// `<dir>/<ip>-<file name of template>`, unique per host.
fn per_host_path(dir: &Path, host: &str, template: &Path) -> PathBuf {
    let file = template
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let host = host.replace([':', '[', ']'], "_");
    dir.join(format!("{host}-{file}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mounted_cluster, FakeExecutor};
    use tempfile::TempDir;

    fn runtime(
        dir: &TempDir,
        exec: &Arc<FakeExecutor>,
        masters: &[&str],
        nodes: &[&str],
    ) -> Arc<KubeadmRuntime> {
        let config = RuntimeConfig::default().with_cluster_root(dir.path().join("root"));
        runtime_with(dir, exec, masters, nodes, config)
    }

    fn runtime_with(
        dir: &TempDir,
        exec: &Arc<FakeExecutor>,
        masters: &[&str],
        nodes: &[&str],
        config: RuntimeConfig,
    ) -> Arc<KubeadmRuntime> {
        let cluster = mounted_cluster(dir.path(), masters, nodes);
        Arc::new(KubeadmRuntime::new(&cluster, exec.clone(), config, None).unwrap())
    }

    fn assert_in_order(cmds: &[String], prefixes: &[&str]) {
        let mut rest = cmds.iter();
        for prefix in prefixes {
            assert!(
                rest.any(|c| c.starts_with(prefix)),
                "{prefix:?} missing or out of order in {cmds:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_init_master0_writes_config_and_fetches_kubeconfig() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let rt = runtime(&dir, &exec, &["10.0.0.1:22"], &[]);
        rt.init_master0().await.unwrap();

        let init = rt.paths.init_config();
        let rendered = fs::read_to_string(&init).unwrap();
        assert!(rendered.contains("kind: InitConfiguration"));
        assert!(rendered.contains("advertiseAddress: 10.0.0.1"));
        assert!(rendered.contains("taints: []"));
        assert!(rt.paths.admin_kubeconfig().exists());

        let cmds = exec.commands_on("10.0.0.1:22");
        let cert = cmds.iter().position(|c| c.starts_with("sealctl cert")).unwrap();
        let init = cmds.iter().position(|c| c.starts_with("kubeadm init")).unwrap();
        assert!(cert < init);
        assert!(cmds[cert].contains("--node-name node-10.0.0.1"));
    }

    #[tokio::test]
    async fn test_fresh_token_is_reused_without_remote_calls() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let rt = runtime(&dir, &exec, &["10.0.0.1:22"], &[]);

        let first = rt.ensure_token().await.unwrap();
        assert_eq!(exec.count_matching("sealctl token"), 1);
        assert!(rt.paths.token_file().exists());

        let second = rt.ensure_token().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(exec.count_matching("sealctl token"), 1);
    }

    #[tokio::test]
    async fn test_expiring_persisted_token_is_regenerated() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let rt = runtime(&dir, &exec, &["10.0.0.1:22"], &[]);
        BootstrapToken {
            join_token: "old.token".into(),
            discovery_token_ca_cert_hash: vec!["sha256:old".into()],
            certificate_key: "old".into(),
            expires: Utc::now() + chrono::Duration::seconds(60),
        }
        .save(&rt.paths.token_file())
        .unwrap();

        let token = rt.ensure_token().await.unwrap();
        assert_ne!(token.join_token, "old.token");
        assert_eq!(exec.count_matching("sealctl token"), 1);
    }

    #[tokio::test]
    async fn test_valid_persisted_token_is_loaded() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let rt = runtime(&dir, &exec, &["10.0.0.1:22"], &[]);
        let saved = BootstrapToken {
            join_token: "kept.token".into(),
            discovery_token_ca_cert_hash: vec!["sha256:kept".into()],
            certificate_key: "kept".into(),
            expires: Utc::now() + chrono::Duration::hours(2),
        };
        saved.save(&rt.paths.token_file()).unwrap();
        assert_eq!(rt.ensure_token().await.unwrap(), saved);
        assert_eq!(exec.count_matching("sealctl token"), 0);
    }

    #[tokio::test]
    async fn test_join_masters_runs_in_order() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let rt = runtime(&dir, &exec, &["10.0.0.1:22", "10.0.0.2:22"], &[]);
        rt.join_masters(&["10.0.0.2:22".to_string()]).await.unwrap();

        let cmds = exec.commands_on("10.0.0.2:22");
        let expected = [
            "sealctl hosts add --ip 10.0.0.1 --domain apiserver.cluster.local",
            "kubeadm join --config",
            "sealctl hosts add --ip 10.0.0.2 --domain apiserver.cluster.local",
            "mkdir -p ~/.kube",
        ];
        let positions: Vec<_> = expected
            .iter()
            .map(|e| cmds.iter().position(|c| c.starts_with(e)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        let rendered = fs::read_to_string(rt.paths.join_master_config()).unwrap();
        assert!(rendered.contains("apiServerEndpoint: 10.0.0.1:6443"));
    }

    #[tokio::test]
    async fn test_join_nodes_collects_failures() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default().fail_on("10.0.0.4:22", "kubeadm join"));
        let rt = runtime(&dir, &exec, &["10.0.0.1:22"], &["10.0.0.3:22", "10.0.0.4:22"]);
        let err = rt
            .join_nodes(&["10.0.0.3:22".to_string(), "10.0.0.4:22".to_string()])
            .await
            .unwrap_err();
        match err {
            ClusterError::HostFailures(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].host, "10.0.0.4:22");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(exec
            .commands_on("10.0.0.3:22")
            .iter()
            .any(|c| c.starts_with("kubeadm join")));
        assert!(exec
            .commands_on("10.0.0.3:22")
            .iter()
            .any(|c| c.contains("--masters 10.0.0.1:6443")));
    }

    #[tokio::test]
    async fn test_delete_refuses_master0_and_removes_node_objects() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let rt = runtime(&dir, &exec, &["10.0.0.1:22", "10.0.0.2:22"], &["10.0.0.3:22"]);
        assert!(matches!(
            rt.delete_masters(&["10.0.0.1:22".to_string()]).await,
            Err(ClusterError::Master0Deletion(_))
        ));
        assert_eq!(exec.call_count(), 0);

        rt.delete_nodes(&["10.0.0.3:22".to_string()]).await.unwrap();
        assert!(exec
            .commands_on("10.0.0.1:22")
            .contains(&"kubectl delete node node-10.0.0.3 --ignore-not-found".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_leaving_node_is_still_deleted() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(
            FakeExecutor::default()
                .unreachable("10.0.0.3:22")
                .respond(
                    "kubectl get nodes -o wide",
                    "node-10.0.0.1   Ready   control-plane   5d   v1.27.3   10.0.0.1   <none>\n\
                     node-10.0.0.3   NotReady   <none>   5d   v1.27.3   10.0.0.3   <none>\n",
                ),
        );
        let rt = runtime(&dir, &exec, &["10.0.0.1:22"], &["10.0.0.3:22"]);
        rt.delete_nodes(&["10.0.0.3:22".to_string()]).await.unwrap();

        assert!(exec
            .commands_on("10.0.0.1:22")
            .contains(&"kubectl delete node node-10.0.0.3 --ignore-not-found".to_string()));
        assert_eq!(rt.membership().removed, vec!["10.0.0.3:22".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_leaving_node_is_not_recorded_as_removed() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default().unreachable("10.0.0.3:22"));
        let rt = runtime(&dir, &exec, &["10.0.0.1:22"], &["10.0.0.3:22"]);
        let err = rt
            .delete_nodes(&["10.0.0.3:22".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::HostFailures(_)));
        assert_eq!(exec.count_matching("kubectl delete node"), 0);
        assert!(rt.membership().removed.is_empty());
    }

    #[tokio::test]
    async fn test_membership_lists_only_successful_joins() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default().fail_on("10.0.0.4:22", "kubeadm join"));
        let rt = runtime(&dir, &exec, &["10.0.0.1:22"], &["10.0.0.3:22", "10.0.0.4:22"]);
        assert!(rt
            .join_nodes(&["10.0.0.3:22".to_string(), "10.0.0.4:22".to_string()])
            .await
            .is_err());
        assert_eq!(
            rt.membership(),
            Membership {
                joined: vec!["10.0.0.3:22".to_string()],
                removed: Vec::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_upgrade_runs_master0_before_nodes() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let rt = runtime(&dir, &exec, &["10.0.0.1:22"], &["10.0.0.3:22"]);
        rt.upgrade(
            &mounted_cluster(dir.path(), &["10.0.0.1:22"], &["10.0.0.3:22"]),
            KubeVersion::new(1, 25, 0),
        )
        .await
        .unwrap();

        let rendered = fs::read_to_string(rt.paths.upgrade_config()).unwrap();
        assert!(rendered.contains("imagePullPolicy: Never"));
        assert!(rendered.contains("kubernetesVersion: v1.27.3"));
        assert!(exec
            .copies_to("10.0.0.1:22")
            .iter()
            .any(|d| d.ends_with("kubeadm-upgrade.yaml")));

        let master0 = exec.commands_on("10.0.0.1:22");
        let order = [
            r#"sed -i "s/v1alpha2/v1/""#,
            "FILE=",
            "kubectl get nodes",
            "cp -rf /var/lib/sealos/data/default/rootfs/bin/kubeadm /usr/bin",
            "kubeadm upgrade apply --certificate-renewal=false --config",
            "kubectl cordon node-10.0.0.1",
            "cp -rf /var/lib/sealos/data/default/rootfs/bin/kubelet /usr/bin",
            "systemctl restart kubelet",
            "kubectl uncordon node-10.0.0.1",
            "kubectl cordon node-10.0.0.3",
            "kubectl uncordon node-10.0.0.3",
        ];
        assert_in_order(&master0, &order);

        let node = exec.commands_on("10.0.0.3:22");
        assert!(node.iter().any(|c| c.starts_with("kubeadm upgrade node")));
        assert!(!node.iter().any(|c| c.starts_with("kubeadm upgrade apply")));
        assert!(!node.iter().any(|c| c.starts_with("kubectl")));
    }

    #[tokio::test]
    async fn test_upgrade_applies_only_crossed_version_fixes() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default());
        let rt = runtime(&dir, &exec, &["10.0.0.1:22"], &["10.0.0.3:22"]);
        rt.upgrade(
            &mounted_cluster(dir.path(), &["10.0.0.1:22"], &["10.0.0.3:22"]),
            KubeVersion::new(1, 26, 5),
        )
        .await
        .unwrap();
        assert_eq!(exec.count_matching(r#"sed -i "s/v1alpha2/v1/""#), 0);
        assert_eq!(exec.count_matching("FILE="), 2);
    }

    #[tokio::test]
    async fn test_upgrade_fails_when_uncordon_never_succeeds() {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::default().fail_on("10.0.0.1:22", "kubectl uncordon"));
        let mut config = RuntimeConfig::default().with_cluster_root(dir.path().join("root"));
        config.upgrade_timeout = Duration::ZERO;
        let rt = runtime_with(&dir, &exec, &["10.0.0.1:22"], &["10.0.0.3:22"], config);
        let err = rt
            .upgrade(
                &mounted_cluster(dir.path(), &["10.0.0.1:22"], &["10.0.0.3:22"]),
                KubeVersion::new(1, 27, 0),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            ClusterError::Remote { command, message, .. }
                if command == "kubectl uncordon node-10.0.0.1" && message.contains("still failing")
        ));
        assert!(exec.commands_on("10.0.0.3:22").is_empty());
    }

    #[tokio::test]
    async fn test_missing_version_label_is_preprocess_error() {
        let dir = TempDir::new().unwrap();
        let mut cluster = mounted_cluster(dir.path(), &["10.0.0.1:22"], &[]);
        for mount in &mut cluster.status.mounts {
            mount.labels.remove(IMAGE_VERSION_LABEL);
        }
        let exec: Arc<dyn RemoteExecutor> = Arc::new(FakeExecutor::default());
        assert!(matches!(
            KubeadmRuntime::new(&cluster, exec, RuntimeConfig::default(), None),
            Err(ClusterError::PreProcess(_))
        ));
    }

    #[test]
    fn test_per_host_paths_are_distinct() {
        let dir = Path::new("/tmp/x");
        let template = Path::new("/a/kubeadm-join-node.yaml");
        assert_ne!(
            per_host_path(dir, "10.0.0.3:22", template),
            per_host_path(dir, "10.0.0.4:22", template)
        );
    }
}
