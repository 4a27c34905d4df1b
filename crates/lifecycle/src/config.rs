//! Runtime configuration and per-cluster path layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the local cluster root.
pub const ENV_RUNTIME_ROOT: &str = "SEALOS_RUNTIME_ROOT";
/// Environment variable overriding the remote data root.
pub const ENV_DATA_ROOT: &str = "SEALOS_DATA_ROOT";
/// Environment variable overriding the virtual IP.
pub const ENV_VIP: &str = "SEALOS_VIP";
/// Environment variable overriding the fan-out limit.
pub const ENV_MAX_PARALLEL: &str = "SEALOS_MAX_PARALLEL";

/// Default API server port.
pub const DEFAULT_APISERVER_PORT: u16 = 6443;
/// Default fan-out limit.
pub const DEFAULT_MAX_PARALLEL: usize = 10;

/// Settings shared by every pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Local root holding one directory per cluster.
    pub cluster_root: PathBuf,
    /// Local directory holding per-cluster data when this machine is a host.
    pub local_data_root: PathBuf,
    /// Remote directory holding per-cluster data on every host.
    pub remote_data_root: String,
    /// DNS name of the API server.
    pub apiserver_domain: String,
    /// Virtual IP fronting the masters on worker nodes.
    pub vip: String,
    /// API server bind port.
    pub apiserver_port: u16,
    /// Cluster DNS domain, used when the kubeadm config carries none.
    pub dns_domain: String,
    /// lvscare image run as a static pod on every worker.
    pub lvscare_image: String,
    /// Cap on concurrent per-host operations.
    pub max_parallel: usize,
    /// Bootstrap tokens closer than this to expiry are regenerated.
    #[serde(with = "secs")]
    pub token_refresh_threshold: Duration,
    /// How long to wait for master0's kubeconfig after init.
    #[serde(with = "secs")]
    pub kubeconfig_timeout: Duration,
    /// How long an upgrade waits for the API server and for uncordon.
    #[serde(with = "secs")]
    pub upgrade_timeout: Duration,
    /// Extra kubeadm YAML merged over the built-in and rootfs defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeadm_fragment: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cluster_root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/root"))
                .join(".sealos"),
            local_data_root: PathBuf::from("/var/lib/sealos"),
            remote_data_root: "/var/lib/sealos".to_string(),
            apiserver_domain: "apiserver.cluster.local".to_string(),
            vip: "10.103.97.2".to_string(),
            apiserver_port: DEFAULT_APISERVER_PORT,
            dns_domain: "cluster.local".to_string(),
            lvscare_image: "ghcr.io/labring/lvscare:v4.3.0".to_string(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            token_refresh_threshold: Duration::from_secs(180),
            kubeconfig_timeout: Duration::from_secs(300),
            upgrade_timeout: Duration::from_secs(60),
            kubeadm_fragment: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `SEALOS_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(root) = lookup(ENV_RUNTIME_ROOT).filter(|v| !v.is_empty()) {
            self.cluster_root = PathBuf::from(root);
        }
        if let Some(root) = lookup(ENV_DATA_ROOT).filter(|v| !v.is_empty()) {
            self.local_data_root = PathBuf::from(&root);
            self.remote_data_root = root;
        }
        if let Some(vip) = lookup(ENV_VIP).filter(|v| !v.is_empty()) {
            self.vip = vip;
        }
        if let Some(limit) = lookup(ENV_MAX_PARALLEL).and_then(|v| v.parse().ok()) {
            self.max_parallel = limit;
        }
        self
    }

    /// Use `root` as the local cluster root.
    #[must_use]
    pub fn with_cluster_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cluster_root = root.into();
        self
    }

    /// Use `root` as the local data root.
    #[must_use]
    pub fn with_local_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_data_root = root.into();
        self
    }

    /// Merge `fragment` over the kubeadm defaults.
    #[must_use]
    pub fn with_kubeadm_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.kubeadm_fragment = Some(fragment.into());
        self
    }

    /// Paths for cluster `name`.
    #[must_use]
    pub fn paths(&self, name: &str) -> PathResolver {
        PathResolver::new(
            &self.cluster_root,
            &self.local_data_root,
            &self.remote_data_root,
            name,
        )
    }

    /// `vip:port` of the control-plane load balancer.
    #[must_use]
    pub fn vip_endpoint(&self) -> String {
        crate::hosts::join_host_port(&self.vip, self.apiserver_port)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Every local and remote path derived from a cluster name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    cluster_dir: PathBuf,
    data_dir: PathBuf,
    remote_cluster_dir: String,
}

impl PathResolver {
    /// Paths for `name` under the given roots.
    #[must_use]
    pub fn new(root: &Path, data_root: &Path, remote_root: &str, name: &str) -> Self {
        Self {
            cluster_dir: root.join(name),
            data_dir: data_root.join("data").join(name),
            remote_cluster_dir: format!("{}/data/{name}", remote_root.trim_end_matches('/')),
        }
    }

    #[must_use]
    pub fn cluster_dir(&self) -> &Path {
        &self.cluster_dir
    }

    /// Local per-cluster data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn clusterfile(&self) -> PathBuf {
        self.cluster_dir.join("Clusterfile")
    }

    #[must_use]
    pub fn manifest(&self) -> PathBuf {
        self.cluster_dir.join("manifest.json")
    }

    #[must_use]
    pub fn etc_dir(&self) -> PathBuf {
        self.cluster_dir.join("etc")
    }

    #[must_use]
    pub fn token_file(&self) -> PathBuf {
        self.etc_dir().join("kubeadm-token.json")
    }

    #[must_use]
    pub fn certificate_key_file(&self) -> PathBuf {
        self.etc_dir().join("certificate-key")
    }

    #[must_use]
    pub fn admin_kubeconfig(&self) -> PathBuf {
        self.etc_dir().join("admin.conf")
    }

    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.cluster_dir.join("config")
    }

    #[must_use]
    pub fn init_config(&self) -> PathBuf {
        self.config_dir().join("kubeadm-init.yaml")
    }

    #[must_use]
    pub fn join_master_config(&self) -> PathBuf {
        self.config_dir().join("kubeadm-join-master.yaml")
    }

    #[must_use]
    pub fn join_node_config(&self) -> PathBuf {
        self.config_dir().join("kubeadm-join-node.yaml")
    }

    #[must_use]
    pub fn update_config(&self) -> PathBuf {
        self.config_dir().join("kubeadm-update.yaml")
    }

    #[must_use]
    pub fn upgrade_config(&self) -> PathBuf {
        self.config_dir().join("kubeadm-upgrade.yaml")
    }

    /// Scratch space for per-host files.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.cluster_dir.join("tmp")
    }

    /// Remote per-cluster data directory.
    #[must_use]
    pub fn remote_data_dir(&self) -> &str {
        &self.remote_cluster_dir
    }

    /// Remote directory the rootfs image is copied to.
    #[must_use]
    pub fn remote_rootfs(&self) -> String {
        format!("{}/rootfs", self.remote_cluster_dir)
    }

    /// Remote working directory of an application image.
    #[must_use]
    pub fn remote_app_workdir(&self, mount_name: &str) -> String {
        format!("{}/applications/{mount_name}/workdir", self.remote_cluster_dir)
    }

    /// Remote location of a kubeadm config file named like `local`.
    #[must_use]
    pub fn remote_config(&self, local: &Path) -> String {
        let file = local
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/etc/{file}", self.remote_cluster_dir)
    }
}
