//! The `sealctl` command vocabulary run on cluster hosts.

use std::sync::Arc;

use crate::error::{ClusterError, Result};
use crate::kubeadm::token::BootstrapToken;

use super::RemoteExecutor;

/// Static pod manifest name of the worker-side load balancer.
pub const LVSCARE_STATIC_POD: &str = "kube-sealos-lvscare.yaml";

/// Inputs of `sealctl cert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRequest {
    pub alt_names: Vec<String>,
    pub node_ip: String,
    pub node_name: String,
    pub service_cidr: String,
    pub dns_domain: String,
}

/// Typed wrapper over the `sealctl` CLI installed by the rootfs.
#[derive(Clone)]
pub struct Sealctl {
    exec: Arc<dyn RemoteExecutor>,
}

impl Sealctl {
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExecutor>) -> Self {
        Self { exec }
    }

    async fn run(&self, host: &str, command: String) -> Result<String> {
        Ok(self.exec.cmd(host, &command).await?.trim().to_string())
    }

    async fn non_empty(&self, host: &str, command: String) -> Result<String> {
        let out = self.run(host, command.clone()).await?;
        if out.is_empty() {
            return Err(ClusterError::remote(host, &command, "empty output"));
        }
        Ok(out)
    }

    /// Node name as kubelet registers it.
    pub async fn hostname(&self, host: &str) -> Result<String> {
        self.non_empty(host, "sealctl hostname".into()).await
    }

    /// CRI endpoint path, e.g. `/run/containerd/containerd.sock`.
    pub async fn cri_socket(&self, host: &str) -> Result<String> {
        self.non_empty(host, "sealctl cri socket".into()).await
    }

    /// `systemd` or `cgroupfs`.
    pub async fn cgroup_driver(&self, host: &str) -> Result<String> {
        self.non_empty(host, "sealctl cri cgroup-driver --short".into())
            .await
    }

    /// Create a bootstrap token using the kubeadm config at `config_path`.
    pub async fn token(
        &self,
        host: &str,
        config_path: &str,
        certificate_key: &str,
    ) -> Result<BootstrapToken> {
        let command = format!("sealctl token {config_path} {certificate_key}");
        let out = self.non_empty(host, command.clone()).await?;
        BootstrapToken::parse(&out)
            .map_err(|e| ClusterError::remote(host, &command, format!("unparseable token: {e}")))
    }

    /// Generate control-plane certificates.
    pub async fn cert(&self, host: &str, request: &CertRequest) -> Result<()> {
        let command = format!(
            "sealctl cert --alt-names {} --node-ip {} --node-name {} --service-cidr {} --dns-domain {}",
            request.alt_names.join(","),
            request.node_ip,
            request.node_name,
            request.service_cidr,
            request.dns_domain
        );
        self.run(host, command).await.map(drop)
    }

    /// Point `domain` at `ip` in the host's `/etc/hosts`.
    pub async fn hosts_add(&self, host: &str, ip: &str, domain: &str) -> Result<()> {
        self.run(host, format!("sealctl hosts add --ip {ip} --domain {domain}"))
            .await
            .map(drop)
    }

    /// Remove `domain` from the host's `/etc/hosts`.
    pub async fn hosts_delete(&self, host: &str, domain: &str) -> Result<()> {
        self.run(host, format!("sealctl hosts delete --domain {domain}"))
            .await
            .map(drop)
    }

    /// Write or refresh the lvscare static pod with the given real servers.
    pub async fn lvscare(
        &self,
        host: &str,
        vip_endpoint: &str,
        image: &str,
        masters: &[String],
    ) -> Result<()> {
        self.run(
            host,
            format!(
                "sealctl static-pod lvscare --name {LVSCARE_STATIC_POD} --vip {vip_endpoint} --image {image} --masters {}",
                masters.join(",")
            ),
        )
        .await
        .map(drop)
    }
}
