//! kubeadm bootstrap state shared by every node operation.
//!
//! [`BootstrapState`] owns the merged kubeadm configuration and the join
//! material. It performs no I/O: node facts, rootfs defaults and tokens are
//! fetched by the runtime and handed in, so the state can sit behind a
//! mutex that is held only while it is mutated and snapshotted.

use crate::config::RuntimeConfig;
use crate::error::{ClusterError, Result};
use crate::hosts;
use crate::kubeadm::token::BootstrapToken;
use crate::kubeadm::version::KubeVersion;
use crate::kubeadm::{Document, KubeadmConfig};

/// Endpoint of the image-pull CRI shim every kubelet is pointed at.
pub const IMAGE_CRI_SHIM_SOCKET: &str = "/var/run/image-cri-shim.sock";

const INIT_DOCUMENTS: &[Document] = &[
    Document::Init,
    Document::Cluster,
    Document::Kubelet,
    Document::KubeProxy,
];
const JOIN_MASTER_DOCUMENTS: &[Document] = &[Document::Join, Document::Kubelet];
const JOIN_NODE_DOCUMENTS: &[Document] = &[Document::Kubelet, Document::Join];
const UPDATE_DOCUMENTS: &[Document] = &[Document::Cluster];
const UPGRADE_DOCUMENTS: &[Document] = &[Document::Init, Document::Cluster];

/// Container runtime facts discovered on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFacts {
    pub cri_socket: String,
    pub cgroup_driver: String,
}

/// A hook run by [`BootstrapState::complete_kubeadm_config`] after merging.
pub type CompletionHook = Box<dyn FnOnce(&mut BootstrapState) -> Result<()> + Send>;

/// A rendered-on-demand copy of the configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    config: KubeadmConfig,
    version: KubeVersion,
    documents: &'static [Document],
}

impl ConfigSnapshot {
    /// Render the snapshot's documents.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render(&self) -> Result<String> {
        self.config.render(self.documents, &self.version)
    }

    #[must_use]
    pub fn config(&self) -> &KubeadmConfig {
        &self.config
    }
}

/// kubeadm configuration plus join material for one cluster.
#[derive(Debug, Clone)]
pub struct BootstrapState {
    version: KubeVersion,
    settings: RuntimeConfig,
    user: Option<KubeadmConfig>,
    config: KubeadmConfig,
    masters: Vec<String>,
    host_count: usize,
    token: Option<BootstrapToken>,
}

impl BootstrapState {
    /// State for a cluster running `version`.
    ///
    /// `user` holds kubeadm documents supplied alongside the cluster; the
    /// fragment in `settings` is layered on top of them.
    ///
    /// # Errors
    ///
    /// Returns an error when the user documents are not valid YAML.
    pub fn new(version: KubeVersion, settings: RuntimeConfig, user: Option<&str>) -> Result<Self> {
        let mut layers: Option<KubeadmConfig> = None;
        for raw in [user, settings.kubeadm_fragment.as_deref()].into_iter().flatten() {
            let parsed = KubeadmConfig::parse(raw)?;
            match layers.as_mut() {
                Some(existing) => existing.merge(&parsed),
                None => layers = Some(parsed),
            }
        }
        Ok(Self {
            version,
            settings,
            user: layers,
            config: KubeadmConfig::default(),
            masters: Vec::new(),
            host_count: 0,
            token: None,
        })
    }

    #[must_use]
    pub fn version(&self) -> KubeVersion {
        self.version
    }

    #[must_use]
    pub fn config(&self) -> &KubeadmConfig {
        &self.config
    }

    #[must_use]
    pub fn token(&self) -> Option<&BootstrapToken> {
        self.token.as_ref()
    }

    /// Record the current topology. Masters are `ip:port`; master0 first.
    pub fn set_topology(&mut self, masters: Vec<String>, host_count: usize) {
        self.masters = masters;
        self.host_count = host_count;
    }

    #[must_use]
    pub fn masters(&self) -> &[String] {
        &self.masters
    }

    /// master0 as `ip:port`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Validation`] before a topology is set.
    pub fn master0(&self) -> Result<&str> {
        self.masters
            .first()
            .map(String::as_str)
            .ok_or_else(|| ClusterError::Validation("no master in bootstrap topology".into()))
    }

    fn master0_ip(&self) -> Result<String> {
        self.master0().map(|m| hosts::host_ip(m).to_string())
    }

    /// Whether the control-plane fields have been completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.config
            .get_str(Document::Cluster, &["controlPlaneEndpoint"])
            .is_some()
    }

    /// API server port from the merged config, else the configured default.
    #[must_use]
    pub fn api_port(&self) -> u16 {
        self.config
            .get(Document::Init, &["localAPIEndpoint", "bindPort"])
            .and_then(serde_yaml::Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .unwrap_or(self.settings.apiserver_port)
    }

    #[must_use]
    pub fn service_cidr(&self) -> String {
        self.config
            .get_str(Document::Cluster, &["networking", "serviceSubnet"])
            .unwrap_or_default()
            .to_string()
    }

    #[must_use]
    pub fn dns_domain(&self) -> String {
        self.config
            .get_str(Document::Cluster, &["networking", "dnsDomain"])
            .unwrap_or(&self.settings.dns_domain)
            .to_string()
    }

    #[must_use]
    pub fn cert_sans(&self) -> Vec<String> {
        self.config
            .get_strings(Document::Cluster, &["apiServer", "certSANs"])
    }

    fn user_sets(&self, document: Document, path: &[&str]) -> bool {
        self.user
            .as_ref()
            .is_some_and(|u| u.get_str(document, path).is_some())
    }

    /// Layer built-in defaults, the rootfs default and user documents into
    /// `config`, then pin the version and validate the VIP.
    fn merge_into(&self, config: &mut KubeadmConfig, rootfs_default: Option<&str>) -> Result<()> {
        config.merge(&KubeadmConfig::defaults()?);
        if let Some(raw) = rootfs_default.filter(|r| !r.trim().is_empty()) {
            config.merge(&KubeadmConfig::parse(raw)?);
        }
        if let Some(user) = &self.user {
            config.merge(user);
        }
        config.set(
            Document::Cluster,
            &["kubernetesVersion"],
            self.version.to_string(),
        );
        config.finalize_feature_gates(&self.version);
        validate_vip(config, &self.settings.vip)
    }

    /// Merge every configuration layer into the shared config.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Validation`] when the VIP collides with the pod
    /// or service subnet, or a YAML error for malformed layers.
    pub fn merge_kubeadm_config(&mut self, rootfs_default: Option<&str>) -> Result<()> {
        let mut config = std::mem::take(&mut self.config);
        let merged = self.merge_into(&mut config, rootfs_default);
        self.config = config;
        merged
    }

    /// Merge, run `hooks`, then fix the control-plane fields derived from
    /// the topology.
    ///
    /// # Errors
    ///
    /// Returns the first merge or hook error.
    pub fn complete_kubeadm_config(
        &mut self,
        rootfs_default: Option<&str>,
        hooks: Vec<CompletionHook>,
    ) -> Result<()> {
        self.merge_kubeadm_config(rootfs_default)?;
        for hook in hooks {
            hook(self)?;
        }

        let master0 = self.master0_ip()?;
        let port = self.api_port();
        self.config.set(
            Document::Init,
            &["localAPIEndpoint", "advertiseAddress"],
            master0.clone(),
        );
        self.config.set(
            Document::Init,
            &["nodeRegistration", "kubeletExtraArgs", "node-ip"],
            master0,
        );
        self.config.set(
            Document::Cluster,
            &["controlPlaneEndpoint"],
            hosts::join_host_port(&self.settings.apiserver_domain, port),
        );

        let mut exclude = self
            .config
            .get_strings(Document::KubeProxy, &["ipvs", "excludeCIDRs"]);
        exclude.push(format!("{}/32", self.settings.vip));
        self.config.set_strings(
            Document::KubeProxy,
            &["ipvs", "excludeCIDRs"],
            hosts::dedup(exclude),
        );

        let mut sans = vec![
            "127.0.0.1".to_string(),
            self.settings.apiserver_domain.clone(),
            self.settings.vip.clone(),
        ];
        sans.extend(self.masters.iter().map(|m| hosts::host_ip(m).to_string()));
        sans.extend(self.cert_sans());
        self.config
            .set_strings(Document::Cluster, &["apiServer", "certSANs"], hosts::dedup(sans));

        if self.host_count == 1
            && self
                .config
                .get(Document::Init, &["nodeRegistration", "taints"])
                .is_none()
        {
            self.config.set(
                Document::Init,
                &["nodeRegistration", "taints"],
                serde_yaml::Value::Sequence(Vec::new()),
            );
        }
        Ok(())
    }

    /// Point the config at a node's container runtime.
    pub fn apply_node_facts(&mut self, facts: &NodeFacts) {
        let user = self.user.clone();
        apply_facts(&mut self.config, facts, |d, p| {
            user.as_ref().is_some_and(|u| u.get_str(d, p).is_some())
        });
    }

    /// Use `key` as the init certificate key.
    pub fn set_certificate_key(&mut self, key: &str) {
        self.config
            .set(Document::Init, &["certificateKey"], key.to_string());
    }

    /// Install join material into the join document.
    pub fn set_token(&mut self, token: BootstrapToken) {
        let discovery = ["discovery", "bootstrapToken"];
        self.config.set(
            Document::Join,
            &[discovery[0], discovery[1], "token"],
            token.join_token.clone(),
        );
        self.config.set_strings(
            Document::Join,
            &[discovery[0], discovery[1], "caCertHashes"],
            token.discovery_token_ca_cert_hash.clone(),
        );
        self.config.set(
            Document::Join,
            &["controlPlane", "certificateKey"],
            token.certificate_key.clone(),
        );
        self.token = Some(token);
    }

    /// Mutate the shared config for joining `master` and snapshot it.
    ///
    /// # Errors
    ///
    /// Returns an error when the merge fails or no token has been set.
    pub fn prepare_join_master(
        &mut self,
        master: &str,
        facts: &NodeFacts,
        rootfs_default: Option<&str>,
    ) -> Result<ConfigSnapshot> {
        let token = self.token.clone().ok_or_else(|| {
            ClusterError::Validation("bootstrap token must be set before joining masters".into())
        })?;
        self.merge_kubeadm_config(rootfs_default)?;
        self.apply_node_facts(facts);
        // A node join may have dropped controlPlane from an earlier snapshot.
        self.set_token(token);

        let ip = hosts::host_ip(master).to_string();
        let port = self.api_port();
        self.config.set(
            Document::Join,
            &["controlPlane", "localAPIEndpoint", "advertiseAddress"],
            ip.clone(),
        );
        self.config.set(
            Document::Join,
            &["controlPlane", "localAPIEndpoint", "bindPort"],
            serde_yaml::Value::Number(u64::from(port).into()),
        );
        self.config.set(
            Document::Join,
            &["nodeRegistration", "kubeletExtraArgs", "node-ip"],
            ip,
        );
        self.config.set(
            Document::Join,
            &["discovery", "bootstrapToken", "apiServerEndpoint"],
            hosts::join_host_port(&self.master0_ip()?, port),
        );
        Ok(self.snapshot(JOIN_MASTER_DOCUMENTS))
    }

    /// Join configuration for worker `node`, built on a private copy so the
    /// shared state is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error when the merge fails or no token has been set.
    pub fn join_node_snapshot(
        &self,
        node: &str,
        facts: &NodeFacts,
        rootfs_default: Option<&str>,
    ) -> Result<ConfigSnapshot> {
        let token = self.token.as_ref().ok_or_else(|| {
            ClusterError::Validation("bootstrap token must be set before joining nodes".into())
        })?;
        let mut config = self.config.clone();
        self.merge_into(&mut config, rootfs_default)?;
        apply_facts(&mut config, facts, |d, p| self.user_sets(d, p));

        config.remove(Document::Join, &["controlPlane"]);
        config.set(
            Document::Join,
            &["discovery", "bootstrapToken", "token"],
            token.join_token.clone(),
        );
        config.set_strings(
            Document::Join,
            &["discovery", "bootstrapToken", "caCertHashes"],
            token.discovery_token_ca_cert_hash.clone(),
        );
        config.set(
            Document::Join,
            &["discovery", "bootstrapToken", "apiServerEndpoint"],
            hosts::join_host_port(&self.settings.vip, self.api_port()),
        );
        config.set(
            Document::Join,
            &["nodeRegistration", "kubeletExtraArgs", "node-ip"],
            hosts::host_ip(node).to_string(),
        );
        Ok(ConfigSnapshot {
            config,
            version: self.version,
            documents: JOIN_NODE_DOCUMENTS,
        })
    }

    fn snapshot(&self, documents: &'static [Document]) -> ConfigSnapshot {
        ConfigSnapshot {
            config: self.config.clone(),
            version: self.version,
            documents,
        }
    }

    /// Init + cluster + kubelet + kube-proxy documents.
    #[must_use]
    pub fn init_snapshot(&self) -> ConfigSnapshot {
        self.snapshot(INIT_DOCUMENTS)
    }

    /// The cluster document, for `kubeadm init phase upload-config`.
    #[must_use]
    pub fn update_snapshot(&self) -> ConfigSnapshot {
        self.snapshot(UPDATE_DOCUMENTS)
    }

    /// Init + cluster documents for `kubeadm upgrade apply`. Images come
    /// from the rootfs, so kubelet never pulls them.
    #[must_use]
    pub fn upgrade_snapshot(&self) -> ConfigSnapshot {
        let mut config = self.config.clone();
        config.set(
            Document::Init,
            &["nodeRegistration", "imagePullPolicy"],
            "Never",
        );
        ConfigSnapshot {
            config,
            version: self.version,
            documents: UPGRADE_DOCUMENTS,
        }
    }
}

fn unix_endpoint(socket: &str) -> String {
    if socket.starts_with("unix://") {
        socket.to_string()
    } else {
        format!("unix://{socket}")
    }
}

fn apply_facts(
    config: &mut KubeadmConfig,
    facts: &NodeFacts,
    user_sets: impl Fn(Document, &[&str]) -> bool,
) {
    let endpoint = unix_endpoint(&facts.cri_socket);
    for (document, path) in [
        (Document::Init, &["nodeRegistration", "criSocket"][..]),
        (Document::Join, &["nodeRegistration", "criSocket"][..]),
        (Document::Kubelet, &["containerRuntimeEndpoint"][..]),
    ] {
        if !user_sets(document, path) {
            config.set(document, path, endpoint.clone());
        }
    }
    config.set(
        Document::Kubelet,
        &["imageServiceEndpoint"],
        unix_endpoint(IMAGE_CRI_SHIM_SOCKET),
    );
    for document in [Document::Init, Document::Join] {
        config.set(document, &["nodeRegistration", "imagePullPolicy"], "Never");
    }
    if !facts.cgroup_driver.is_empty() {
        config.set(Document::Kubelet, &["cgroupDriver"], facts.cgroup_driver.clone());
    }
}

fn validate_vip(config: &KubeadmConfig, vip: &str) -> Result<()> {
    for (name, path) in [
        ("podSubnet", ["networking", "podSubnet"]),
        ("serviceSubnet", ["networking", "serviceSubnet"]),
    ] {
        let subnet = config.get_str(Document::Cluster, &path).unwrap_or_default();
        if hosts::cidr_contains(subnet, vip)? {
            return Err(ClusterError::Validation(format!(
                "ensure IP {vip} is not in {name} range {subnet}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn facts(socket: &str) -> NodeFacts {
        NodeFacts {
            cri_socket: socket.into(),
            cgroup_driver: "systemd".into(),
        }
    }

    fn token() -> BootstrapToken {
        BootstrapToken {
            join_token: "abcdef.0123456789abcdef".into(),
            discovery_token_ca_cert_hash: vec!["sha256:aa".into()],
            certificate_key: "ck".into(),
            expires: Utc::now() + chrono::Duration::hours(24),
        }
    }

    fn state(masters: &[&str], host_count: usize) -> BootstrapState {
        let mut s = BootstrapState::new(
            "v1.27.3".parse().unwrap(),
            RuntimeConfig::default(),
            None,
        )
        .unwrap();
        s.set_topology(masters.iter().map(ToString::to_string).collect(), host_count);
        s
    }

    #[test]
    fn test_cert_sans_cover_required_names_once() {
        let mut s = state(&["10.0.0.1:22", "10.0.0.2:22"], 3);
        s.complete_kubeadm_config(None, Vec::new()).unwrap();
        s.complete_kubeadm_config(None, Vec::new()).unwrap();
        let sans = s.cert_sans();
        for required in ["127.0.0.1", "apiserver.cluster.local", "10.103.97.2", "10.0.0.1", "10.0.0.2"] {
            assert_eq!(sans.iter().filter(|s| *s == required).count(), 1, "{required}");
        }
    }

    #[test]
    fn test_complete_sets_control_plane_fields() {
        let mut s = state(&["10.0.0.1:22"], 2);
        let hook: CompletionHook = Box::new(|s: &mut BootstrapState| {
            s.apply_node_facts(&facts("/run/containerd/containerd.sock"));
            s.set_certificate_key("deadbeef");
            Ok(())
        });
        s.complete_kubeadm_config(None, vec![hook]).unwrap();
        let c = s.config();
        assert_eq!(
            c.get_str(Document::Cluster, &["controlPlaneEndpoint"]),
            Some("apiserver.cluster.local:6443")
        );
        assert_eq!(
            c.get_str(Document::Init, &["localAPIEndpoint", "advertiseAddress"]),
            Some("10.0.0.1")
        );
        assert_eq!(
            c.get_str(Document::Init, &["nodeRegistration", "criSocket"]),
            Some("unix:///run/containerd/containerd.sock")
        );
        assert_eq!(c.get_str(Document::Init, &["certificateKey"]), Some("deadbeef"));
        assert_eq!(
            c.get_strings(Document::KubeProxy, &["ipvs", "excludeCIDRs"]),
            vec!["10.103.97.2/32"]
        );
        assert!(c.get(Document::Init, &["nodeRegistration", "taints"]).is_none());
    }

    #[test]
    fn test_single_host_gets_empty_taints() {
        let mut s = state(&["10.0.0.1:22"], 1);
        s.complete_kubeadm_config(None, Vec::new()).unwrap();
        let rendered = s.init_snapshot().render().unwrap();
        assert!(rendered.contains("taints: []"));
    }

    #[test]
    fn test_vip_inside_service_subnet_is_rejected() {
        let mut s = BootstrapState::new(
            "v1.27.3".parse().unwrap(),
            RuntimeConfig {
                vip: "10.96.0.10".into(),
                ..RuntimeConfig::default()
            },
            None,
        )
        .unwrap();
        s.set_topology(vec!["10.0.0.1:22".into()], 1);
        assert!(matches!(
            s.merge_kubeadm_config(None),
            Err(ClusterError::Validation(msg)) if msg.contains("serviceSubnet")
        ));
    }

    #[test]
    fn test_join_master_uses_node_facts_and_master0_endpoint() {
        let mut s = state(&["10.0.0.1:22", "10.0.0.2:22"], 2);
        s.complete_kubeadm_config(None, Vec::new()).unwrap();
        assert!(s
            .prepare_join_master("10.0.0.2:22", &facts("/run/crio/crio.sock"), None)
            .is_err());

        s.set_token(token());
        let snap = s
            .prepare_join_master("10.0.0.2:22", &facts("/run/crio/crio.sock"), None)
            .unwrap();
        let c = snap.config();
        assert_eq!(
            c.get_str(Document::Join, &["discovery", "bootstrapToken", "apiServerEndpoint"]),
            Some("10.0.0.1:6443")
        );
        assert_eq!(
            c.get_str(Document::Join, &["controlPlane", "localAPIEndpoint", "advertiseAddress"]),
            Some("10.0.0.2")
        );
        assert_eq!(
            c.get_str(Document::Join, &["nodeRegistration", "criSocket"]),
            Some("unix:///run/crio/crio.sock")
        );
        assert_eq!(c.get_str(Document::Join, &["controlPlane", "certificateKey"]), Some("ck"));
        let rendered = snap.render().unwrap();
        assert!(rendered.starts_with("apiVersion: kubeadm.k8s.io/v1beta3\nkind: JoinConfiguration"));
    }

    #[test]
    fn test_join_node_drops_control_plane_without_touching_shared_state() {
        let mut s = state(&["10.0.0.1:22"], 2);
        s.complete_kubeadm_config(None, Vec::new()).unwrap();
        s.set_token(token());
        let snap = s
            .join_node_snapshot("10.0.0.3:22", &facts("/run/containerd/containerd.sock"), None)
            .unwrap();
        let c = snap.config();
        assert!(c.get(Document::Join, &["controlPlane"]).is_none());
        assert_eq!(
            c.get_str(Document::Join, &["discovery", "bootstrapToken", "apiServerEndpoint"]),
            Some("10.103.97.2:6443")
        );
        assert_eq!(
            c.get_str(Document::Join, &["nodeRegistration", "kubeletExtraArgs", "node-ip"]),
            Some("10.0.0.3")
        );
        assert!(s.config().get(Document::Join, &["controlPlane"]).is_some());
        assert!(snap.render().unwrap().starts_with("apiVersion: kubelet.config.k8s.io/v1beta1"));
    }

    #[test]
    fn test_user_cri_socket_is_kept() {
        let user = "kind: JoinConfiguration\nnodeRegistration:\n  criSocket: unix:///custom.sock\n";
        let mut s = BootstrapState::new(
            "v1.27.3".parse().unwrap(),
            RuntimeConfig::default(),
            Some(user),
        )
        .unwrap();
        s.set_topology(vec!["10.0.0.1:22".into()], 1);
        s.merge_kubeadm_config(None).unwrap();
        s.apply_node_facts(&facts("/run/containerd/containerd.sock"));
        assert_eq!(
            s.config().get_str(Document::Join, &["nodeRegistration", "criSocket"]),
            Some("unix:///custom.sock")
        );
        assert_eq!(
            s.config().get_str(Document::Init, &["nodeRegistration", "criSocket"]),
            Some("unix:///run/containerd/containerd.sock")
        );
    }

    #[test]
    fn test_upgrade_snapshot_pins_version_and_pull_policy() {
        let mut s = state(&["10.0.0.1:22"], 2);
        s.complete_kubeadm_config(None, Vec::new()).unwrap();
        let snap = s.upgrade_snapshot();
        assert_eq!(
            snap.config()
                .get_str(Document::Init, &["nodeRegistration", "imagePullPolicy"]),
            Some("Never")
        );
        assert!(s
            .config()
            .get(Document::Init, &["nodeRegistration", "imagePullPolicy"])
            .is_none());
        let rendered = snap.render().unwrap();
        assert!(rendered.contains("kind: InitConfiguration"));
        assert!(rendered.contains("kubernetesVersion: v1.27.3"));
        assert!(!rendered.contains("kind: JoinConfiguration"));
    }
}
