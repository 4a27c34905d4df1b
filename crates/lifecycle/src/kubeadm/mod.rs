//! kubeadm configuration documents.
//!
//! The five kubeadm documents are kept as untyped YAML mappings so that
//! fields this crate never touches pass through to kubeadm unchanged.
//! Layers are combined with [`merge_value`]: mappings merge recursively,
//! sequences gain the items they lack, and non-empty scalars override.

pub mod token;
pub mod version;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::Result;
use version::{filter_feature_gate_string, KubeVersion};

const KUBELET_API_VERSION: &str = "kubelet.config.k8s.io/v1beta1";
const KUBE_PROXY_API_VERSION: &str = "kubeproxy.config.k8s.io/v1alpha1";

/// Built-in defaults, the lowest merge layer.
pub const DEFAULT_KUBEADM_CONFIG: &str = r"apiVersion: kubeadm.k8s.io/v1beta3
kind: InitConfiguration
localAPIEndpoint:
  bindPort: 6443
nodeRegistration:
  kubeletExtraArgs: {}
---
apiVersion: kubeadm.k8s.io/v1beta3
kind: ClusterConfiguration
imageRepository: sealos.hub:5000
networking:
  dnsDomain: cluster.local
  podSubnet: 100.64.0.0/10
  serviceSubnet: 10.96.0.0/22
apiServer:
  certSANs:
    - 127.0.0.1
    - apiserver.cluster.local
  extraArgs:
    audit-log-maxage: '7'
    audit-log-maxbackup: '10'
    audit-log-maxsize: '100'
controllerManager:
  extraArgs:
    bind-address: 0.0.0.0
    cluster-signing-duration: 876000h
scheduler:
  extraArgs:
    bind-address: 0.0.0.0
etcd:
  local:
    dataDir: /var/lib/etcd
    extraArgs:
      listen-metrics-urls: http://0.0.0.0:2381
---
apiVersion: kubeadm.k8s.io/v1beta3
kind: JoinConfiguration
caCertPath: /etc/kubernetes/pki/ca.crt
discovery:
  timeout: 5m0s
controlPlane:
  localAPIEndpoint:
    bindPort: 6443
---
apiVersion: kubeproxy.config.k8s.io/v1alpha1
kind: KubeProxyConfiguration
mode: ipvs
ipvs:
  excludeCIDRs:
    - 10.103.97.2/32
---
apiVersion: kubelet.config.k8s.io/v1beta1
kind: KubeletConfiguration
authentication:
  webhook:
    enabled: true
authorization:
  mode: Webhook
healthzBindAddress: 0.0.0.0
rotateCertificates: true
";

/// One of the five kubeadm documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Document {
    Init,
    Cluster,
    Join,
    KubeProxy,
    Kubelet,
}

impl Document {
    /// The `kind` this document is rendered with.
    #[must_use]
    pub fn kind(self) -> &'static str {
        match self {
            Self::Init => "InitConfiguration",
            Self::Cluster => "ClusterConfiguration",
            Self::Join => "JoinConfiguration",
            Self::KubeProxy => "KubeProxyConfiguration",
            Self::Kubelet => "KubeletConfiguration",
        }
    }

    fn from_kind(kind: &str) -> Option<Self> {
        [
            Self::Init,
            Self::Cluster,
            Self::Join,
            Self::KubeProxy,
            Self::Kubelet,
        ]
        .into_iter()
        .find(|d| d.kind() == kind)
    }

    fn api_version(self, version: &KubeVersion) -> &'static str {
        match self {
            Self::Init | Self::Cluster | Self::Join => version.kubeadm_api_version(),
            Self::KubeProxy => KUBE_PROXY_API_VERSION,
            Self::Kubelet => KUBELET_API_VERSION,
        }
    }

    /// Paths holding `extraArgs`-style flag maps.
    fn arg_paths(self) -> &'static [&'static [&'static str]] {
        match self {
            Self::Cluster => &[
                &["apiServer", "extraArgs"],
                &["controllerManager", "extraArgs"],
                &["scheduler", "extraArgs"],
                &["etcd", "local", "extraArgs"],
            ],
            Self::Init | Self::Join => &[&["nodeRegistration", "kubeletExtraArgs"]],
            Self::KubeProxy | Self::Kubelet => &[],
        }
    }
}

/// The control-plane flag maps that may carry `feature-gates`.
const CONTROL_PLANE_ARGS: [[&str; 2]; 3] = [
    ["controllerManager", "extraArgs"],
    ["apiServer", "extraArgs"],
    ["scheduler", "extraArgs"],
];

/// All five kubeadm documents, without `apiVersion`/`kind`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KubeadmConfig {
    init: Mapping,
    cluster: Mapping,
    join: Mapping,
    kube_proxy: Mapping,
    kubelet: Mapping,
}

impl KubeadmConfig {
    /// The built-in defaults.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the embedded YAML is static.
    pub fn defaults() -> Result<Self> {
        Self::parse(DEFAULT_KUBEADM_CONFIG)
    }

    /// Parse a multi-document YAML stream. Unknown kinds are skipped and
    /// `extraArgs` lists are normalized to maps.
    ///
    /// # Errors
    ///
    /// Returns an error when the stream is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self> {
        let mut config = Self::default();
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            let Value::Mapping(mut map) = Value::deserialize(doc)? else {
                continue;
            };
            let kind = map.get("kind").and_then(Value::as_str).unwrap_or_default();
            let Some(document) = Document::from_kind(kind) else {
                debug!(kind, "skipping non-kubeadm document");
                continue;
            };
            map.remove("apiVersion");
            map.remove("kind");
            for path in document.arg_paths() {
                normalize_args(&mut map, path);
            }
            merge_mapping(config.doc_mut(document), &map);
        }
        Ok(config)
    }

    #[must_use]
    pub fn doc(&self, document: Document) -> &Mapping {
        match document {
            Document::Init => &self.init,
            Document::Cluster => &self.cluster,
            Document::Join => &self.join,
            Document::KubeProxy => &self.kube_proxy,
            Document::Kubelet => &self.kubelet,
        }
    }

    pub fn doc_mut(&mut self, document: Document) -> &mut Mapping {
        match document {
            Document::Init => &mut self.init,
            Document::Cluster => &mut self.cluster,
            Document::Join => &mut self.join,
            Document::KubeProxy => &mut self.kube_proxy,
            Document::Kubelet => &mut self.kubelet,
        }
    }

    /// Merge `layer` on top of `self`.
    ///
    /// When `layer` configures etcd, the other etcd mode is dropped first:
    /// `external` and `local` are mutually exclusive.
    pub fn merge(&mut self, layer: &KubeadmConfig) {
        if get_path(&layer.cluster, &["etcd", "external"]).is_some_and(|v| !is_empty(v)) {
            remove_path(&mut self.cluster, &["etcd", "local"]);
        } else if get_path(&layer.cluster, &["etcd", "local"]).is_some_and(|v| !is_empty(v)) {
            remove_path(&mut self.cluster, &["etcd", "external"]);
        }
        for document in [
            Document::Init,
            Document::Cluster,
            Document::Join,
            Document::KubeProxy,
            Document::Kubelet,
        ] {
            merge_mapping(self.doc_mut(document), layer.doc(document));
        }
    }

    #[must_use]
    pub fn get(&self, document: Document, path: &[&str]) -> Option<&Value> {
        get_path(self.doc(document), path)
    }

    /// String at `path`, `None` when absent or empty.
    #[must_use]
    pub fn get_str(&self, document: Document, path: &[&str]) -> Option<&str> {
        self.get(document, path)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Strings of the sequence at `path`.
    #[must_use]
    pub fn get_strings(&self, document: Document, path: &[&str]) -> Vec<String> {
        self.get(document, path)
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set `path`, creating intermediate mappings.
    pub fn set(&mut self, document: Document, path: &[&str], value: impl Into<Value>) {
        set_path(self.doc_mut(document), path, value.into());
    }

    /// Set `path` only when it is absent or empty.
    pub fn set_if_empty(&mut self, document: Document, path: &[&str], value: impl Into<Value>) {
        if self.get(document, path).map_or(true, is_empty) {
            self.set(document, path, value);
        }
    }

    pub fn remove(&mut self, document: Document, path: &[&str]) -> Option<Value> {
        remove_path(self.doc_mut(document), path)
    }

    /// Replace a string sequence.
    pub fn set_strings(&mut self, document: Document, path: &[&str], items: Vec<String>) {
        let seq = items.into_iter().map(Value::String).collect::<Vec<_>>();
        self.set(document, path, Value::Sequence(seq));
    }

    /// Drop feature gates that `version` does not know and rename
    /// flags that older control planes expect under another name.
    pub fn finalize_feature_gates(&mut self, version: &KubeVersion) {
        if *version < KubeVersion::new(1, 19, 0) {
            let args = ["controllerManager", "extraArgs"];
            remove_path(&mut self.cluster, &[args[0], args[1], "cluster-signing-duration"]);
            set_path(
                &mut self.cluster,
                &[args[0], args[1], "experimental-cluster-signing-duration"],
                Value::from("87600h"),
            );
        }
        for [component, args] in CONTROL_PLANE_ARGS {
            let path = [component, args, "feature-gates"];
            let filtered = match get_path(&self.cluster, &path).and_then(Value::as_str) {
                Some(gates) if !gates.is_empty() => filter_feature_gate_string(gates, version),
                _ => continue,
            };
            set_path(&mut self.cluster, &path, Value::String(filtered));
        }
        if let Some(Value::Mapping(gates)) = self.kubelet.get_mut("featureGates") {
            gates.retain(|name, _| !name.as_str().is_some_and(|n| version.drops_feature_gate(n)));
        }
    }

    /// Render `documents` as one YAML stream for `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render(&self, documents: &[Document], version: &KubeVersion) -> Result<String> {
        let mut rendered = Vec::with_capacity(documents.len());
        for document in documents {
            let mut body = self.doc(*document).clone();
            if version.uses_arg_lists() {
                for path in document.arg_paths() {
                    args_to_list(&mut body, path);
                }
            }
            let mut out = Mapping::new();
            out.insert("apiVersion".into(), document.api_version(version).into());
            out.insert("kind".into(), document.kind().into());
            for (key, value) in body {
                out.insert(key, value);
            }
            rendered.push(serde_yaml::to_string(&Value::Mapping(out))?);
        }
        Ok(rendered.join("---\n"))
    }
}

/// Merge `src` into `dst`.
pub fn merge_value(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Mapping(dst), Value::Mapping(src)) => merge_mapping(dst, src),
        (Value::Sequence(dst), Value::Sequence(src)) => {
            for item in src {
                if !dst.contains(item) {
                    dst.push(item.clone());
                }
            }
        }
        (dst, src) => {
            if !is_empty(src) {
                *dst = src.clone();
            }
        }
    }
}

fn merge_mapping(dst: &mut Mapping, src: &Mapping) {
    for (key, value) in src {
        match dst.get_mut(key) {
            Some(existing) => merge_value(existing, value),
            None if !is_empty(value) => {
                dst.insert(key.clone(), value.clone());
            }
            None => {}
        }
    }
}

/// Null, empty strings and empty collections never override.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Sequence(s) => s.is_empty(),
        Value::Mapping(m) => m.is_empty(),
        _ => false,
    }
}

fn get_path<'a>(map: &'a Mapping, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let value = map.get(*first)?;
    if rest.is_empty() {
        Some(value)
    } else {
        get_path(value.as_mapping()?, rest)
    }
}

fn set_path(map: &mut Mapping, path: &[&str], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert(Value::from(*first), value);
        return;
    }
    if !map.get(*first).is_some_and(Value::is_mapping) {
        map.insert(Value::from(*first), Value::Mapping(Mapping::new()));
    }
    if let Some(Value::Mapping(inner)) = map.get_mut(*first) {
        set_path(inner, rest, value);
    }
}

fn remove_path(map: &mut Mapping, path: &[&str]) -> Option<Value> {
    let (first, rest) = path.split_first()?;
    if rest.is_empty() {
        return map.remove(*first);
    }
    match map.get_mut(*first) {
        Some(Value::Mapping(inner)) => remove_path(inner, rest),
        _ => None,
    }
}

/// `[{name, value}]` lists become `{name: value}` maps.
fn normalize_args(map: &mut Mapping, path: &[&str]) {
    let Some(Value::Sequence(items)) = get_path(map, path) else {
        return;
    };
    let mut args = Mapping::new();
    for item in items {
        if let Some(name) = item.get("name").cloned() {
            args.insert(name, item.get("value").cloned().unwrap_or(Value::Null));
        }
    }
    set_path(map, path, Value::Mapping(args));
}

fn args_to_list(map: &mut Mapping, path: &[&str]) {
    let Some(Value::Mapping(args)) = get_path(map, path) else {
        return;
    };
    let list = args
        .iter()
        .map(|(name, value)| {
            let mut arg = Mapping::new();
            arg.insert("name".into(), name.clone());
            arg.insert("value".into(), value.clone());
            Value::Mapping(arg)
        })
        .collect();
    set_path(map, path, Value::Sequence(list));
}
