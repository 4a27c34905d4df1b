//! Kubernetes versions and the kubeadm rules keyed on them.

use std::fmt;
use std::str::FromStr;

use crate::error::ClusterError;

/// kubeadm API group/version for Kubernetes 1.22 through 1.30.
pub const KUBEADM_V1BETA3: &str = "kubeadm.k8s.io/v1beta3";
/// kubeadm API group/version for Kubernetes 1.31 and later.
pub const KUBEADM_V1BETA4: &str = "kubeadm.k8s.io/v1beta4";

/// A `vMAJOR.MINOR.PATCH` Kubernetes version. Pre-release suffixes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KubeVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl KubeVersion {
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// kubeadm API version to render documents with.
    #[must_use]
    pub fn kubeadm_api_version(&self) -> &'static str {
        if *self >= Self::new(1, 31, 0) {
            KUBEADM_V1BETA4
        } else {
            KUBEADM_V1BETA3
        }
    }

    /// Whether `extraArgs` are rendered as `[{name, value}]` lists.
    #[must_use]
    pub fn uses_arg_lists(&self) -> bool {
        self.kubeadm_api_version() == KUBEADM_V1BETA4
    }

    /// Whether the feature gate `name` must be dropped for this version.
    #[must_use]
    pub fn drops_feature_gate(&self, name: &str) -> bool {
        FEATURE_GATE_RULES.iter().any(|(gate, rule)| {
            *gate == name
                && match rule {
                    GateRule::Below(v) => self < v,
                    GateRule::AtLeast(v) => self >= v,
                }
        })
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for KubeVersion {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClusterError::PreProcess(format!("invalid kubernetes version {s:?}"));
        let core = s.trim().trim_start_matches('v');
        let core = core.split(['-', '+']).next().unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = |required: bool| -> Result<u64, ClusterError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };
        let version = Self::new(next(true)?, next(true)?, next(false)?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

enum GateRule {
    Below(KubeVersion),
    AtLeast(KubeVersion),
}

const FEATURE_GATE_RULES: &[(&str, GateRule)] = &[
    ("CSIStorageCapacity", GateRule::Below(KubeVersion::new(1, 21, 0))),
    ("TTLAfterFinished", GateRule::AtLeast(KubeVersion::new(1, 24, 0))),
    ("EphemeralContainers", GateRule::AtLeast(KubeVersion::new(1, 26, 0))),
];

/// Drop gates unknown to `version` from a `A=true,B=false` string.
#[must_use]
pub fn filter_feature_gate_string(gates: &str, version: &KubeVersion) -> String {
    gates
        .split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .filter(|g| {
            let name = g.split_once('=').map_or(*g, |(k, _)| k).trim();
            !version.drops_feature_gate(name)
        })
        .collect::<Vec<_>>()
        .join(",")
}
