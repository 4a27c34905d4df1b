//! Cluster document types.
//!
//! A `Cluster` is the declarative description of hosts, images and SSH
//! credentials, plus the status recorded after every apply attempt.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::hosts::{self, DEFAULT_SSH_PORT};

/// API version written into every cluster document.
pub const CLUSTER_API_VERSION: &str = "apps.sealos.io/v1beta1";
/// Kind of the cluster document.
pub const CLUSTER_KIND: &str = "Cluster";

/// Control-plane role marker.
pub const MASTER: &str = "master";
/// Worker role marker.
pub const NODE: &str = "node";

/// Condition type upserted after every apply.
pub const CONDITION_APPLY: &str = "ApplyClusterSuccess";

/// Cluster document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// API version, always [`CLUSTER_API_VERSION`].
    pub api_version: String,
    /// Kind, always [`CLUSTER_KIND`].
    pub kind: String,
    /// Identity and timestamps.
    pub metadata: ObjectMeta,
    /// Desired topology.
    pub spec: ClusterSpec,
    /// Last observed status.
    #[serde(default)]
    pub status: ClusterStatus,
}

/// Identity of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Cluster name, used as the key of the local store.
    pub name: String,
    /// Set once the first create pipeline succeeds. `None` means never created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when a teardown starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Free-form annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Desired cluster topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Host groups, in order. The first master address is master0.
    #[serde(default)]
    pub hosts: Vec<Host>,
    /// Image references; the rootfs image is normally first.
    #[serde(default)]
    pub image: Vec<String>,
    /// Default SSH credentials.
    #[serde(default)]
    pub ssh: Ssh,
    /// Cluster-wide environment (`KEY=VALUE`) for guest commands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Overrides the `cmd` of the last image's guest commands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

/// A group of hosts sharing roles and credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    /// `ip:port` addresses.
    #[serde(default)]
    pub ips: Vec<String>,
    /// Role and architecture tags, e.g. `["master", "amd64"]`.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Per-group SSH override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<Ssh>,
    /// Per-group environment (`KEY=VALUE`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

/// SSH credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ssh {
    /// Login user.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passwd: Option<String>,
    /// Private key path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk: Option<String>,
    /// Inline private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_data: Option<String>,
    /// Private key passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_passwd: Option<String>,
    /// SSH port used when an address carries none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Ssh {
    /// Fill unset fields from `defaults`.
    #[must_use]
    pub fn overlay(&self, defaults: &Ssh) -> Ssh {
        Ssh {
            user: if self.user.is_empty() {
                defaults.user.clone()
            } else {
                self.user.clone()
            },
            passwd: self.passwd.clone().or_else(|| defaults.passwd.clone()),
            pk: self.pk.clone().or_else(|| defaults.pk.clone()),
            pk_data: self.pk_data.clone().or_else(|| defaults.pk_data.clone()),
            pk_passwd: self.pk_passwd.clone().or_else(|| defaults.pk_passwd.clone()),
            port: self.port.or(defaults.port),
        }
    }
}

/// Apply phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPhase {
    /// An apply is running.
    InProcess,
    /// The last apply succeeded.
    Success,
    /// The last apply failed.
    Failed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess => write!(f, "InProcess"),
            Self::Success => write!(f, "Success"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

/// A status condition, de-duplicated by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_heartbeat_time: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Image flavour, taken from the image type label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    /// Carries Kubernetes binaries and config templates.
    Rootfs,
    /// Applications installed on top of a running cluster.
    #[default]
    Application,
    /// Patches overlaid onto the rootfs.
    Patch,
}

/// A mounted image, recorded in the cluster status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountImage {
    /// Working container name.
    pub name: String,
    /// Image reference.
    pub image_name: String,
    /// Local mount point of the working container.
    #[serde(default)]
    pub mount_point: String,
    /// Image flavour.
    #[serde(rename = "type", default)]
    pub type_: ImageType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
}

/// Recorded status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountImage>,
}

impl Cluster {
    /// Create an empty cluster document named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: CLUSTER_API_VERSION.to_string(),
            kind: CLUSTER_KIND.to_string(),
            metadata: ObjectMeta {
                name: name.into(),
                ..ObjectMeta::default()
            },
            spec: ClusterSpec::default(),
            status: ClusterStatus::default(),
        }
    }

    /// Cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Whether the first create pipeline has completed.
    #[must_use]
    pub fn is_created(&self) -> bool {
        self.metadata.creation_timestamp.is_some()
    }

    /// Default SSH port for addresses that carry none.
    #[must_use]
    pub fn default_port(&self) -> u16 {
        self.spec.ssh.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    fn group_port(&self, host: &Host) -> u16 {
        host.ssh
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or_else(|| self.default_port())
    }

    /// Normalized, de-duplicated `ip:port` addresses carrying `role`.
    #[must_use]
    pub fn ips_by_role(&self, role: &str) -> Vec<String> {
        hosts::dedup(
            self.spec
                .hosts
                .iter()
                .filter(|h| h.roles.iter().any(|r| r == role))
                .flat_map(|h| {
                    let port = self.group_port(h);
                    h.ips.iter().map(move |ip| hosts::normalize(ip, port))
                }),
        )
    }

    /// Master addresses; the first is master0.
    #[must_use]
    pub fn master_ips(&self) -> Vec<String> {
        self.ips_by_role(MASTER)
    }

    /// Worker addresses.
    #[must_use]
    pub fn node_ips(&self) -> Vec<String> {
        self.ips_by_role(NODE)
    }

    /// Every address, masters first.
    #[must_use]
    pub fn all_ips(&self) -> Vec<String> {
        hosts::dedup(self.master_ips().into_iter().chain(self.node_ips()))
    }

    /// master0 as `ip:port`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Validation`] when the cluster has no master.
    pub fn master0(&self) -> Result<String> {
        self.master_ips().into_iter().next().ok_or_else(|| {
            ClusterError::Validation(format!("cluster {} has no master host", self.name()))
        })
    }

    /// The host group that contains `addr`.
    #[must_use]
    pub fn group_of(&self, addr: &str) -> Option<&Host> {
        self.spec.hosts.iter().find(|h| {
            let port = self.group_port(h);
            h.ips.iter().any(|ip| hosts::normalize(ip, port) == addr)
        })
    }

    /// Effective SSH credentials for `addr`.
    #[must_use]
    pub fn ssh_for(&self, addr: &str) -> Ssh {
        self.group_of(addr)
            .and_then(|h| h.ssh.as_ref())
            .map_or_else(|| self.spec.ssh.clone(), |s| s.overlay(&self.spec.ssh))
    }

    /// Environment for `addr`: cluster env overlaid by its group env.
    #[must_use]
    pub fn env_for(&self, addr: &str) -> BTreeMap<String, String> {
        let mut env = parse_env(&self.spec.env);
        if let Some(group) = self.group_of(addr) {
            env.extend(parse_env(&group.env));
        }
        env
    }

    /// The rootfs image mount, if images have been mounted.
    #[must_use]
    pub fn rootfs_mount(&self) -> Option<&MountImage> {
        self.status
            .mounts
            .iter()
            .find(|m| m.type_ == ImageType::Rootfs)
    }

    /// Swap the rootfs image in `spec.image` for `image`.
    ///
    /// The rootfs is the image recorded with a rootfs mount, else the first
    /// image.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Validation`] when the cluster has no image.
    pub fn replace_rootfs_image(&mut self, image: &str) -> Result<()> {
        if self.spec.image.is_empty() {
            return Err(ClusterError::Validation(format!(
                "cluster {} has no images",
                self.name()
            )));
        }
        let index = self
            .rootfs_mount()
            .and_then(|m| self.spec.image.iter().position(|i| *i == m.image_name))
            .unwrap_or(0);
        self.spec.image[index] = image.to_string();
        Ok(())
    }

    /// Insert or replace the condition of the same type.
    pub fn set_condition(&mut self, condition: ClusterCondition) {
        if let Some(existing) = self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            *existing = condition;
        } else {
            self.status.conditions.push(condition);
        }
    }

    /// Remove `addrs` from every host group, dropping groups left empty.
    pub fn remove_hosts(&mut self, addrs: &[String]) {
        let default_port = self.default_port();
        for group in &mut self.spec.hosts {
            let port = group
                .ssh
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default_port);
            group
                .ips
                .retain(|ip| !addrs.contains(&hosts::normalize(ip, port)));
        }
        self.spec.hosts.retain(|h| !h.ips.is_empty());
    }
}

/// Parse `KEY=VALUE` entries; entries without `=` map to an empty value.
#[must_use]
pub fn parse_env(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter(|e| !e.trim().is_empty())
        .map(|e| match e.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.to_string()),
            None => (e.trim().to_string(), String::new()),
        })
        .collect()
}
