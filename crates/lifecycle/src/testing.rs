//! Recording fakes for the remote executor and image service.
//!
//! Used by unit tests and by the integration tests under `tests/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ClusterError, Result};
use crate::hosts;
use crate::image::{ImageInfo, ImageService, IMAGE_TYPE_LABEL, IMAGE_VERSION_LABEL};
use crate::remote::RemoteExecutor;
use crate::types::{Cluster, Host, ImageType, MountImage, MASTER, NODE};

/// Rootfs image used by [`mounted_cluster`] and [`FakeImageService`].
pub const ROOTFS_IMAGE: &str = "labring/kubernetes:v1.27.3";
/// Repository [`FakeImageService`] treats as rootfs; the tag is the version.
pub const ROOTFS_REPOSITORY: &str = "labring/kubernetes";
/// Application image used by [`mounted_cluster`] and [`FakeImageService`].
pub const APP_IMAGE: &str = "labring/calico:v3.24.1";

/// One recorded executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Cmd { host: String, command: String },
    Copy { host: String, src: PathBuf, dst: String },
    Fetch { host: String, src: String, dst: PathBuf },
    Ping { host: String },
}

impl Call {
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::Cmd { host, .. }
            | Self::Copy { host, .. }
            | Self::Fetch { host, .. }
            | Self::Ping { host } => host,
        }
    }
}

/// A [`RemoteExecutor`] that records calls and answers `sealctl` queries
/// with plausible output.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    calls: Mutex<Vec<Call>>,
    responses: Vec<(String, String)>,
    failures: Vec<(String, String)>,
    cancels: Vec<(String, String)>,
    unreachable: Vec<String>,
    tokens: AtomicUsize,
}

impl FakeExecutor {
    /// Answer commands starting with `prefix` with `output`.
    #[must_use]
    pub fn respond(mut self, prefix: &str, output: &str) -> Self {
        self.responses.push((prefix.to_string(), output.to_string()));
        self
    }

    /// Fail commands on `host` starting with `prefix`.
    #[must_use]
    pub fn fail_on(mut self, host: &str, prefix: &str) -> Self {
        self.failures.push((host.to_string(), prefix.to_string()));
        self
    }

    /// Answer commands on `host` starting with `prefix` with
    /// [`ClusterError::Cancelled`], as if the operator declined.
    #[must_use]
    pub fn cancel_on(mut self, host: &str, prefix: &str) -> Self {
        self.cancels.push((host.to_string(), prefix.to_string()));
        self
    }

    /// Fail every call to `host`.
    #[must_use]
    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.push(host.to_string());
        self
    }

    fn record(&self, call: Call) {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(call);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    /// Commands run on `host`, in order.
    #[must_use]
    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Cmd { host: h, command } if h == host => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Copy destinations on `host`, in order.
    #[must_use]
    pub fn copies_to(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Copy { host: h, dst, .. } if h == host => Some(dst),
                _ => None,
            })
            .collect()
    }

    /// Commands on any host starting with `prefix`.
    #[must_use]
    pub fn count_matching(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Cmd { command, .. } if command.starts_with(prefix)))
            .count()
    }

    fn check_reachable(&self, host: &str, what: &str) -> Result<()> {
        if self.unreachable.iter().any(|h| h == host) {
            return Err(ClusterError::remote(host, what, "connection refused"));
        }
        Ok(())
    }

    fn output(&self, host: &str, command: &str) -> Result<String> {
        self.check_reachable(host, command)?;
        let matches = |rules: &[(String, String)]| {
            rules
                .iter()
                .any(|(h, prefix)| h == host && command.starts_with(prefix.as_str()))
        };
        if matches(&self.cancels) {
            return Err(ClusterError::Cancelled);
        }
        if matches(&self.failures) {
            return Err(ClusterError::remote(host, command, "exit status 1"));
        }
        if let Some((_, out)) = self
            .responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            return Ok(out.clone());
        }
        let out = if command.starts_with("sealctl cri socket") {
            "/run/containerd/containerd.sock".to_string()
        } else if command.starts_with("sealctl cri cgroup-driver") {
            "systemd".to_string()
        } else if command.starts_with("sealctl hostname") {
            format!("node-{}", hosts::host_ip(host))
        } else if command.starts_with("sealctl token") {
            let n = self.tokens.fetch_add(1, Ordering::SeqCst);
            serde_json::json!({
                "joinToken": format!("abcdef.{n:016}"),
                "discoveryTokenCaCertHash": ["sha256:0123456789abcdef"],
                "certificateKey": "",
                "expires": Utc::now() + chrono::Duration::hours(24),
            })
            .to_string()
        } else {
            String::new()
        };
        Ok(out)
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn cmd(&self, host: &str, command: &str) -> Result<String> {
        self.record(Call::Cmd {
            host: host.to_string(),
            command: command.to_string(),
        });
        self.output(host, command)
    }

    async fn copy(&self, host: &str, src: &Path, dst: &str) -> Result<()> {
        self.record(Call::Copy {
            host: host.to_string(),
            src: src.to_path_buf(),
            dst: dst.to_string(),
        });
        self.check_reachable(host, "scp")
    }

    async fn fetch(&self, host: &str, src: &str, dst: &Path) -> Result<()> {
        self.record(Call::Fetch {
            host: host.to_string(),
            src: src.to_string(),
            dst: dst.to_path_buf(),
        });
        self.check_reachable(host, "scp")?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dst, format!("# fetched from {host}:{src}\n"))?;
        Ok(())
    }

    async fn ping(&self, host: &str) -> Result<()> {
        self.record(Call::Ping {
            host: host.to_string(),
        });
        self.check_reachable(host, "true")
    }
}

fn image_info(image: &str) -> ImageInfo {
    let rootfs_tag = image
        .split_once(':')
        .filter(|(repo, _)| *repo == ROOTFS_REPOSITORY)
        .map(|(_, tag)| tag);
    if let Some(tag) = rootfs_tag {
        let labels = BTreeMap::from([
            (IMAGE_TYPE_LABEL.to_string(), "rootfs".to_string()),
            (IMAGE_VERSION_LABEL.to_string(), tag.to_string()),
        ]);
        ImageInfo {
            type_: ImageInfo::type_from_labels(&labels),
            labels,
            env: BTreeMap::from([("criType".to_string(), "containerd".to_string())]),
            ..ImageInfo::default()
        }
    } else {
        ImageInfo {
            type_: ImageType::Application,
            cmd: vec!["helm install calico charts/calico -n kube-system".to_string()],
            ..ImageInfo::default()
        }
    }
}

/// An [`ImageService`] that mounts images as empty directories under a root.
#[derive(Debug)]
pub struct FakeImageService {
    root: PathBuf,
    log: Mutex<Vec<String>>,
}

impl FakeImageService {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Operations as `verb target`, in order.
    #[must_use]
    pub fn log(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn push(&self, entry: String) {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry);
    }
}

#[async_trait]
impl ImageService for FakeImageService {
    async fn pull(&self, images: &[String]) -> Result<()> {
        for image in images {
            self.push(format!("pull {image}"));
        }
        Ok(())
    }

    async fn inspect(&self, image: &str) -> Result<ImageInfo> {
        self.push(format!("inspect {image}"));
        Ok(image_info(image))
    }

    async fn mount(&self, name: &str, image: &str) -> Result<MountImage> {
        self.push(format!("mount {name}"));
        let dir = self.root.join(name);
        fs::create_dir_all(&dir)?;
        Ok(image_info(image).into_mount(name, image, dir.display().to_string()))
    }

    async fn unmount(&self, name: &str) -> Result<()> {
        self.push(format!("unmount {name}"));
        Ok(())
    }
}

/// A cluster named `default` with a rootfs and an application image already
/// mounted under `root`.
#[must_use]
pub fn mounted_cluster(root: &Path, masters: &[&str], nodes: &[&str]) -> Cluster {
    let mut cluster = Cluster::new("default");
    cluster.spec.image = vec![ROOTFS_IMAGE.to_string(), APP_IMAGE.to_string()];
    for (role, ips) in [(MASTER, masters), (NODE, nodes)] {
        if !ips.is_empty() {
            cluster.spec.hosts.push(Host {
                ips: ips.iter().map(ToString::to_string).collect(),
                roles: vec![role.to_string(), "amd64".to_string()],
                ..Host::default()
            });
        }
    }
    cluster.status.mounts = cluster
        .spec
        .image
        .iter()
        .enumerate()
        .map(|(i, image)| {
            let name = format!("default-{i}");
            let dir = root.join(&name);
            let _ = fs::create_dir_all(&dir);
            image_info(image).into_mount(&name, image, dir.display().to_string())
        })
        .collect();
    cluster
}
