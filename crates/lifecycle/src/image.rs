//! OCI image service used to pull, inspect and mount cluster images.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ClusterError, Result};
use crate::types::{parse_env, ImageType, MountImage};

/// Label carrying the image flavour.
pub const IMAGE_TYPE_LABEL: &str = "sealos.io.type";
/// Label carrying the Kubernetes version of a rootfs image.
pub const IMAGE_VERSION_LABEL: &str = "version";

/// Metadata of an image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageInfo {
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub type_: ImageType,
}

impl ImageInfo {
    /// Image flavour from [`IMAGE_TYPE_LABEL`], falling back to `type`.
    #[must_use]
    pub fn type_from_labels(labels: &BTreeMap<String, String>) -> ImageType {
        let value = labels
            .get(IMAGE_TYPE_LABEL)
            .or_else(|| labels.get("type"))
            .map(|v| v.to_ascii_lowercase());
        match value.as_deref() {
            Some("rootfs") => ImageType::Rootfs,
            Some("patch") => ImageType::Patch,
            _ => ImageType::Application,
        }
    }

    /// Record of this image mounted as working container `name`.
    #[must_use]
    pub fn into_mount(self, name: &str, image: &str, mount_point: String) -> MountImage {
        MountImage {
            name: name.to_string(),
            image_name: image.to_string(),
            mount_point,
            type_: self.type_,
            labels: self.labels,
            env: self.env,
            entrypoint: self.entrypoint,
            cmd: self.cmd,
        }
    }
}

/// Pull, inspect and mount images.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Pull every image that is not present locally.
    async fn pull(&self, images: &[String]) -> Result<()>;

    async fn inspect(&self, image: &str) -> Result<ImageInfo>;

    /// Mount `image` as working container `name`; an existing container
    /// with that name is reused.
    async fn mount(&self, name: &str, image: &str) -> Result<MountImage>;

    /// Unmount and remove working container `name`. Missing containers are ignored.
    async fn unmount(&self, name: &str) -> Result<()>;
}

/// [`ImageService`] backed by the `buildah` CLI.
#[derive(Debug, Clone)]
pub struct BuildahImageService {
    bin: String,
}

impl Default for BuildahImageService {
    fn default() -> Self {
        Self {
            bin: "buildah".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InspectOutput {
    #[serde(rename = "OCIv1", default)]
    oci: OciImage,
}

#[derive(Debug, Default, Deserialize)]
struct OciImage {
    #[serde(default)]
    config: OciConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OciConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    entrypoint: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
}

impl BuildahImageService {
    #[must_use]
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(bin = %self.bin, ?args, "image command");
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .map_err(|e| ClusterError::Image(format!("failed to run {}: {e}", self.bin)))?;
        if !output.status.success() {
            return Err(ClusterError::Image(format!(
                "{} {} failed: {}",
                self.bin,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parse `buildah inspect --type image` output.
fn parse_inspect(raw: &str) -> Result<ImageInfo> {
    let parsed: InspectOutput = serde_json::from_str(raw)?;
    let config = parsed.oci.config;
    let labels = config.labels.unwrap_or_default();
    Ok(ImageInfo {
        type_: ImageInfo::type_from_labels(&labels),
        labels,
        env: parse_env(&config.env.unwrap_or_default()),
        entrypoint: config.entrypoint.unwrap_or_default(),
        cmd: config.cmd.unwrap_or_default(),
    })
}

#[async_trait]
impl ImageService for BuildahImageService {
    async fn pull(&self, images: &[String]) -> Result<()> {
        for image in images {
            if self.run(&["inspect", "--type", "image", image]).await.is_ok() {
                debug!(%image, "image already present");
                continue;
            }
            info!(%image, "pulling image");
            self.run(&["pull", image]).await?;
        }
        Ok(())
    }

    async fn inspect(&self, image: &str) -> Result<ImageInfo> {
        parse_inspect(&self.run(&["inspect", "--type", "image", image]).await?)
    }

    async fn mount(&self, name: &str, image: &str) -> Result<MountImage> {
        if self.run(&["inspect", "--type", "container", name]).await.is_err() {
            self.run(&["from", "--pull=never", "--name", name, image])
                .await?;
        }
        let mount_point = self.run(&["mount", name]).await?;
        let info = self.inspect(image).await?;
        Ok(info.into_mount(name, image, mount_point))
    }

    async fn unmount(&self, name: &str) -> Result<()> {
        if self.run(&["inspect", "--type", "container", name]).await.is_err() {
            return Ok(());
        }
        self.run(&["umount", name]).await?;
        self.run(&["rm", name]).await.map(drop)
    }
}
