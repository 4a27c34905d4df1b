//! Local cluster record: the Clusterfile and the cluster manifest.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info};

use crate::config::PathResolver;
use crate::configs::{Config, CONFIG_KIND};
use crate::error::{ClusterError, Result};
use crate::types::{Cluster, CLUSTER_KIND};

/// A parsed Clusterfile: the cluster plus the documents that travel with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Clusterfile {
    pub cluster: Cluster,
    pub configs: Vec<Config>,
    /// kubeadm documents, kept verbatim and merged over the defaults.
    pub kubeadm: Option<String>,
}

impl Clusterfile {
    #[must_use]
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            configs: Vec::new(),
            kubeadm: None,
        }
    }

    /// Parse a multi-document stream.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Validation`] when the stream has no
    /// `kind: Cluster` document, and a YAML error for malformed input.
    pub fn parse(yaml: &str) -> Result<Self> {
        let mut cluster = None;
        let mut configs = Vec::new();
        let mut kubeadm = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            let value = Value::deserialize(doc)?;
            if value.is_null() {
                continue;
            }
            match value.get("kind").and_then(Value::as_str) {
                Some(CLUSTER_KIND) => cluster = Some(serde_yaml::from_value(value)?),
                Some(CONFIG_KIND) => configs.push(serde_yaml::from_value(value)?),
                Some(kind) if kind.ends_with("Configuration") => {
                    kubeadm.push(serde_yaml::to_string(&value)?);
                }
                other => debug!(kind = ?other, "ignoring document"),
            }
        }
        let cluster = cluster
            .ok_or_else(|| ClusterError::Validation("no Cluster document found".into()))?;
        Ok(Self {
            cluster,
            configs,
            kubeadm: (!kubeadm.is_empty()).then(|| kubeadm.join("---\n")),
        })
    }

    /// Read and parse `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn read(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Render as a multi-document stream: cluster, configs, kubeadm.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        let mut docs = vec![serde_yaml::to_string(&self.cluster)?];
        for config in &self.configs {
            docs.push(serde_yaml::to_string(config)?);
        }
        if let Some(kubeadm) = &self.kubeadm {
            docs.push(kubeadm.clone());
        }
        Ok(docs.join("---\n"))
    }
}

/// Record of what was pulled and mounted for a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub cluster: String,
    pub images: Vec<String>,
    pub mounts: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    #[must_use]
    pub fn for_cluster(cluster: &Cluster) -> Self {
        Self {
            cluster: cluster.name().to_string(),
            images: cluster.spec.image.clone(),
            mounts: cluster.status.mounts.iter().map(|m| m.name.clone()).collect(),
            created_at: Utc::now(),
        }
    }
}

/// Filesystem store for one cluster.
#[derive(Debug, Clone)]
pub struct ClusterStore {
    paths: PathResolver,
}

impl ClusterStore {
    #[must_use]
    pub fn new(paths: PathResolver) -> Self {
        Self { paths }
    }

    #[must_use]
    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// The persisted Clusterfile, `None` when the cluster was never applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Option<Clusterfile>> {
        let path = self.paths.clusterfile();
        if !path.exists() {
            return Ok(None);
        }
        Clusterfile::read(&path).map(Some)
    }

    /// Persist atomically: write a sibling temp file, then rename.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub fn save(&self, file: &Clusterfile) -> Result<()> {
        let path = self.paths.clusterfile();
        write_atomic(&path, file.to_yaml()?.as_bytes())?;
        debug!(path = %path.display(), "cluster record saved");
        Ok(())
    }

    /// Delete the Clusterfile.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self) -> Result<()> {
        remove_file_if_exists(&self.paths.clusterfile())
    }

    /// # Errors
    ///
    /// Returns an error if the manifest cannot be written.
    pub fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        write_atomic(
            &self.paths.manifest(),
            serde_json::to_string_pretty(manifest)?.as_bytes(),
        )
    }

    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be parsed.
    pub fn load_manifest(&self) -> Result<Option<Manifest>> {
        let path = self.paths.manifest();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be removed.
    pub fn remove_manifest(&self) -> Result<()> {
        remove_file_if_exists(&self.paths.manifest())
    }

    /// Remove the cluster directory and the local data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if either directory exists but cannot be removed.
    pub fn clean(&self) -> Result<()> {
        for dir in [self.paths.cluster_dir(), self.paths.data_dir()] {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
                info!(path = %dir.display(), "removed local cluster data");
            }
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ClusterError::Validation(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
