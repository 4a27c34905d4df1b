//! `kind: Config` fragments patched into files of mounted images.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info};

use crate::error::{ClusterError, Result};
use crate::kubeadm::merge_value;
use crate::types::MountImage;

/// Kind of a config fragment document.
pub const CONFIG_KIND: &str = "Config";

/// How `data` is combined with the target file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Deep-merge YAML documents, position by position.
    #[default]
    Merge,
    /// Replace the file.
    Override,
    /// Prepend `data`.
    Insert,
    /// Append `data`.
    Append,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMeta {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSpec {
    /// File path relative to the image root.
    pub path: String,
    /// Image name to patch; empty patches every image.
    #[serde(rename = "match", default, skip_serializing_if = "String::is_empty")]
    pub match_: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub strategy: Strategy,
}

/// A config fragment document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ConfigMeta,
    pub spec: ConfigSpec,
}

impl Config {
    fn matches(&self, mount: &MountImage) -> bool {
        self.spec.match_.is_empty() || self.spec.match_ == mount.image_name
    }

    fn target(&self, root: &Path) -> Result<PathBuf> {
        let rel = Path::new(self.spec.path.trim_start_matches('/'));
        if rel.as_os_str().is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ClusterError::Validation(format!(
                "config {} has invalid path {:?}",
                self.metadata.name, self.spec.path
            )));
        }
        Ok(root.join(rel))
    }
}

/// Apply every fragment to the matching mounted images.
///
/// # Errors
///
/// Returns an error for escaping paths, unreadable targets or YAML that
/// cannot be merged.
pub fn apply_configs(configs: &[Config], mounts: &[MountImage]) -> Result<()> {
    for config in configs {
        for mount in mounts.iter().filter(|m| config.matches(m)) {
            let target = config.target(Path::new(&mount.mount_point))?;
            info!(
                config = %config.metadata.name,
                image = %mount.image_name,
                path = %target.display(),
                "applying config"
            );
            apply_one(&config.spec, &target)?;
        }
    }
    Ok(())
}

fn apply_one(spec: &ConfigSpec, target: &Path) -> Result<()> {
    let existing = if target.exists() {
        Some(fs::read_to_string(target)?)
    } else {
        None
    };
    let content = match (spec.strategy, existing) {
        (Strategy::Override, _) | (_, None) => spec.data.clone(),
        (Strategy::Insert, Some(old)) => format!("{}{old}", with_newline(&spec.data)),
        (Strategy::Append, Some(old)) => format!("{}{}", with_newline(&old), spec.data),
        (Strategy::Merge, Some(old)) => merge_documents(&old, &spec.data)?,
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    debug!(path = %target.display(), bytes = content.len(), "writing config");
    fs::write(target, content)?;
    Ok(())
}

fn with_newline(s: &str) -> String {
    if s.is_empty() || s.ends_with('\n') {
        s.to_string()
    } else {
        format!("{s}\n")
    }
}

fn parse_documents(yaml: &str) -> Result<Vec<Value>> {
    serde_yaml::Deserializer::from_str(yaml)
        .map(|doc| Value::deserialize(doc).map_err(ClusterError::from))
        .filter(|v| !matches!(v, Ok(Value::Null)))
        .collect()
}

fn merge_documents(base: &str, patch: &str) -> Result<String> {
    let mut docs = parse_documents(base)?;
    for (i, doc) in parse_documents(patch)?.into_iter().enumerate() {
        match docs.get_mut(i) {
            Some(existing) => merge_value(existing, &doc),
            None => docs.push(doc),
        }
    }
    let rendered = docs
        .iter()
        .map(serde_yaml::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rendered.join("---\n"))
}
