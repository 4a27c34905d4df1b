//! Bootstrap token and certificate key persistence.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Join material produced by `sealctl token` on master0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapToken {
    pub join_token: String,
    /// One hash per trusted CA; more than one while a CA is being rotated.
    #[serde(default)]
    pub discovery_token_ca_cert_hash: Vec<String>,
    #[serde(default)]
    pub certificate_key: String,
    pub expires: DateTime<Utc>,
}

impl BootstrapToken {
    /// Whether the token expires within `threshold` of `now`.
    #[must_use]
    pub fn needs_regeneration(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        // Negative remaining time does not convert; already expired.
        self.expires
            .signed_duration_since(now)
            .to_std()
            .map_or(true, |remaining| remaining <= threshold)
    }

    /// Parse the JSON printed by the token command.
    ///
    /// # Errors
    ///
    /// Returns an error when `raw` is not a token document.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw.trim())?)
    }

    /// Load a persisted token, `None` when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw).map(Some)
    }

    /// Persist the token as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "bootstrap token saved");
        Ok(())
    }
}

/// A fresh certificate key: 32 random bytes, hex encoded.
#[must_use]
pub fn generate_certificate_key() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Reuse the key stored at `path`, or create and store a new one.
///
/// # Errors
///
/// Returns an error if the file cannot be read or written.
pub fn load_or_create_certificate_key(path: &Path) -> Result<String> {
    if path.exists() {
        let key = fs::read_to_string(path)?.trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let key = generate_certificate_key();
    fs::write(path, &key)?;
    Ok(key)
}
