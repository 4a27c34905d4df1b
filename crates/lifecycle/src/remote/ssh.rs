//! [`RemoteExecutor`] backed by the system OpenSSH client.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, warn};

use super::retry::{retry_transport, TransportRetry};
use super::RemoteExecutor;
use crate::error::{ClusterError, Result};
use crate::hosts;
use crate::types::Cluster;

/// Transport settings.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub ssh_bin: String,
    pub scp_bin: String,
    pub connect_timeout: Duration,
    /// Upper bound for any single command or transfer.
    pub command_timeout: Duration,
    /// Applied to ping, copy and fetch; commands are never re-run.
    pub retry: TransportRetry,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: "ssh".to_string(),
            scp_bin: "scp".to_string(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
            retry: TransportRetry::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct HostAuth {
    user: String,
    ip: String,
    port: u16,
    identity: Option<PathBuf>,
}

impl HostAuth {
    fn target(&self) -> String {
        format!("{}@{}", self.user, self.ip)
    }

    fn scp_target(&self, path: &str) -> String {
        if self.ip.contains(':') {
            format!("{}@[{}]:{path}", self.user, self.ip)
        } else {
            format!("{}@{}:{path}", self.user, self.ip)
        }
    }
}

/// Runs commands through `ssh` and transfers files through `scp`.
///
/// Only key-based authentication is supported: hosts configured with a
/// password and no key are rejected at construction.
pub struct OpenSshExecutor {
    hosts: HashMap<String, HostAuth>,
    options: SshOptions,
    // Inline keys live in temp files for as long as the executor does.
    _keys: Vec<NamedTempFile>,
}

impl OpenSshExecutor {
    /// Build credentials for every host of `clusters`.
    ///
    /// Pass both the recorded and the desired cluster so hosts that are
    /// joining and hosts that are leaving are both reachable.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Validation`] for password-only hosts and an
    /// I/O error if an inline key cannot be written.
    pub fn for_clusters(clusters: &[&Cluster], options: SshOptions) -> Result<Self> {
        let mut auths = HashMap::new();
        let mut keys = Vec::new();
        for cluster in clusters {
            for addr in cluster.all_ips() {
                if auths.contains_key(&addr) {
                    continue;
                }
                let ssh = cluster.ssh_for(&addr);
                let identity = if let Some(data) = ssh.pk_data.as_deref().filter(|d| !d.is_empty())
                {
                    let file = write_key(data)?;
                    let path = file.path().to_path_buf();
                    keys.push(file);
                    Some(path)
                } else if let Some(pk) = ssh.pk.as_deref().filter(|p| !p.is_empty()) {
                    Some(PathBuf::from(pk))
                } else if ssh.passwd.as_deref().is_some_and(|p| !p.is_empty()) {
                    return Err(ClusterError::Validation(format!(
                        "host {addr} only has password credentials; configure a private key"
                    )));
                } else {
                    None
                };
                if ssh.pk_passwd.is_some() {
                    warn!(host = %addr, "private key passphrases must be provided via ssh-agent");
                }
                let (ip, port) = hosts::split_host_port(&addr);
                let auth = HostAuth {
                    user: if ssh.user.is_empty() {
                        "root".to_string()
                    } else {
                        ssh.user.clone()
                    },
                    ip: ip.to_string(),
                    port: port.unwrap_or_else(|| cluster.default_port()),
                    identity,
                };
                auths.insert(addr, auth);
            }
        }
        Ok(Self {
            hosts: auths,
            options,
            _keys: keys,
        })
    }

    fn auth(&self, host: &str) -> Result<&HostAuth> {
        self.hosts.get(host).ok_or_else(|| {
            ClusterError::Validation(format!("no SSH credentials for host {host}"))
        })
    }

    fn common_args(&self, auth: &HostAuth) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs()),
        ];
        if let Some(identity) = &auth.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    async fn output(&self, host: &str, label: &str, mut command: Command) -> Result<String> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.options.command_timeout, command.output())
            .await
            .map_err(|_| {
                ClusterError::remote(
                    host,
                    label,
                    format!("timed out after {:?}", self.options.command_timeout),
                )
            })?
            .map_err(|e| ClusterError::remote(host, label, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClusterError::remote(
                host,
                label,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ssh(&self, host: &str, cmd: &str) -> Result<String> {
        let auth = self.auth(host)?;
        let mut command = Command::new(&self.options.ssh_bin);
        command
            .args(self.common_args(auth))
            .arg("-p")
            .arg(auth.port.to_string())
            .arg(auth.target())
            .arg(cmd);
        debug!(host, cmd, "ssh");
        self.output(host, cmd, command).await
    }

    async fn scp(&self, host: &str, from: String, to: String) -> Result<()> {
        let auth = self.auth(host)?;
        let label = format!("scp {from} {to}");
        let mut command = Command::new(&self.options.scp_bin);
        command
            .args(self.common_args(auth))
            .arg("-P")
            .arg(auth.port.to_string())
            .arg("-r")
            .arg(&from)
            .arg(&to);
        debug!(host, %label, "scp");
        self.output(host, &label, command).await.map(drop)
    }
}

fn write_key(data: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(data.as_bytes())?;
    if !data.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

fn parent_dir(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|p| !p.is_empty())
}

#[async_trait]
impl RemoteExecutor for OpenSshExecutor {
    async fn cmd(&self, host: &str, command: &str) -> Result<String> {
        self.ssh(host, command).await
    }

    /// Directories are copied by content into `dst`.
    async fn copy(&self, host: &str, src: &Path, dst: &str) -> Result<()> {
        let (from, mkdir) = if src.is_dir() {
            (format!("{}/.", src.display()), Some(dst))
        } else {
            (src.display().to_string(), parent_dir(dst))
        };
        let to = self.auth(host)?.scp_target(dst);
        retry_transport(&self.options.retry, host, "copy", || {
            let (from, to) = (from.clone(), to.clone());
            async move {
                if let Some(dir) = mkdir {
                    self.ssh(host, &format!("mkdir -p {dir}")).await?;
                }
                self.scp(host, from, to).await
            }
        })
        .await
    }

    async fn fetch(&self, host: &str, src: &str, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let from = self.auth(host)?.scp_target(src);
        let to = dst.display().to_string();
        retry_transport(&self.options.retry, host, "fetch", || {
            self.scp(host, from.clone(), to.clone())
        })
        .await
    }

    async fn ping(&self, host: &str) -> Result<()> {
        retry_transport(&self.options.retry, host, "ping", || self.ssh(host, "true"))
            .await
            .map(drop)
    }
}
