//! Guest commands: the entrypoint and cmd of every mounted image, run on
//! master0 once the topology is in place.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use tracing::info;

use crate::config::PathResolver;
use crate::error::Result;
use crate::remote::RemoteExecutor;
use crate::types::{Cluster, ImageType, MountImage};

/// `$(VAR)`, `${VAR}` or `$VAR`.
static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\(([A-Za-z_][A-Za-z0-9_]*)\)|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("static regex")
});

/// Replace variable references with values from `env`. Unknown variables
/// are left as written so the remote shell can still expand them.
#[must_use]
pub fn substitute(command: &str, env: &BTreeMap<String, String>) -> String {
    ENV_REFERENCE
        .replace_all(command, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map_or("", |m| m.as_str());
            env.get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// `export K="V" && ` for every entry, empty for an empty env.
pub(crate) fn export_prefix(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(k, v)| format!("export {k}=\"{}\" && ", v.replace('"', "\\\"")))
        .collect()
}

/// Remote directory a mount is copied to.
pub(crate) fn remote_workdir(paths: &PathResolver, mount: &MountImage) -> String {
    match mount.type_ {
        ImageType::Rootfs | ImageType::Patch => paths.remote_rootfs(),
        ImageType::Application => paths.remote_app_workdir(&mount.name),
    }
}

/// Image env overlaid by `overlay`.
pub(crate) fn merged_env(
    mount: &MountImage,
    overlay: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = mount.env.clone();
    env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// The shell commands for every mount, in mount order.
///
/// `overlay` is the cluster and host env applied over each image's env. A
/// non-empty `spec.command` replaces the cmd of the last image.
#[must_use]
pub fn guest_commands(
    cluster: &Cluster,
    paths: &PathResolver,
    overlay: &BTreeMap<String, String>,
) -> Vec<String> {
    let mounts = &cluster.status.mounts;
    let mut commands = Vec::new();
    for (i, mount) in mounts.iter().enumerate() {
        let env = merged_env(mount, overlay);
        let workdir = remote_workdir(paths, mount);
        let cmd = if i + 1 == mounts.len() && !cluster.spec.command.is_empty() {
            &cluster.spec.command
        } else {
            &mount.cmd
        };
        commands.extend(
            mount
                .entrypoint
                .iter()
                .chain(cmd)
                .filter(|c| !c.trim().is_empty())
                .map(|c| format!("cd {workdir} && {}", substitute(c, &env))),
        );
    }
    commands
}

/// Runs guest commands on master0.
#[derive(Clone)]
pub struct GuestRunner {
    exec: Arc<dyn RemoteExecutor>,
    paths: PathResolver,
}

impl GuestRunner {
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExecutor>, paths: PathResolver) -> Self {
        Self { exec, paths }
    }

    /// Run the guest commands with the env of `hosts` layered over the
    /// cluster env, in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing command.
    pub async fn run(&self, cluster: &Cluster, hosts: &[String]) -> Result<()> {
        let master0 = cluster.master0()?;
        let mut overlay = crate::types::parse_env(&cluster.spec.env);
        for host in hosts {
            overlay.extend(cluster.env_for(host));
        }
        let commands = guest_commands(cluster, &self.paths, &overlay);
        info!(host = %master0, commands = commands.len(), "Running guest commands...");
        self.exec.cmd_async(&master0, &commands).await
    }
}
