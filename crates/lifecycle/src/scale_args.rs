//! `add` / `delete` arguments turned into a desired cluster.

use std::collections::HashSet;

use tracing::warn;

use crate::error::{ClusterError, Result};
use crate::hosts::{self, has_port, host_ip, parse_address_list};
use crate::types::{Cluster, Host, Ssh, MASTER, NODE};

/// Addresses to add or remove, as typed on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleArgs {
    /// Comma separated masters; IPv4 ranges allowed.
    pub masters: String,
    /// Comma separated nodes; IPv4 ranges allowed.
    pub nodes: String,
    /// Credentials for the new hosts when they differ from the cluster's.
    pub ssh: Option<Ssh>,
}

impl ScaleArgs {
    fn by_role(&self) -> [(&'static str, &str); 2] {
        [(MASTER, self.masters.as_str()), (NODE, self.nodes.as_str())]
    }
}

/// Add the hosts in `args` to `cluster`.
///
/// Hosts sharing the cluster's SSH settings extend the existing group of
/// their role; hosts with different settings get a group of their own.
///
/// # Errors
///
/// Returns [`ClusterError::Validation`] for malformed addresses, ranges with
/// ports, or hosts that are already part of the cluster.
pub fn verify_and_set_nodes(cluster: &mut Cluster, args: &ScaleArgs) -> Result<()> {
    let ssh_override = args
        .ssh
        .as_ref()
        .filter(|s| s.overlay(&cluster.spec.ssh) != cluster.spec.ssh)
        .cloned();
    let port = ssh_override
        .as_ref()
        .and_then(|s| s.port)
        .unwrap_or_else(|| cluster.default_port());
    let mut joined: HashSet<String> = cluster
        .all_ips()
        .iter()
        .map(|a| host_ip(a).to_string())
        .collect();

    for (role, input) in args.by_role() {
        let addrs: Vec<String> = parse_address_list(input)?
            .iter()
            .map(|a| hosts::normalize(a, port))
            .collect();
        if addrs.is_empty() {
            continue;
        }
        for addr in &addrs {
            if !joined.insert(host_ip(addr).to_string()) {
                return Err(ClusterError::Validation(format!(
                    "host {addr} already joined"
                )));
            }
        }

        if let Some(ssh) = &ssh_override {
            cluster.spec.hosts.push(Host {
                ips: addrs,
                roles: vec![role.to_string()],
                ssh: Some(ssh.clone()),
                env: Vec::new(),
            });
            continue;
        }
        match cluster
            .spec
            .hosts
            .iter_mut()
            .find(|h| h.ssh.is_none() && h.roles.iter().any(|r| r == role))
        {
            Some(group) => group.ips.extend(addrs),
            None => cluster.spec.hosts.push(Host {
                ips: addrs,
                roles: vec![role.to_string()],
                ..Host::default()
            }),
        }
    }
    Ok(())
}

/// Remove the hosts in `args` from `cluster`.
///
/// Entries without a port match every address of that IP in the role;
/// entries with a port must match exactly.
///
/// # Errors
///
/// Returns [`ClusterError::Master0Deletion`] when master0 would be removed
/// and [`ClusterError::Validation`] for malformed or unknown `ip:port`
/// entries.
pub fn delete_nodes(cluster: &mut Cluster, args: &ScaleArgs) -> Result<()> {
    let master0 = cluster.master0()?;
    let mut remove = Vec::new();

    for (role, input) in args.by_role() {
        let current = cluster.ips_by_role(role);
        for entry in parse_address_list(input)? {
            let matched: Vec<String> = if has_port(&entry) {
                let addr = hosts::normalize(&entry, cluster.default_port());
                if !current.contains(&addr) {
                    return Err(ClusterError::Validation(format!(
                        "{role} {entry} is not part of cluster {}",
                        cluster.name()
                    )));
                }
                vec![addr]
            } else {
                current
                    .iter()
                    .filter(|a| host_ip(a) == entry)
                    .cloned()
                    .collect()
            };
            if matched.is_empty() {
                warn!(%role, address = %entry, "no matching host in cluster, skipping");
            }
            remove.extend(matched);
        }
    }

    if remove.contains(&master0) {
        return Err(ClusterError::Master0Deletion(master0));
    }
    cluster.remove_hosts(&hosts::dedup(remove));
    Ok(())
}
