//! Host set diffing between the recorded and desired clusters.

use std::collections::HashSet;

use crate::error::{ClusterError, Result};
use crate::hosts;
use crate::types::Cluster;

/// Join/delete sets for one role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDiff {
    /// In desired but not in current, in desired order.
    pub to_join: Vec<String>,
    /// In current but not in desired, in current order.
    pub to_delete: Vec<String>,
}

impl HostDiff {
    /// Whether both sets are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_join.is_empty() && self.to_delete.is_empty()
    }
}

/// Compute `(desired - current, current - desired)` with set semantics.
///
/// Inputs are de-duplicated first, so the two result sets never share an
/// element and never contain duplicates.
#[must_use]
pub fn diff(current: &[String], desired: &[String]) -> HostDiff {
    let current = hosts::dedup(current);
    let desired = hosts::dedup(desired);
    let current_set: HashSet<&str> = current.iter().map(String::as_str).collect();
    let desired_set: HashSet<&str> = desired.iter().map(String::as_str).collect();

    HostDiff {
        to_join: desired
            .iter()
            .filter(|a| !current_set.contains(a.as_str()))
            .cloned()
            .collect(),
        to_delete: current
            .iter()
            .filter(|a| !desired_set.contains(a.as_str()))
            .cloned()
            .collect(),
    }
}

/// Which half of the scale pipeline a diff selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    /// Nothing to do.
    None,
    /// At least one host joins.
    Up,
    /// Hosts only leave.
    Down,
}

/// Per-role diffs between two clusters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterDiff {
    pub masters: HostDiff,
    pub nodes: HostDiff,
}

impl ClusterDiff {
    /// Diff the recorded cluster against the desired one, role by role.
    #[must_use]
    pub fn between(current: &Cluster, desired: &Cluster) -> Self {
        Self {
            masters: diff(&current.master_ips(), &desired.master_ips()),
            nodes: diff(&current.node_ips(), &desired.node_ips()),
        }
    }

    /// Whether the reconciliation is a no-op.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.masters.is_empty() && self.nodes.is_empty()
    }

    /// Joins win: any join selects the up half, otherwise any delete selects down.
    #[must_use]
    pub fn action(&self) -> ScaleAction {
        if !self.masters.to_join.is_empty() || !self.nodes.to_join.is_empty() {
            ScaleAction::Up
        } else if !self.masters.to_delete.is_empty() || !self.nodes.to_delete.is_empty() {
            ScaleAction::Down
        } else {
            ScaleAction::None
        }
    }

    /// Hosts that join, masters first.
    #[must_use]
    pub fn joining(&self) -> Vec<String> {
        hosts::dedup(self.masters.to_join.iter().chain(&self.nodes.to_join))
    }

    /// Hosts that leave, masters first.
    #[must_use]
    pub fn leaving(&self) -> Vec<String> {
        hosts::dedup(self.masters.to_delete.iter().chain(&self.nodes.to_delete))
    }

    /// Reject diffs the scale pipelines cannot carry out.
    ///
    /// Runs before any host is contacted. master0 is pinned: it anchors the
    /// join token and the API server endpoint of every other host.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Master0Deletion`] when master0 of `current`
    /// is scheduled for deletion, and [`ClusterError::Validation`] when the
    /// desired cluster has no master, lists a different master first, or
    /// moves a host between roles.
    pub fn validate(&self, current: &Cluster, desired: &Cluster) -> Result<()> {
        if desired.master_ips().is_empty() {
            return Err(ClusterError::Validation(
                "desired cluster must keep at least one master".into(),
            ));
        }
        let master0 = current.master0()?;
        let leaving = self.leaving();
        if leaving.contains(&master0) {
            return Err(ClusterError::Master0Deletion(master0));
        }
        let desired_master0 = desired.master0()?;
        if desired_master0 != master0 {
            return Err(ClusterError::Validation(format!(
                "master0 must stay {master0}, desired cluster lists {desired_master0} first"
            )));
        }
        if let Some(host) = self.joining().into_iter().find(|h| leaving.contains(h)) {
            return Err(ClusterError::Validation(format!(
                "host {host} changes role; delete it, then add it back"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Host, MASTER, NODE};

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    fn cluster(masters: &[&str], nodes: &[&str]) -> Cluster {
        let mut c = Cluster::new("default");
        c.spec.hosts = vec![
            Host {
                ips: list(masters),
                roles: list(&[MASTER]),
                ..Host::default()
            },
            Host {
                ips: list(nodes),
                roles: list(&[NODE]),
                ..Host::default()
            },
        ];
        c
    }

    #[test]
    fn test_diff_is_set_difference_both_ways() {
        let d = diff(
            &list(&["a:22", "b:22", "c:22"]),
            &list(&["c:22", "d:22", "a:22"]),
        );
        assert_eq!(d.to_join, list(&["d:22"]));
        assert_eq!(d.to_delete, list(&["b:22"]));
        assert!(d.to_join.iter().all(|j| !d.to_delete.contains(j)));
    }

    #[test]
    fn test_diff_of_identical_sets_is_empty() {
        let a = list(&["a:22", "b:22"]);
        let mut shuffled = a.clone();
        shuffled.reverse();
        assert!(diff(&a, &shuffled).is_empty());
    }

    #[test]
    fn test_diff_ignores_duplicates() {
        let d = diff(&list(&["a:22", "a:22"]), &list(&["b:22", "b:22", ""]));
        assert_eq!(d.to_join, list(&["b:22"]));
        assert_eq!(d.to_delete, list(&["a:22"]));
    }

    #[test]
    fn test_master_join_selects_scale_up() {
        let current = cluster(&["10.0.0.1:22"], &["10.0.0.3:22"]);
        let desired = cluster(&["10.0.0.1:22", "10.0.0.2:22"], &["10.0.0.3:22"]);
        let d = ClusterDiff::between(&current, &desired);
        assert_eq!(d.masters.to_join, list(&["10.0.0.2:22"]));
        assert!(d.masters.to_delete.is_empty());
        assert!(d.nodes.is_empty());
        assert_eq!(d.action(), ScaleAction::Up);
        d.validate(&current, &desired).unwrap();
    }

    #[test]
    fn test_joins_win_over_deletes() {
        let current = cluster(&["10.0.0.1:22"], &["10.0.0.3:22"]);
        let desired = cluster(&["10.0.0.1:22"], &["10.0.0.4:22"]);
        let d = ClusterDiff::between(&current, &desired);
        assert_eq!(d.action(), ScaleAction::Up);
        assert_eq!(d.leaving(), list(&["10.0.0.3:22"]));
    }

    #[test]
    fn test_delete_only_selects_scale_down() {
        let current = cluster(&["10.0.0.1:22"], &["10.0.0.3:22", "10.0.0.4:22"]);
        let desired = cluster(&["10.0.0.1:22"], &["10.0.0.3:22"]);
        let d = ClusterDiff::between(&current, &desired);
        assert_eq!(d.action(), ScaleAction::Down);
    }

    #[test]
    fn test_removing_master0_is_rejected() {
        let current = cluster(&["10.0.0.1:22", "10.0.0.2:22"], &[]);
        let desired = cluster(&["10.0.0.2:22"], &[]);
        let d = ClusterDiff::between(&current, &desired);
        assert!(matches!(
            d.validate(&current, &desired),
            Err(ClusterError::Master0Deletion(ip)) if ip == "10.0.0.1:22"
        ));
    }

    #[test]
    fn test_removing_every_master_is_rejected() {
        let current = cluster(&["10.0.0.1:22"], &["10.0.0.3:22"]);
        let desired = cluster(&[], &["10.0.0.3:22"]);
        let d = ClusterDiff::between(&current, &desired);
        assert!(matches!(
            d.validate(&current, &desired),
            Err(ClusterError::Validation(_))
        ));
    }

    #[test]
    fn test_new_master_listed_first_is_rejected() {
        let current = cluster(&["10.0.0.1:22"], &[]);
        let desired = cluster(&["10.0.0.2:22", "10.0.0.1:22"], &[]);
        let d = ClusterDiff::between(&current, &desired);
        assert!(matches!(
            d.validate(&current, &desired),
            Err(ClusterError::Validation(msg)) if msg.contains("master0 must stay 10.0.0.1:22")
        ));
    }

    #[test]
    fn test_reordered_masters_are_rejected_even_without_joins() {
        let current = cluster(&["10.0.0.1:22", "10.0.0.2:22"], &[]);
        let desired = cluster(&["10.0.0.2:22", "10.0.0.1:22"], &[]);
        let d = ClusterDiff::between(&current, &desired);
        assert!(d.is_empty());
        assert!(matches!(
            d.validate(&current, &desired),
            Err(ClusterError::Validation(_))
        ));
    }

    #[test]
    fn test_role_change_is_rejected() {
        let current = cluster(&["10.0.0.1:22"], &["10.0.0.3:22"]);
        let desired = cluster(&["10.0.0.1:22", "10.0.0.3:22"], &[]);
        let d = ClusterDiff::between(&current, &desired);
        assert!(matches!(
            d.validate(&current, &desired),
            Err(ClusterError::Validation(msg)) if msg.contains("changes role")
        ));
    }

    #[test]
    fn test_unchanged_cluster_is_a_no_op() {
        let current = cluster(&["10.0.0.1:22"], &["10.0.0.3:22"]);
        let d = ClusterDiff::between(&current, &current.clone());
        assert!(d.is_empty());
        assert_eq!(d.action(), ScaleAction::None);
    }
}
