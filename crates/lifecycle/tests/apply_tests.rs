//! Integration tests for the applier.
//!
//! These drive `Applier::apply` and `Applier::delete` end to end against the
//! recording executor and image service, with the cluster record kept in a
//! temporary directory.

use std::sync::Arc;

use lifecycle::testing::{FakeExecutor, FakeImageService, APP_IMAGE, ROOTFS_IMAGE};
use lifecycle::types::{ClusterPhase, ConditionStatus, Host, CONDITION_APPLY, MASTER, NODE};
use lifecycle::{
    Applier, Cluster, ClusterError, ClusterStore, Clusterfile, Environment, RuntimeConfig,
};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn config(dir: &TempDir) -> RuntimeConfig {
    RuntimeConfig::default()
        .with_cluster_root(dir.path().join("root"))
        .with_local_data_root(dir.path().join("data"))
}

fn environment(dir: &TempDir, exec: &Arc<FakeExecutor>) -> Environment {
    Environment {
        config: config(dir),
        executor: exec.clone(),
        images: Arc::new(FakeImageService::new(&dir.path().join("mounts"))),
    }
}

fn desired(masters: &[&str], nodes: &[&str]) -> Clusterfile {
    let mut cluster = Cluster::new("default");
    cluster.spec.image = vec![ROOTFS_IMAGE.to_string(), APP_IMAGE.to_string()];
    for (role, ips) in [(MASTER, masters), (NODE, nodes)] {
        if !ips.is_empty() {
            cluster.spec.hosts.push(Host {
                ips: ips.iter().map(ToString::to_string).collect(),
                roles: vec![role.to_string()],
                ..Host::default()
            });
        }
    }
    Clusterfile::new(cluster)
}

fn record(dir: &TempDir) -> Option<Clusterfile> {
    ClusterStore::new(config(dir).paths("default")).load().unwrap()
}

fn with_rootfs(mut file: Clusterfile, image: &str) -> Clusterfile {
    file.cluster.spec.image[0] = image.to_string();
    file
}

async fn apply(
    dir: &TempDir,
    exec: &Arc<FakeExecutor>,
    file: Clusterfile,
) -> Result<(), ClusterError> {
    let mut applier = Applier::new(environment(dir, exec), file).unwrap();
    applier.apply().await
}

/// Create the cluster with a throwaway executor so later assertions only
/// see the calls of the operation under test.
async fn create(dir: &TempDir, masters: &[&str], nodes: &[&str]) {
    let exec = Arc::new(FakeExecutor::default());
    let mut applier = Applier::new(environment(dir, &exec), desired(masters, nodes)).unwrap();
    applier.apply().await.unwrap();
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_records_success() {
    let dir = TempDir::new().unwrap();
    let exec = Arc::new(FakeExecutor::default());
    let mut applier = Applier::new(
        environment(&dir, &exec),
        desired(&["10.0.0.1:22"], &["10.0.0.3:22"]),
    )
    .unwrap();
    applier.apply().await.unwrap();

    assert_eq!(exec.count_matching("kubeadm init --config"), 1);
    assert!(exec
        .commands_on("10.0.0.3:22")
        .iter()
        .any(|c| c.starts_with("kubeadm join")));
    assert!(exec
        .commands_on("10.0.0.1:22")
        .iter()
        .any(|c| c.contains("helm install calico")));

    let saved = record(&dir).expect("cluster record");
    assert!(saved.cluster.is_created());
    assert_eq!(saved.cluster.status.phase, Some(ClusterPhase::Success));
    assert_eq!(saved.cluster.status.mounts.len(), 2);
    let condition = &saved.cluster.status.conditions[0];
    assert_eq!(condition.type_, CONDITION_APPLY);
    assert_eq!(condition.status, ConditionStatus::True);
    assert!(config(&dir).paths("default").admin_kubeconfig().exists());
}

#[tokio::test]
async fn test_failed_create_is_recorded_for_retry() {
    let dir = TempDir::new().unwrap();
    let exec = Arc::new(FakeExecutor::default().fail_on("10.0.0.3:22", "kubeadm join"));
    let mut applier = Applier::new(
        environment(&dir, &exec),
        desired(&["10.0.0.1:22"], &["10.0.0.3:22"]),
    )
    .unwrap();

    let err = applier.apply().await.unwrap_err();
    assert!(matches!(err.root(), ClusterError::HostFailures(_)));

    let saved = record(&dir).expect("cluster record");
    assert!(!saved.cluster.is_created());
    assert_eq!(saved.cluster.status.phase, Some(ClusterPhase::Failed));
    let condition = &saved.cluster.status.conditions[0];
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason, "ApplyClusterError");
    assert!(condition.message.contains("10.0.0.3:22"));
}

// =============================================================================
// Re-apply and scale
// =============================================================================

#[tokio::test]
async fn test_reapply_without_changes_contacts_no_host() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &["10.0.0.3:22"]).await;

    let exec = Arc::new(FakeExecutor::default());
    let mut applier = Applier::new(
        environment(&dir, &exec),
        desired(&["10.0.0.1:22"], &["10.0.0.3:22"]),
    )
    .unwrap();
    applier.apply().await.unwrap();

    assert_eq!(exec.call_count(), 0);
    assert_eq!(
        record(&dir).unwrap().cluster.status.phase,
        Some(ClusterPhase::Success)
    );
}

#[tokio::test]
async fn test_adding_master_runs_scale_up() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &["10.0.0.3:22"]).await;

    let exec = Arc::new(FakeExecutor::default());
    let mut applier = Applier::new(
        environment(&dir, &exec),
        desired(&["10.0.0.1:22", "10.0.0.2:22"], &["10.0.0.3:22"]),
    )
    .unwrap();
    applier.apply().await.unwrap();

    assert_eq!(exec.count_matching("kubeadm init --config"), 0);
    assert!(exec
        .commands_on("10.0.0.2:22")
        .iter()
        .any(|c| c.starts_with("kubeadm join")));
    assert_eq!(
        exec.count_matching("kubeadm init phase upload-config kubeadm"),
        1
    );
    assert!(exec
        .commands_on("10.0.0.3:22")
        .iter()
        .any(|c| c.contains("--masters 10.0.0.1:6443,10.0.0.2:6443")));

    let saved = record(&dir).unwrap();
    assert_eq!(saved.cluster.master_ips(), vec!["10.0.0.1:22", "10.0.0.2:22"]);
    assert_eq!(saved.cluster.status.phase, Some(ClusterPhase::Success));
}

#[tokio::test]
async fn test_removing_node_runs_scale_down() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &["10.0.0.3:22", "10.0.0.4:22"]).await;

    let exec = Arc::new(FakeExecutor::default());
    let mut applier = Applier::new(
        environment(&dir, &exec),
        desired(&["10.0.0.1:22"], &["10.0.0.3:22"]),
    )
    .unwrap();
    applier.apply().await.unwrap();

    assert!(exec
        .commands_on("10.0.0.4:22")
        .iter()
        .any(|c| c.starts_with("kubeadm reset")));
    assert!(exec.commands_on("10.0.0.3:22").is_empty());
    assert_eq!(exec.count_matching("sealctl static-pod lvscare"), 0);
    assert_eq!(record(&dir).unwrap().cluster.node_ips(), vec!["10.0.0.3:22"]);
}

#[tokio::test]
async fn test_deleting_master0_fails_before_any_remote_call() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22", "10.0.0.2:22"], &[]).await;

    let exec = Arc::new(FakeExecutor::default());
    let mut applier =
        Applier::new(environment(&dir, &exec), desired(&["10.0.0.2:22"], &[])).unwrap();

    let err = applier.apply().await.unwrap_err();
    assert!(matches!(err, ClusterError::Master0Deletion(ref ip) if ip == "10.0.0.1:22"));
    assert_eq!(exec.call_count(), 0);
    assert_eq!(
        record(&dir).unwrap().cluster.master_ips(),
        vec!["10.0.0.1:22", "10.0.0.2:22"]
    );
}

#[tokio::test]
async fn test_join_and_leave_in_one_apply_only_joins() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &["10.0.0.3:22"]).await;

    let exec = Arc::new(FakeExecutor::default());
    let mut applier = Applier::new(
        environment(&dir, &exec),
        desired(&["10.0.0.1:22"], &["10.0.0.4:22"]),
    )
    .unwrap();
    applier.apply().await.unwrap();

    assert!(exec
        .commands_on("10.0.0.4:22")
        .iter()
        .any(|c| c.starts_with("kubeadm join")));
    assert!(!exec
        .commands_on("10.0.0.3:22")
        .iter()
        .any(|c| c.starts_with("kubeadm reset")));

    let mut nodes = record(&dir).unwrap().cluster.node_ips();
    nodes.sort();
    assert_eq!(nodes, vec!["10.0.0.3:22", "10.0.0.4:22"]);
}

#[tokio::test]
async fn test_failed_join_is_retried_by_next_apply() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &["10.0.0.3:22"]).await;
    let target = || desired(&["10.0.0.1:22"], &["10.0.0.3:22", "10.0.0.4:22"]);

    let failing = Arc::new(FakeExecutor::default().fail_on("10.0.0.4:22", "kubeadm join"));
    assert!(apply(&dir, &failing, target()).await.is_err());
    let saved = record(&dir).unwrap();
    assert_eq!(saved.cluster.node_ips(), vec!["10.0.0.3:22"]);
    assert_eq!(saved.cluster.status.phase, Some(ClusterPhase::Failed));

    let exec = Arc::new(FakeExecutor::default());
    apply(&dir, &exec, target()).await.unwrap();
    assert!(exec
        .commands_on("10.0.0.4:22")
        .iter()
        .any(|c| c.starts_with("kubeadm join")));
    let saved = record(&dir).unwrap();
    assert_eq!(saved.cluster.node_ips(), vec!["10.0.0.3:22", "10.0.0.4:22"]);
    assert_eq!(saved.cluster.status.phase, Some(ClusterPhase::Success));
}

#[tokio::test]
async fn test_failed_removal_is_retried_by_next_apply() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &["10.0.0.3:22", "10.0.0.4:22"]).await;
    let target = || desired(&["10.0.0.1:22"], &["10.0.0.3:22"]);

    let failing = Arc::new(FakeExecutor::default().fail_on("10.0.0.1:22", "kubectl delete node"));
    assert!(apply(&dir, &failing, target()).await.is_err());
    assert_eq!(
        record(&dir).unwrap().cluster.node_ips(),
        vec!["10.0.0.3:22", "10.0.0.4:22"]
    );

    let exec = Arc::new(FakeExecutor::default());
    apply(&dir, &exec, target()).await.unwrap();
    assert!(exec
        .commands_on("10.0.0.1:22")
        .contains(&"kubectl delete node node-10.0.0.4 --ignore-not-found".to_string()));
    assert_eq!(record(&dir).unwrap().cluster.node_ips(), vec!["10.0.0.3:22"]);
}

#[tokio::test]
async fn test_new_master_cannot_take_over_master0() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &[]).await;

    let exec = Arc::new(FakeExecutor::default());
    let err = apply(&dir, &exec, desired(&["10.0.0.2:22", "10.0.0.1:22"], &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Validation(ref msg) if msg.contains("master0")));
    assert_eq!(exec.call_count(), 0);
    assert_eq!(record(&dir).unwrap().cluster.master_ips(), vec!["10.0.0.1:22"]);
}

#[tokio::test]
async fn test_cancelled_apply_keeps_previous_status() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &[]).await;
    let before = record(&dir).unwrap().cluster.status;

    let exec = Arc::new(FakeExecutor::default().cancel_on("10.0.0.2:22", "kubeadm join"));
    let err = apply(&dir, &exec, desired(&["10.0.0.1:22", "10.0.0.2:22"], &[]))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());

    let saved = record(&dir).unwrap().cluster;
    assert_eq!(saved.status.phase, Some(ClusterPhase::Success));
    assert_eq!(saved.status.conditions, before.conditions);
    assert_eq!(saved.master_ips(), vec!["10.0.0.1:22"]);
}

// =============================================================================
// Upgrade
// =============================================================================

#[tokio::test]
async fn test_new_rootfs_image_upgrades_the_cluster() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &["10.0.0.3:22"]).await;

    let exec = Arc::new(FakeExecutor::default());
    let target = with_rootfs(
        desired(&["10.0.0.1:22"], &["10.0.0.3:22"]),
        "labring/kubernetes:v1.28.2",
    );
    apply(&dir, &exec, target).await.unwrap();

    assert_eq!(exec.count_matching("kubeadm upgrade apply"), 1);
    assert!(exec
        .commands_on("10.0.0.1:22")
        .iter()
        .any(|c| c.starts_with("kubeadm upgrade apply")));
    assert!(exec
        .commands_on("10.0.0.3:22")
        .iter()
        .any(|c| c.starts_with("kubeadm upgrade node")));

    let saved = record(&dir).unwrap().cluster;
    assert_eq!(saved.spec.image[0], "labring/kubernetes:v1.28.2");
    assert_eq!(saved.status.phase, Some(ClusterPhase::Success));
    let rootfs = saved.rootfs_mount().unwrap();
    assert_eq!(rootfs.image_name, "labring/kubernetes:v1.28.2");
}

#[tokio::test]
async fn test_failed_upgrade_keeps_recorded_images() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &[]).await;
    let target = || with_rootfs(desired(&["10.0.0.1:22"], &[]), "labring/kubernetes:v1.28.2");

    let failing = Arc::new(FakeExecutor::default().fail_on("10.0.0.1:22", "kubeadm upgrade apply"));
    assert!(apply(&dir, &failing, target()).await.is_err());
    let saved = record(&dir).unwrap().cluster;
    assert_eq!(saved.spec.image[0], ROOTFS_IMAGE);
    assert_eq!(saved.rootfs_mount().unwrap().image_name, ROOTFS_IMAGE);
    assert_eq!(saved.status.phase, Some(ClusterPhase::Failed));

    let exec = Arc::new(FakeExecutor::default());
    apply(&dir, &exec, target()).await.unwrap();
    assert_eq!(exec.count_matching("kubeadm upgrade apply"), 1);
}

#[tokio::test]
async fn test_downgrade_is_rejected_before_any_remote_call() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &[]).await;

    let exec = Arc::new(FakeExecutor::default());
    let target = with_rootfs(desired(&["10.0.0.1:22"], &[]), "labring/kubernetes:v1.26.0");
    let err = apply(&dir, &exec, target).await.unwrap_err();
    assert!(matches!(err.root(), ClusterError::Validation(msg) if msg.contains("downgrade")));
    assert_eq!(exec.call_count(), 0);
    assert_eq!(record(&dir).unwrap().cluster.spec.image[0], ROOTFS_IMAGE);
}

#[tokio::test]
async fn test_images_and_hosts_cannot_change_together() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &[]).await;

    let exec = Arc::new(FakeExecutor::default());
    let target = with_rootfs(
        desired(&["10.0.0.1:22"], &["10.0.0.3:22"]),
        "labring/kubernetes:v1.28.2",
    );
    let err = apply(&dir, &exec, target).await.unwrap_err();
    assert!(matches!(err, ClusterError::Validation(_)));
    assert_eq!(exec.call_count(), 0);
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn test_delete_resets_hosts_and_removes_record() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["10.0.0.1:22"], &["10.0.0.3:22"]).await;

    let paths = config(&dir).paths("default");
    std::fs::create_dir_all(paths.data_dir().join("rootfs")).unwrap();

    let exec = Arc::new(FakeExecutor::default());
    let mut applier = Applier::new(
        environment(&dir, &exec),
        desired(&["10.0.0.1:22"], &["10.0.0.3:22"]),
    )
    .unwrap();
    applier.delete().await.unwrap();

    for host in ["10.0.0.1:22", "10.0.0.3:22"] {
        let cmds = exec.commands_on(host);
        assert!(cmds.iter().any(|c| c.starts_with("kubeadm reset")));
        assert!(cmds.iter().any(|c| c == "rm -rf /var/lib/sealos/data/default"));
    }
    assert_eq!(exec.count_matching("kubectl delete node"), 0);
    assert!(applier.cluster().metadata.deletion_timestamp.is_some());
    assert!(record(&dir).is_none());
    assert!(!paths.cluster_dir().exists());
    assert!(!paths.data_dir().exists());
}
