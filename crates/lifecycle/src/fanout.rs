//! Bounded per-host fan-out.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::{ClusterError, HostFailure, Result};

/// Run `op` for every host with at most `limit` in flight.
///
/// Every task is joined before returning. Failures do not cancel siblings;
/// they are collected, in `hosts` order, into one
/// [`ClusterError::HostFailures`].
///
/// # Errors
///
/// Returns [`ClusterError::HostFailures`] when any host failed.
pub async fn for_each_host<F, Fut>(hosts: &[String], limit: usize, op: F) -> Result<()>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();
    for host in hosts {
        let permits = Arc::clone(&semaphore);
        let task = op(host.clone());
        let host = host.clone();
        set.spawn(async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await;
            let result = task.await;
            (host, result)
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((host, Err(e))) => {
                warn!(host = %host, error = %e, "host operation failed");
                failures.push(HostFailure {
                    host,
                    message: e.to_string(),
                });
            }
            Err(e) => failures.push(HostFailure {
                host: "<task>".to_string(),
                message: format!("task panicked: {e}"),
            }),
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    failures.sort_by_key(|f| hosts.iter().position(|h| *h == f.host).unwrap_or(usize::MAX));
    Err(ClusterError::HostFailures(failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn hosts(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("10.0.0.{i}:22")).collect()
    }

    #[tokio::test]
    async fn test_all_hosts_run_and_failures_are_aggregated() {
        let done = Arc::new(AtomicUsize::new(0));
        let err = for_each_host(&hosts(5), 2, |host| {
            let done = Arc::clone(&done);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
                if host.starts_with("10.0.0.2") || host.starts_with("10.0.0.4") {
                    Err(ClusterError::remote(&host, "kubeadm join", "exit status 1"))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap_err();

        assert_eq!(done.load(Ordering::SeqCst), 5);
        match err {
            ClusterError::HostFailures(failures) => {
                let failed: Vec<_> = failures.iter().map(|f| f.host.as_str()).collect();
                assert_eq!(failed, vec!["10.0.0.2:22", "10.0.0.4:22"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for_each_host(&hosts(8), 3, |_| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_host_list_is_ok() {
        for_each_host(&[], 4, |_| async { Ok(()) }).await.unwrap();
    }
}
