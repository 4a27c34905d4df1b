//! Retry of transport failures.
//!
//! Only failures of the link are retried: ssh's own exit status 255,
//! timeouts, refused or dropped connections. A command that ran on the host
//! and failed is returned on the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{ClusterError, Result};

/// Exit status ssh and scp report when the connection itself failed.
const SSH_TRANSPORT_STATUS: &str = "exit status: 255";

/// Lowercase fragments of OpenSSH diagnostics that mean the link failed.
const TRANSPORT_MARKERS: &[&str] = &[
    "timed out",
    "connection refused",
    "connection reset",
    "connection closed",
    "lost connection",
    "no route to host",
    "network is unreachable",
    "kex_exchange_identification",
];

/// How often and how patiently transport failures are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRetry {
    /// Total attempts, the first included.
    pub attempts: u32,
    /// Pause before the second attempt, doubled for every later one.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl TransportRetry {
    /// Pause after failed attempt number `attempt`, counting from 1.
    fn pause(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_backoff)
    }
}

/// Whether `err` came from the link to the host rather than the command.
#[must_use]
pub fn is_transport_failure(err: &ClusterError) -> bool {
    match err {
        ClusterError::Remote { message, .. } => {
            let message = message.to_lowercase();
            message.starts_with(SSH_TRANSPORT_STATUS)
                || TRANSPORT_MARKERS.iter().any(|m| message.contains(m))
        }
        _ => false,
    }
}

/// Run `op` against `host`, retrying transport failures per `policy`.
///
/// # Errors
///
/// Returns the first non-transport error, or the last transport error once
/// the attempts are used up.
pub async fn retry_transport<T, F, Fut>(
    policy: &TransportRetry,
    host: &str,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if attempt < policy.attempts && is_transport_failure(&e) => {
                let pause = policy.pause(attempt);
                warn!(
                    host,
                    what,
                    attempt,
                    error = %e,
                    "transport failure, retrying in {pause:?}"
                );
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> TransportRetry {
        TransportRetry {
            attempts: 3,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_link_failures_are_told_apart_from_command_failures() {
        let remote = |message: &str| ClusterError::remote("10.0.0.1:22", "true", message);
        assert!(is_transport_failure(&remote(
            "exit status: 255: ssh: connect to host 10.0.0.1 port 22: Connection refused"
        )));
        assert!(is_transport_failure(&remote("timed out after 600s")));
        assert!(is_transport_failure(&remote("exit status: 1: lost connection")));
        assert!(!is_transport_failure(&remote(
            "exit status: 1: kubeadm: command not found"
        )));
        assert!(!is_transport_failure(&ClusterError::Validation(
            "timed out".into()
        )));
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let policy = TransportRetry::default();
        assert_eq!(policy.pause(1), Duration::from_secs(1));
        assert_eq!(policy.pause(3), Duration::from_secs(4));
        assert_eq!(policy.pause(9), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_refused_connection_is_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = retry_transport(&fast(), "10.0.0.1:22", "ping", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ClusterError::remote(
                    "10.0.0.1:22",
                    "true",
                    "exit status: 255: Connection refused",
                ))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_command_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = retry_transport(&fast(), "10.0.0.1:22", "copy", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ClusterError::remote(
                "10.0.0.1:22",
                "mkdir -p /var/lib/sealos",
                "exit status: 1: permission denied",
            ))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ClusterError::Remote { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_the_last_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = retry_transport(&fast(), "10.0.0.1:22", "fetch", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ClusterError::remote("10.0.0.1:22", "scp", "timed out after 1s"))
        })
        .await
        .unwrap_err();
        assert!(is_transport_failure(&err));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
