//! Error types for cluster lifecycle operations.

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

/// A failure recorded for a single host during a fan-out step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    /// Host address (`ip:port`).
    pub host: String,
    /// Rendered error message.
    pub message: String,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.host, self.message)
    }
}

/// Errors that can occur while reconciling a cluster.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Reachability or runtime checks failed before anything was mutated.
    #[error("preflight check failed: {0}")]
    Preflight(String),

    /// Runtime or image context could not be rebuilt from stored state.
    #[error("failed to prepare cluster context: {0}")]
    PreProcess(String),

    /// A named pipeline step failed.
    #[error("step '{step}' failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<ClusterError>,
    },

    /// One or more hosts failed during a parallel step.
    #[error("{} host(s) failed: {}", .0.len(), join_failures(.0))]
    HostFailures(Vec<HostFailure>),

    /// The operator declined to continue.
    #[error("operation cancelled")]
    Cancelled,

    /// Input did not pass validation.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// master0 anchors the control-plane endpoint and cannot be removed.
    #[error("master0 {0} cannot be deleted")]
    Master0Deletion(String),

    /// A remote command exited non-zero or returned unusable output.
    #[error("remote command on {host} failed: {message} (command: {command})")]
    Remote {
        host: String,
        command: String,
        message: String,
    },

    /// Image service failure.
    #[error("image error: {0}")]
    Image(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization failure.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ClusterError {
    /// Build a [`ClusterError::Remote`] for `host` running `command`.
    pub fn remote(host: &str, command: &str, message: impl Into<String>) -> Self {
        Self::Remote {
            host: host.to_string(),
            command: command.to_string(),
            message: message.into(),
        }
    }

    /// Wrap this error with the identity of the pipeline step it came from.
    #[must_use]
    pub fn in_step(self, step: &'static str) -> Self {
        Self::Step {
            step,
            source: Box::new(self),
        }
    }

    /// Whether this error (possibly wrapped by a step) is the cancellation sentinel.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Step { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// The innermost error, skipping step wrappers.
    #[must_use]
    pub fn root(&self) -> &ClusterError {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_seen_through_step_wrapping() {
        let err = ClusterError::Cancelled.in_step("join masters").in_step("outer");
        assert!(err.is_cancelled());
        assert!(matches!(err.root(), ClusterError::Cancelled));
        assert!(!ClusterError::Preflight("x".into()).is_cancelled());
    }

    #[test]
    fn test_host_failures_display_lists_every_host() {
        let err = ClusterError::HostFailures(vec![
            HostFailure {
                host: "10.0.0.2:22".into(),
                message: "timeout".into(),
            },
            HostFailure {
                host: "10.0.0.3:22".into(),
                message: "exit 1".into(),
            },
        ]);
        let rendered = err.to_string();
        assert!(rendered.starts_with("2 host(s) failed"));
        assert!(rendered.contains("10.0.0.2:22: timeout"));
        assert!(rendered.contains("10.0.0.3:22: exit 1"));
    }

    #[test]
    fn test_step_display_names_the_step() {
        let err = ClusterError::Validation("bad".into()).in_step("init master0");
        assert_eq!(
            err.to_string(),
            "step 'init master0' failed: invalid configuration: bad"
        );
    }
}
