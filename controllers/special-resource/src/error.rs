//! Controller-specific error types.
//!
//! Every reconcile failure is one of the variants below. Whether it is
//! retried with backoff or parked until the next spec change is decided by
//! [`ControllerError::is_transient`]; [`ControllerError::reason`] is the
//! stable name used for metrics labels and status messages.

use chart::{ChartError, RenderError};
use cluster_client::ClusterError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while recording or checking SpecialResource dependencies
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// Recording `child -> parent` would close a loop
    #[error("recording {child} -> {parent} would create a cycle ({})", chain.join(" -> "))]
    Cycle {
        /// Declared parent
        parent: String,
        /// Declaring child
        child: String,
        /// Ancestry walked from the child back to itself
        chain: Vec<String>,
    },

    /// A declared parent SpecialResource does not exist
    #[error("parent SpecialResource {parent} of {child} not found")]
    MissingParent {
        /// Declared parent
        parent: String,
        /// Declaring child
        child: String,
    },
}

/// Errors that can occur in the Special Resource Operator.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Invalid operator flags or SpecialResource spec
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Chart could not be located or loaded
    #[error("Chart error: {0}")]
    Chart(#[from] ChartError),

    /// Required node feature label absent
    #[error("Fingerprint error: {0}")]
    Fingerprint(String),

    /// Template expansion failed or produced a non-object document
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// API server rejected a create or update for good
    #[error("Apply of {target} rejected: {message}")]
    Apply {
        /// Object being applied
        target: String,
        /// Cause
        message: String,
    },

    /// Create or update failed in a way a retry may fix
    #[error("Apply of {target} failed, will retry: {message}")]
    TransientApply {
        /// Object being applied
        target: String,
        /// Cause
        message: String,
    },

    /// An object did not become ready before the state deadline
    #[error("{target} not ready after {timeout:?}")]
    ReadinessTimeout {
        /// Object being awaited
        target: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// An applied object was deleted while its readiness was awaited
    #[error("{0} disappeared while waiting for readiness")]
    NotFound(String),

    /// Dependency cycle or missing parent
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// Failure inside one state of the rollout
    #[error("state {state_key}: {source}")]
    State {
        /// Four digit order key
        state_key: String,
        /// Underlying failure
        #[source]
        source: Box<ControllerError>,
    },

    /// Whole reconcile ran past its deadline
    #[error("Reconcile did not finish within {0:?}")]
    ReconcileTimeout(Duration),

    /// Reconcile aborted because the operator is shutting down
    #[error("Reconcile cancelled")]
    Cancelled,

    /// Kubernetes API error outside the apply path
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Kubernetes client error (startup)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Leader lease could not be held
    #[error("Leader election lost: {0}")]
    LeaseLost(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Wraps `self` as a failure of the state `state_key`
    pub fn in_state(self, state_key: impl ToString) -> Self {
        ControllerError::State {
            state_key: state_key.to_string(),
            source: Box::new(self),
        }
    }

    /// Maps a cluster error raised while applying `target`
    pub fn from_apply(target: impl ToString, error: ClusterError) -> Self {
        if error.is_transient() {
            ControllerError::TransientApply {
                target: target.to_string(),
                message: error.to_string(),
            }
        } else {
            ControllerError::Apply {
                target: target.to_string(),
                message: error.to_string(),
            }
        }
    }

    /// True when the reconcile should be retried with backoff rather than
    /// waiting for the next spec change
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::TransientApply { .. }
            | ControllerError::ReadinessTimeout { .. }
            | ControllerError::ReconcileTimeout(_)
            | ControllerError::NotFound(_)
            | ControllerError::Cancelled
            | ControllerError::Kube(_)
            | ControllerError::Watch(_) => true,
            ControllerError::Chart(ChartError::Http { .. } | ChartError::Io { .. } | ChartError::Task(_)) => true,
            ControllerError::Cluster(error) => error.is_transient(),
            ControllerError::State { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Taxonomy name, used as the `reason` metrics label
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Config(_) | ControllerError::Chart(_) => "ConfigError",
            ControllerError::Fingerprint(_) => "FingerprintError",
            ControllerError::Render(_) => "RenderError",
            ControllerError::Apply { .. } => "ApplyError",
            ControllerError::TransientApply { .. } => "TransientApplyError",
            ControllerError::ReadinessTimeout { .. } | ControllerError::ReconcileTimeout(_) => "ReadinessTimeout",
            ControllerError::NotFound(_) => "NotFound",
            ControllerError::Dependency(_) => "DependencyError",
            ControllerError::State { source, .. } => source.reason(),
            ControllerError::Cancelled => "Cancelled",
            ControllerError::Cluster(_) | ControllerError::Kube(_) => "ClusterError",
            ControllerError::Metrics(_) | ControllerError::LeaseLost(_) | ControllerError::Watch(_) => "ManagerError",
        }
    }

    /// Order key of the failing state, when the failure happened inside one
    pub fn state_key(&self) -> Option<&str> {
        match self {
            ControllerError::State { state_key, .. } => Some(state_key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_transience() {
        let transient = [
            ControllerError::TransientApply { target: "x".into(), message: "conflict".into() },
            ControllerError::ReadinessTimeout { target: "x".into(), timeout: Duration::from_secs(1) },
            ControllerError::Cluster(ClusterError::Conflict("cm".into())),
        ];
        for error in transient {
            assert!(error.is_transient(), "{error} should be transient");
        }

        let permanent = [
            ControllerError::Config("bad".into()),
            ControllerError::Fingerprint("no kernel label".into()),
            ControllerError::Apply { target: "x".into(), message: "forbidden".into() },
            ControllerError::Dependency(DependencyError::MissingParent { parent: "p".into(), child: "c".into() }),
            ControllerError::Chart(ChartError::InvalidReference("no name".into())),
        ];
        for error in permanent {
            assert!(!error.is_transient(), "{error} should be permanent");
        }
    }

    #[test]
    fn test_state_error_delegates_to_cause() {
        let error = ControllerError::ReadinessTimeout { target: "DaemonSet kmods/driver".into(), timeout: Duration::from_secs(600) }
            .in_state("0020");
        assert!(error.is_transient());
        assert_eq!(error.reason(), "ReadinessTimeout");
        assert_eq!(error.state_key(), Some("0020"));
        assert!(error.to_string().starts_with("state 0020: DaemonSet kmods/driver not ready"));
    }

    #[test]
    fn test_apply_classification() {
        let transient = ControllerError::from_apply("Build kmods/b", ClusterError::KindNotRegistered("build.openshift.io/v1/Build".into()));
        assert_eq!(transient.reason(), "TransientApplyError");
        let rejected = ControllerError::from_apply(
            "Role kmods/r",
            ClusterError::Rejected { target: "Role kmods/r".into(), code: 403, message: "forbidden".into() },
        );
        assert_eq!(rejected.reason(), "ApplyError");
        assert!(!rejected.is_transient());
    }

    #[test]
    fn test_cycle_message_lists_chain() {
        let error = DependencyError::Cycle {
            parent: "a".into(),
            child: "b".into(),
            chain: vec!["b".into(), "a".into(), "b".into()],
        };
        assert_eq!(error.to_string(), "recording b -> a would create a cycle (b -> a -> b)");
    }
}
