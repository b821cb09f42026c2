//! Cluster client errors

use crds::ManifestError;
use thiserror::Error;

/// Errors that can occur when talking to the Kubernetes API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Create was rejected because the object exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Object does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Optimistic concurrency check failed (stale resourceVersion)
    #[error("conflict updating {0}")]
    Conflict(String),

    /// The API server does not serve this group/version/kind (yet)
    #[error("kind {0} is not registered in the cluster")]
    KindNotRegistered(String),

    /// API server rejected the request
    #[error("API rejected {target}: {code} {message}")]
    Rejected {
        /// Object or collection the request targeted
        target: String,
        /// HTTP status code
        code: u16,
        /// Server supplied message
        message: String,
    },

    /// Transport or client-side error
    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object returned by the server is not a usable manifest
    #[error("Invalid object: {0}")]
    InvalidObject(#[from] ManifestError),
}

impl ClusterError {
    /// True for errors a later retry may resolve (conflicts, unregistered
    /// kinds, throttling, server-side unavailability, transport failures)
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::Conflict(_) | ClusterError::KindNotRegistered(_) | ClusterError::Kube(_) => true,
            ClusterError::Rejected { code, .. } => matches!(code, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// True when a collection cannot be listed at all: the resource is gone,
    /// or listing it is forbidden or not allowed. Such kinds hold nothing the
    /// operator could have created.
    pub fn is_unlistable(&self) -> bool {
        match self {
            ClusterError::NotFound(_) | ClusterError::KindNotRegistered(_) => true,
            ClusterError::Rejected { code, .. } => matches!(code, 403 | 405),
            _ => false,
        }
    }

    /// Maps a kube-rs error for `target` onto the operator's error kinds
    pub fn from_kube(target: &str, error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => match response.code {
                404 => ClusterError::NotFound(target.to_string()),
                409 if response.reason == "AlreadyExists" => ClusterError::AlreadyExists(target.to_string()),
                409 => ClusterError::Conflict(target.to_string()),
                code => ClusterError::Rejected {
                    target: target.to_string(),
                    code,
                    message: response.message.clone(),
                },
            },
            other => ClusterError::Kube(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClusterError::Conflict("cm".into()).is_transient());
        assert!(ClusterError::KindNotRegistered("Build".into()).is_transient());
        assert!(
            ClusterError::Rejected { target: "x".into(), code: 503, message: String::new() }.is_transient()
        );
        assert!(
            !ClusterError::Rejected { target: "x".into(), code: 422, message: "invalid".into() }.is_transient()
        );
        assert!(!ClusterError::NotFound("x".into()).is_transient());
        assert!(!ClusterError::AlreadyExists("x".into()).is_transient());
    }

    #[test]
    fn test_unlistable_classification() {
        let rejected = |code| ClusterError::Rejected { target: "apps/v1/DaemonSet".into(), code, message: String::new() };
        assert!(ClusterError::NotFound("x".into()).is_unlistable());
        assert!(rejected(403).is_unlistable());
        assert!(rejected(405).is_unlistable());
        assert!(!rejected(429).is_unlistable());
        assert!(!rejected(503).is_unlistable());
        assert!(!ClusterError::Conflict("x".into()).is_unlistable());
    }
}
