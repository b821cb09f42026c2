//! ClusterClient trait for mocking
//!
//! This trait abstracts the Kubernetes API so reconciler logic can be unit
//! tested against an in-memory implementation. All async methods must be
//! `Send` to work with Tokio's work-stealing runtime.

use crate::error::ClusterError;
use crds::{Manifest, ObjectKey};

/// Operations the operator performs against the Kubernetes API
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch one object
    async fn get(&self, key: &ObjectKey) -> Result<Manifest, ClusterError>;

    /// Create an object; fails with `AlreadyExists` when it exists
    async fn create(&self, object: &Manifest) -> Result<Manifest, ClusterError>;

    /// Replace an object. A `metadata.resourceVersion` on `object` makes the
    /// write conditional (fails with `Conflict` when stale).
    async fn update(&self, object: &Manifest) -> Result<Manifest, ClusterError>;

    /// Delete an object (background propagation); NotFound is an error
    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError>;

    /// List objects of one kind, optionally namespaced and label-filtered
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Manifest>, ClusterError>;

    /// List objects matching `label_selector` across every listable kind
    async fn list_all_kinds(&self, label_selector: &str) -> Result<Vec<Manifest>, ClusterError>;

    /// JSON merge patch on the main resource
    async fn patch_merge(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<Manifest, ClusterError>;

    /// JSON merge patch on the status subresource
    async fn patch_status(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<Manifest, ClusterError>;

    /// Drop cached kind mappings so newly registered kinds are picked up
    async fn refresh_discovery(&self) -> Result<(), ClusterError>;
}
