//! Kind-aware create-or-update
//!
//! Every rendered manifest goes through [`Applier::prepare`] (namespacing,
//! release stamp, node selector injection) and is then created, or, when
//! it already exists, reconciled against the live object according to the
//! [`KindRegistry`] rules.

use crate::error::ControllerError;
use crate::reconciler::kinds::KindRegistry;
use cluster_client::{ClusterClient, ClusterError};
use crds::Manifest;
use crds::labels::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, RELEASE_NAME_ANNOTATION, RELEASE_NAMESPACE_ANNOTATION};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a create is retried while its kind is not yet served
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRATION_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Release a manifest is applied for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyTarget {
    /// SpecialResource name
    pub release_name: String,
    /// Namespace for namespaced children
    pub release_namespace: String,
    /// Terms merged into workload node selectors
    pub node_selector: BTreeMap<String, String>,
}

/// Result of applying one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Object did not exist and was created
    Created,
    /// Live object differed and was replaced
    Updated,
    /// Live object already matched, or its kind is never updated
    Unchanged,
}

impl ApplyOutcome {
    /// Lower-case name, used as the metrics label
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A manifest after apply
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// What happened
    pub outcome: ApplyOutcome,
    /// The prepared manifest that was submitted (namespace and stamp set)
    pub object: Manifest,
}

/// Applies prepared manifests through the cluster client
#[derive(Clone, Copy)]
pub struct Applier<'a> {
    client: &'a dyn ClusterClient,
    kinds: &'a KindRegistry,
}

impl<'a> Applier<'a> {
    /// Applier using `kinds` for per-kind rules
    pub fn new(client: &'a dyn ClusterClient, kinds: &'a KindRegistry) -> Self {
        Self { client, kinds }
    }

    /// Namespacing, release stamp and node selector injection
    pub fn prepare(&self, mut manifest: Manifest, target: &ApplyTarget) -> Manifest {
        let kind = manifest.kind().to_string();

        if self.kinds.is_cluster_scoped(&kind) {
            manifest.clear_namespace();
        } else if manifest.namespace().is_none_or(str::is_empty) {
            manifest.set_namespace(&target.release_namespace);
        }

        manifest.set_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        manifest.set_annotation(RELEASE_NAME_ANNOTATION, &target.release_name);
        manifest.set_annotation(RELEASE_NAMESPACE_ANNOTATION, &target.release_namespace);

        if let Some(path) = self.kinds.node_selector_path(&kind) {
            if !target.node_selector.is_empty() {
                let mut selector = manifest
                    .get(path)
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                for (key, value) in &target.node_selector {
                    selector.insert(key.clone(), Value::String(value.clone()));
                }
                manifest.set(path, Value::Object(selector));
            }
        }
        manifest
    }

    /// Prepares and applies one manifest
    pub async fn apply_one(&self, manifest: Manifest, target: &ApplyTarget) -> Result<Applied, ControllerError> {
        let desired = self.prepare(manifest, target);
        let outcome = match self.create(&desired).await {
            Ok(()) => ApplyOutcome::Created,
            Err(ClusterError::AlreadyExists(_)) => self.update(&desired).await?,
            Err(e) => return Err(ControllerError::from_apply(desired.key(), e)),
        };
        match outcome {
            ApplyOutcome::Unchanged => debug!("{} unchanged", desired),
            _ => info!("{} {}", desired, outcome),
        }
        Ok(Applied { outcome, object: desired })
    }

    /// Create, waiting for the kind to be served when its CRD was just applied
    async fn create(&self, desired: &Manifest) -> Result<(), ClusterError> {
        match self.client.create(desired).await {
            Err(ClusterError::KindNotRegistered(kind)) => {
                warn!("Kind {} not served yet, refreshing discovery", kind);
                self.client.refresh_discovery().await?;
                let deadline = Instant::now() + REGISTRATION_TIMEOUT;
                loop {
                    match self.client.create(desired).await {
                        Err(ClusterError::KindNotRegistered(_)) if Instant::now() < deadline => {
                            tokio::time::sleep(REGISTRATION_RETRY_INTERVAL).await;
                        }
                        result => return result.map(|_| ()),
                    }
                }
            }
            result => result.map(|_| ()),
        }
    }

    async fn update(&self, desired: &Manifest) -> Result<ApplyOutcome, ControllerError> {
        let key = desired.key();
        let kind = desired.kind();
        if self.kinds.is_immutable(kind) {
            return Ok(ApplyOutcome::Unchanged);
        }

        let live = match self.client.get(&key).await {
            Ok(live) => live,
            // Deleted between create and get
            Err(ClusterError::NotFound(message)) => {
                return Err(ControllerError::TransientApply {
                    target: key.to_string(),
                    message: format!("{message} after create reported it exists"),
                });
            }
            Err(e) => return Err(ControllerError::from_apply(&key, e)),
        };
        if desired.is_contained_in(&live) {
            return Ok(ApplyOutcome::Unchanged);
        }

        let mut updated = desired.clone();
        if self.kinds.carries_resource_version(kind) {
            if let Some(version) = live.resource_version() {
                updated.set(&["metadata", "resourceVersion"], Value::String(version.to_string()));
            }
        }
        if kind == "Service" {
            for field in ["clusterIP", "clusterIPs"] {
                if let Some(value) = live.get(&["spec", field]) {
                    updated.set(&["spec", field], value.clone());
                }
            }
        }

        self.client
            .update(&updated)
            .await
            .map_err(|e| ControllerError::from_apply(&key, e))?;
        Ok(ApplyOutcome::Updated)
    }
}
