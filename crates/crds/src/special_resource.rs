//! SpecialResource CRD
//!
//! A SpecialResource declares that a chart should be rendered against the
//! cluster's node fingerprint and rolled out state by state. It is
//! cluster-scoped; its namespaced children land in `spec.namespace`.

use crate::manifest::ObjectKey;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// SpecialResourceSpec defines the desired state of a special resource
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "sro.openshift.io",
    version = "v1beta1",
    kind = "SpecialResource",
    plural = "specialresources",
    shortname = "sr",
    status = "SpecialResourceStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpecialResourceSpec {
    /// Chart to render
    pub chart: ChartReference,

    /// Target namespace for namespaced children
    #[serde(default)]
    pub namespace: String,

    /// Free-form values overriding the chart defaults
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub set: serde_json::Map<String, serde_json::Value>,

    /// Names of SpecialResources that must be Ready before this one is applied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Extra node selector terms merged into workloads
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Reference to a chart, either in a repository or on the local filesystem
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartReference {
    /// Chart name
    #[serde(default)]
    pub name: String,

    /// Chart version
    #[serde(default)]
    pub version: String,

    /// Repository URL (`https://...` chart repository or `file:///dir`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,

    /// Local chart directory or archive, takes precedence over `repository`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Reconcile state of a SpecialResource
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum SpecialResourceState {
    /// Spec seen, dependencies and fingerprint being resolved
    #[default]
    Resolving,
    /// A declared parent is not Ready yet
    AwaitingParent,
    /// Chart loaded and templates being rendered
    Rendering,
    /// States being applied to the cluster
    Applying,
    /// Every state applied and ready
    Ready,
    /// Reconcile failed, see `lastError`
    Failed,
    /// Deletion in progress
    Tearing,
}

impl SpecialResourceState {
    /// PascalCase name matching the CRD schema
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialResourceState::Resolving => "Resolving",
            SpecialResourceState::AwaitingParent => "AwaitingParent",
            SpecialResourceState::Rendering => "Rendering",
            SpecialResourceState::Applying => "Applying",
            SpecialResourceState::Ready => "Ready",
            SpecialResourceState::Failed => "Failed",
            SpecialResourceState::Tearing => "Tearing",
        }
    }
}

impl fmt::Display for SpecialResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state, owned by the controller
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpecialResourceStatus {
    /// Current state
    pub state: SpecialResourceState,

    /// Human readable cause, set when `state` is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Spec generation this status reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// `apiVersion` of SpecialResource objects
pub const SPECIAL_RESOURCE_API_VERSION: &str = "sro.openshift.io/v1beta1";

/// `kind` of SpecialResource objects
pub const SPECIAL_RESOURCE_KIND: &str = "SpecialResource";

impl SpecialResource {
    /// Dynamic-object key of the SpecialResource called `name`
    pub fn key_for(name: &str) -> ObjectKey {
        ObjectKey::cluster(SPECIAL_RESOURCE_API_VERSION, SPECIAL_RESOURCE_KIND, name)
    }

    /// Object name (empty when unset, which the API server never allows)
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Namespace for namespaced children, stamped into
    /// `meta.helm.sh/release-namespace`. Defaults to the object name.
    pub fn release_namespace(&self) -> &str {
        if self.spec.namespace.is_empty() {
            self.name()
        } else {
            &self.spec.namespace
        }
    }

    /// Current state, `None` before the first status write
    pub fn state(&self) -> Option<SpecialResourceState> {
        self.status.as_ref().map(|s| s.state)
    }

    /// True once every state of the current generation has been applied and
    /// reported ready
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|status| {
            status.state == SpecialResourceState::Ready && status.observed_generation == self.metadata.generation
        })
    }

    /// True once a deletion timestamp is set
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}
