//! Per-kind apply rules
//!
//! The applier and readiness poller never match on kind names directly;
//! they ask the [`KindRegistry`]. Lookups are case-insensitive, which also
//! makes `StatefulSet` and `Statefulset` the same kind.

use std::collections::{HashMap, HashSet};

/// Kinds without a namespace
const CLUSTER_SCOPED: [&str; 6] = [
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "SecurityContextConstraint",
    "SecurityContextConstraints",
    "SpecialResource",
];

/// Kinds whose update must carry the live `metadata.resourceVersion`
const RESOURCE_VERSION_CARRYING: [&str; 19] = [
    "SecurityContextConstraints",
    "Service",
    "ServiceMonitor",
    "Route",
    "Build",
    "BuildRun",
    "BuildConfig",
    "ImageStream",
    "PrometheusRule",
    "CSIDriver",
    "Issuer",
    "CustomResourceDefinition",
    "Certificate",
    "SpecialResource",
    "OperatorGroup",
    "CertManager",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "Deployment",
];

/// Kinds left alone once they exist
const IMMUTABLE_ON_UPDATE: [&str; 2] = ["ServiceAccount", "Pod"];

const POD_TEMPLATE_NODE_SELECTOR: &[&str] = &["spec", "template", "spec", "nodeSelector"];
const POD_NODE_SELECTOR: &[&str] = &["spec", "nodeSelector"];

/// How readiness of a kind is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessRule {
    /// `readyReplicas == spec.replicas` at the current generation
    Replicas,
    /// Every scheduled pod available, at least one scheduled
    DaemonSet,
    /// `restartPolicy: Never` pods must reach `Succeeded`
    OneTimerPod,
    /// `status.phase == Complete`
    Build,
    /// The most recent Build of the config is complete
    BuildConfig,
}

/// Kind tables consulted by the applier and the readiness poller
#[derive(Debug, Clone)]
pub struct KindRegistry {
    cluster_scoped: HashSet<String>,
    resource_version: HashSet<String>,
    immutable: HashSet<String>,
    node_selector_paths: HashMap<String, &'static [&'static str]>,
    readiness: HashMap<String, ReadinessRule>,
}

fn normalize(kind: &str) -> String {
    kind.to_ascii_lowercase()
}

impl Default for KindRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for kind in CLUSTER_SCOPED {
            registry.register_cluster_scoped(kind);
        }
        for kind in RESOURCE_VERSION_CARRYING {
            registry.register_resource_version_carrying(kind);
        }
        for kind in IMMUTABLE_ON_UPDATE {
            registry.register_immutable(kind);
        }
        registry.register_node_selector_path("DaemonSet", POD_TEMPLATE_NODE_SELECTOR);
        registry.register_node_selector_path("Pod", POD_NODE_SELECTOR);
        registry.register_node_selector_path("BuildConfig", POD_NODE_SELECTOR);

        registry.register_readiness("Deployment", ReadinessRule::Replicas);
        registry.register_readiness("StatefulSet", ReadinessRule::Replicas);
        registry.register_readiness("DaemonSet", ReadinessRule::DaemonSet);
        registry.register_readiness("Pod", ReadinessRule::OneTimerPod);
        registry.register_readiness("Build", ReadinessRule::Build);
        registry.register_readiness("BuildConfig", ReadinessRule::BuildConfig);
        registry
    }
}

impl KindRegistry {
    /// Registry with no rules at all
    pub fn empty() -> Self {
        Self {
            cluster_scoped: HashSet::new(),
            resource_version: HashSet::new(),
            immutable: HashSet::new(),
            node_selector_paths: HashMap::new(),
            readiness: HashMap::new(),
        }
    }

    /// Marks `kind` as cluster-scoped
    pub fn register_cluster_scoped(&mut self, kind: &str) {
        self.cluster_scoped.insert(normalize(kind));
    }

    /// Marks `kind` as requiring the live resourceVersion on update
    pub fn register_resource_version_carrying(&mut self, kind: &str) {
        self.resource_version.insert(normalize(kind));
    }

    /// Marks `kind` as never updated once it exists
    pub fn register_immutable(&mut self, kind: &str) {
        self.immutable.insert(normalize(kind));
    }

    /// Sets where fingerprint node selector terms are merged for `kind`
    pub fn register_node_selector_path(&mut self, kind: &str, path: &'static [&'static str]) {
        self.node_selector_paths.insert(normalize(kind), path);
    }

    /// Sets the readiness rule for `kind`
    pub fn register_readiness(&mut self, kind: &str, rule: ReadinessRule) {
        self.readiness.insert(normalize(kind), rule);
    }

    /// True for kinds that must not carry `metadata.namespace`
    pub fn is_cluster_scoped(&self, kind: &str) -> bool {
        self.cluster_scoped.contains(&normalize(kind))
    }

    /// True for kinds whose update carries the live resourceVersion
    pub fn carries_resource_version(&self, kind: &str) -> bool {
        self.resource_version.contains(&normalize(kind))
    }

    /// True for kinds that are not updated once they exist
    pub fn is_immutable(&self, kind: &str) -> bool {
        self.immutable.contains(&normalize(kind))
    }

    /// Node selector location for `kind`, if it gets fingerprint terms
    pub fn node_selector_path(&self, kind: &str) -> Option<&'static [&'static str]> {
        self.node_selector_paths.get(&normalize(kind)).copied()
    }

    /// Readiness rule for `kind`; `None` means ready once applied
    pub fn readiness(&self, kind: &str) -> Option<ReadinessRule> {
        self.readiness.get(&normalize(kind)).copied()
    }
}
