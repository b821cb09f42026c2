//! Node fingerprint resolution
//!
//! The fingerprint is read from the node-feature-discovery labels of a
//! representative worker: the first worker node, by name, that also matches
//! the SpecialResource's own node selector.

use crate::error::ControllerError;
use chart::NodeFingerprint;
use cluster_client::ClusterClient;
use crds::Manifest;
use crds::labels::{
    KERNEL_VERSION_LABEL, OS_RELEASE_ID_LABEL, OS_VERSION_LABEL, OS_VERSION_MAJOR_LABEL, OS_VERSION_MINOR_LABEL,
    PLATFORM_VERSION_LABEL, WORKER_ROLE_LABEL,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Fingerprint plus the selector terms that pin workloads to matching nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFingerprint {
    /// Kernel and OS identity
    pub fingerprint: NodeFingerprint,
    /// Node the labels were read from
    pub node: String,
    /// Terms merged into workload node selectors
    pub node_selector: BTreeMap<String, String>,
}

/// Reads the fingerprint of the representative worker node
pub async fn resolve(
    client: &dyn ClusterClient,
    extra_selector: &BTreeMap<String, String>,
) -> Result<ResolvedFingerprint, ControllerError> {
    let selector = std::iter::once(WORKER_ROLE_LABEL.to_string())
        .chain(extra_selector.iter().map(|(key, value)| format!("{key}={value}")))
        .collect::<Vec<_>>()
        .join(",");
    let mut nodes = client.list("v1", "Node", None, Some(&selector)).await?;
    nodes.sort_by(|a, b| a.name().cmp(b.name()));
    let node = nodes
        .first()
        .ok_or_else(|| ControllerError::Fingerprint(format!("no worker node matches {selector}")))?;

    let resolved = from_node(node, extra_selector)?;
    debug!(
        "Fingerprint from node {}: kernel {} on {} {}",
        resolved.node,
        resolved.fingerprint.kernel_full_version,
        resolved.fingerprint.operating_system,
        resolved.fingerprint.os_version
    );
    Ok(resolved)
}

/// Builds the fingerprint from one node's labels
pub fn from_node(node: &Manifest, extra_selector: &BTreeMap<String, String>) -> Result<ResolvedFingerprint, ControllerError> {
    let missing = |label: &str| ControllerError::Fingerprint(format!("node {} has no {} label", node.name(), label));
    let label = |key: &str| node.label(key).filter(|v| !v.is_empty());

    let kernel = label(KERNEL_VERSION_LABEL).ok_or_else(|| missing(KERNEL_VERSION_LABEL))?;
    let os_id = label(OS_RELEASE_ID_LABEL).ok_or_else(|| missing(OS_RELEASE_ID_LABEL))?;

    let mut node_selector = extra_selector.clone();
    node_selector.insert(KERNEL_VERSION_LABEL.to_string(), kernel.to_string());

    let os_version = if let Some(version) = label(OS_VERSION_LABEL) {
        node_selector.insert(OS_VERSION_LABEL.to_string(), version.to_string());
        version.to_string()
    } else {
        let major = label(OS_VERSION_MAJOR_LABEL).ok_or_else(|| missing(OS_VERSION_LABEL))?;
        node_selector.insert(OS_VERSION_MAJOR_LABEL.to_string(), major.to_string());
        match label(OS_VERSION_MINOR_LABEL) {
            Some(minor) => {
                node_selector.insert(OS_VERSION_MINOR_LABEL.to_string(), minor.to_string());
                format!("{major}.{minor}")
            }
            None => major.to_string(),
        }
    };

    let operating_system = if os_id == "rhcos" { "rhel" } else { os_id };

    Ok(ResolvedFingerprint {
        fingerprint: NodeFingerprint {
            kernel_full_version: kernel.to_string(),
            operating_system: operating_system.to_string(),
            os_version,
            cluster_version: label(PLATFORM_VERSION_LABEL).unwrap_or_default().to_string(),
        },
        node: node.name().to_string(),
        node_selector,
    })
}
