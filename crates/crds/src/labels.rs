//! Label, annotation and well-known name constants.
//!
//! Every object the operator applies carries the release stamp defined here,
//! which is also how ownership is reconstructed from live cluster state.

// ============================================================================
// Release stamp
// ============================================================================

/// Standard label for the tool managing the object
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of `app.kubernetes.io/managed-by` on every applied object
pub const MANAGED_BY_VALUE: &str = "Helm";

/// Annotation carrying the owning SpecialResource name
pub const RELEASE_NAME_ANNOTATION: &str = "meta.helm.sh/release-name";

/// Annotation carrying the owning SpecialResource target namespace
pub const RELEASE_NAMESPACE_ANNOTATION: &str = "meta.helm.sh/release-namespace";

// ============================================================================
// Operator-owned objects
// ============================================================================

/// Finalizer placed on every SpecialResource so deletion passes through teardown
pub const FINALIZER: &str = "sro.openshift.io/finalizer";

/// ConfigMap (in the operator namespace) holding the child -> parent mapping
pub const DEPENDENCY_CONFIGMAP: &str = "special-resource-dependencies";

// ============================================================================
// Node feature discovery labels
// ============================================================================

/// Full kernel version of the node
pub const KERNEL_VERSION_LABEL: &str = "feature.node.kubernetes.io/kernel-version.full";

/// OS release family (e.g. "rhcos", "rhel", "ubuntu")
pub const OS_RELEASE_ID_LABEL: &str = "feature.node.kubernetes.io/system-os_release.ID";

/// Full OS release version (e.g. "8.4")
pub const OS_VERSION_LABEL: &str = "feature.node.kubernetes.io/system-os_release.VERSION_ID";

/// OS release major version
pub const OS_VERSION_MAJOR_LABEL: &str = "feature.node.kubernetes.io/system-os_release.VERSION_ID.major";

/// OS release minor version
pub const OS_VERSION_MINOR_LABEL: &str = "feature.node.kubernetes.io/system-os_release.VERSION_ID.minor";

/// Platform release version (OSTree version on RHCOS nodes)
pub const PLATFORM_VERSION_LABEL: &str = "feature.node.kubernetes.io/system-os_release.OSTREE_VERSION";

/// Role label selecting worker nodes
pub const WORKER_ROLE_LABEL: &str = "node-role.kubernetes.io/worker";
