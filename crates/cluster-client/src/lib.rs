//! Kubernetes API gateway
//!
//! Every interaction the operator has with the cluster goes through the
//! [`ClusterClient`] trait, which works on dynamic objects ([`crds::Manifest`])
//! so arbitrary kinds can be applied without compile-time knowledge.
//!
//! - [`KubeClusterClient`] talks to a real API server through kube-rs and
//!   resolves kinds with API discovery.
//! - `MockClusterClient` (feature `test-util`) keeps objects in memory and
//!   records every call, for unit tests.

pub mod client;
pub mod error;
pub mod selector;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster_trait::ClusterClient;
pub use error::ClusterError;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{ClusterCall, MockClusterClient};
