//! Special Resource Operator CRD Definitions
//!
//! Kubernetes Custom Resource Definitions and the shared object types used by
//! the chart renderer, the cluster client and the operator.

pub mod labels;
pub mod manifest;
pub mod special_resource;

pub use manifest::*;
pub use special_resource::*;
