//! Chart handling for the Special Resource Operator
//!
//! - [`fetch`] resolves a chart reference (local path, `file://` directory
//!   or HTTP chart repository) to a directory and [`loader`] reads it
//! - [`values`] layers chart defaults, parent outputs, the node
//!   [`fingerprint`] and user values
//! - [`template`] is the Helm-dialect template engine and [`render`] turns
//!   templates into state-tagged manifests

pub mod error;
pub mod fetch;
pub mod fingerprint;
pub mod loader;
pub mod render;
pub mod template;
pub mod values;

pub use error::{ChartError, RenderError, TemplateError};
pub use fetch::ChartFetcher;
pub use fingerprint::NodeFingerprint;
pub use loader::{Chart, ChartMetadata, ChartTemplate, StateKey, load_dir, parse_state_key};
pub use render::{Release, RenderedManifest, State, group_states, render_chart};
pub use values::{RESERVED_KEYS, compose, deep_merge};
