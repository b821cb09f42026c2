//! Chart and render errors

use crds::ManifestError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while locating, fetching or loading a chart
#[derive(Debug, Error)]
pub enum ChartError {
    /// Filesystem access failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// `values.yaml`, `Chart.yaml` or a repository index is not valid YAML
    #[error("invalid YAML in {path}: {source}")]
    InvalidYaml {
        /// Offending document
        path: String,
        /// Parser error
        #[source]
        source: serde_yaml::Error,
    },

    /// The chart reference cannot be resolved
    #[error("invalid chart reference: {0}")]
    InvalidReference(String),

    /// The chart (or the requested version) does not exist
    #[error("chart {name} version {version} not found in {location}")]
    NotFound {
        /// Chart name
        name: String,
        /// Requested version (empty for "any")
        version: String,
        /// Repository or directory searched
        location: String,
    },

    /// Download from a chart repository failed
    #[error("HTTP error fetching {url}: {source}")]
    Http {
        /// Requested URL
        url: String,
        /// Client error
        #[source]
        source: reqwest::Error,
    },

    /// `values.yaml` parsed but is not a mapping
    #[error("values file {0} is not a mapping")]
    InvalidValues(PathBuf),

    /// The chart directory has no `templates/` subdirectory
    #[error("chart has no templates directory at {0}")]
    MissingTemplates(PathBuf),

    /// The blocking unpack/load task panicked or was cancelled
    #[error("chart loading task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ChartError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChartError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by the template engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// Template text could not be parsed
    #[error("parse error at line {line}: {message}")]
    Parse {
        /// 1-based source line
        line: usize,
        /// Description
        message: String,
    },

    /// Template failed during execution
    #[error("execution error: {0}")]
    Exec(String),
}

impl TemplateError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        TemplateError::Parse {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn exec(message: impl Into<String>) -> Self {
        TemplateError::Exec(message.into())
    }
}

/// Errors raised while turning a template into manifests
#[derive(Debug, Error)]
pub enum RenderError {
    /// Template expansion failed
    #[error("template {template}: {source}")]
    Template {
        /// Template path within the chart
        template: String,
        /// Engine error
        #[source]
        source: TemplateError,
    },

    /// Rendered text is not valid YAML
    #[error("template {template} document {document}: invalid YAML: {source}")]
    InvalidYaml {
        /// Template path within the chart
        template: String,
        /// 0-based document index
        document: usize,
        /// Parser error
        #[source]
        source: serde_yaml::Error,
    },

    /// Rendered document is not a Kubernetes object
    #[error("template {template} document {document}: {source}")]
    NotAnObject {
        /// Template path within the chart
        template: String,
        /// 0-based document index
        document: usize,
        /// Validation error
        #[source]
        source: ManifestError,
    },
}
