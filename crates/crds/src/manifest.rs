//! Dynamic Kubernetes objects
//!
//! Rendered manifests and live cluster objects are handled as JSON-shaped
//! documents so the operator can apply arbitrary kinds without compile-time
//! knowledge of them. `Manifest` wraps such a document and provides
//! path-addressed getters and setters for the handful of fields the operator
//! touches (namespace, labels, annotations, node selectors, status fields).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors raised when a document is not a usable Kubernetes object
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// Document is not a mapping
    #[error("document is not an object")]
    NotAnObject,

    /// A required field is absent or empty
    #[error("missing required field {0}")]
    MissingField(&'static str),
}

/// Identity of an object in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// `apiVersion`, e.g. `apps/v1`
    pub api_version: String,
    /// `kind`, e.g. `DaemonSet`
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// `metadata.name`
    pub name: String,
}

impl ObjectKey {
    /// Creates a key for a namespaced object
    pub fn namespaced(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Creates a key for a cluster-scoped object
    pub fn cluster(api_version: &str, kind: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: None,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A Kubernetes object held as a JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Value);

impl Manifest {
    /// Wraps a document, validating `apiVersion`, `kind` and `metadata.name`
    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        if !value.is_object() {
            return Err(ManifestError::NotAnObject);
        }
        let manifest = Self(value);
        if manifest.api_version().is_empty() {
            return Err(ManifestError::MissingField("apiVersion"));
        }
        if manifest.kind().is_empty() {
            return Err(ManifestError::MissingField("kind"));
        }
        if manifest.name().is_empty() {
            return Err(ManifestError::MissingField("metadata.name"));
        }
        Ok(manifest)
    }

    /// Builds a minimal object with type and name set
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        Self(serde_json::json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "name": name },
        }))
    }

    /// `apiVersion`, empty when absent
    pub fn api_version(&self) -> &str {
        self.get_str(&["apiVersion"]).unwrap_or_default()
    }

    /// `kind`, empty when absent
    pub fn kind(&self) -> &str {
        self.get_str(&["kind"]).unwrap_or_default()
    }

    /// `metadata.name`, empty when absent
    pub fn name(&self) -> &str {
        self.get_str(&["metadata", "name"]).unwrap_or_default()
    }

    /// `metadata.namespace`
    pub fn namespace(&self) -> Option<&str> {
        self.get_str(&["metadata", "namespace"]).filter(|ns| !ns.is_empty())
    }

    /// Sets `metadata.namespace`
    pub fn set_namespace(&mut self, namespace: &str) {
        self.set(&["metadata", "namespace"], Value::String(namespace.to_string()));
    }

    /// Removes `metadata.namespace`
    pub fn clear_namespace(&mut self) {
        self.remove(&["metadata", "namespace"]);
    }

    /// `metadata.resourceVersion`
    pub fn resource_version(&self) -> Option<&str> {
        self.get_str(&["metadata", "resourceVersion"])
    }

    /// `metadata.generation`
    pub fn generation(&self) -> Option<i64> {
        self.get_i64(&["metadata", "generation"])
    }

    /// Label value
    pub fn label(&self, key: &str) -> Option<&str> {
        self.get(&["metadata", "labels", key]).and_then(Value::as_str)
    }

    /// Sets a label, creating `metadata.labels` when needed
    pub fn set_label(&mut self, key: &str, value: &str) {
        self.set(&["metadata", "labels", key], Value::String(value.to_string()));
    }

    /// Annotation value
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.get(&["metadata", "annotations", key]).and_then(Value::as_str)
    }

    /// Sets an annotation, creating `metadata.annotations` when needed
    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.set(&["metadata", "annotations", key], Value::String(value.to_string()));
    }

    /// Identity of this object
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            api_version: self.api_version().to_string(),
            kind: self.kind().to_string(),
            namespace: self.namespace().map(str::to_string),
            name: self.name().to_string(),
        }
    }

    /// Value at `path`
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.0, |node, segment| node.get(segment))
    }

    /// String at `path`
    pub fn get_str(&self, path: &[&str]) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Integer at `path`
    pub fn get_i64(&self, path: &[&str]) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    /// Sets `path` to `value`, creating (or replacing non-object) intermediate nodes
    pub fn set(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            self.0 = value;
            return;
        };
        let mut node = &mut self.0;
        for segment in parents {
            node = ensure_object(node)
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        ensure_object(node).insert((*last).to_string(), value);
    }

    /// Removes and returns the value at `path`
    pub fn remove(&mut self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let mut node = &mut self.0;
        for segment in parents {
            node = node.get_mut(*segment)?;
        }
        node.as_object_mut()?.remove(*last)
    }

    /// Borrow the underlying document
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume into the underlying document
    pub fn into_value(self) -> Value {
        self.0
    }

    /// True when every field set in `self` holds the same value in `live`.
    ///
    /// Fields the API server adds (status, defaults, metadata bookkeeping)
    /// are ignored, so a rendered manifest that was already applied compares
    /// as contained in its live counterpart.
    pub fn is_contained_in(&self, live: &Manifest) -> bool {
        value_contained_in(&self.0, &live.0)
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced by an object"),
    }
}

fn value_contained_in(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, value)| match have.get(key) {
            Some(live_value) => value_contained_in(value, live_value),
            None => value.is_null(),
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| value_contained_in(w, h))
        }
        (Value::Number(want), Value::Number(have)) => want.as_f64() == have.as_f64(),
        _ => desired == live,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn daemonset() -> Manifest {
        Manifest::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": { "name": "kmod-driver" },
            "spec": { "template": { "spec": { "containers": [{ "name": "driver" }] } } }
        }))
        .unwrap()
    }

    #[test]
    fn test_from_value_requires_identity_fields() {
        assert_eq!(Manifest::from_value(json!("text")), Err(ManifestError::NotAnObject));
        assert_eq!(
            Manifest::from_value(json!({ "kind": "Pod", "metadata": { "name": "a" } })),
            Err(ManifestError::MissingField("apiVersion"))
        );
        assert_eq!(
            Manifest::from_value(json!({ "apiVersion": "v1", "metadata": { "name": "a" } })),
            Err(ManifestError::MissingField("kind"))
        );
        assert_eq!(
            Manifest::from_value(json!({ "apiVersion": "v1", "kind": "Pod", "metadata": {} })),
            Err(ManifestError::MissingField("metadata.name"))
        );
    }

    #[test]
    fn test_set_creates_intermediate_maps() {
        let mut ds = daemonset();
        ds.set(
            &["spec", "template", "spec", "nodeSelector", "kubernetes.io/os"],
            json!("linux"),
        );
        assert_eq!(
            ds.get_str(&["spec", "template", "spec", "nodeSelector", "kubernetes.io/os"]),
            Some("linux")
        );
        // containers untouched
        assert!(ds.get(&["spec", "template", "spec", "containers"]).is_some());
    }

    #[test]
    fn test_set_replaces_null_intermediate() {
        let mut ds = daemonset();
        ds.set(&["spec", "template", "spec", "nodeSelector"], Value::Null);
        ds.set(&["spec", "template", "spec", "nodeSelector", "a"], json!("b"));
        assert_eq!(ds.get_str(&["spec", "template", "spec", "nodeSelector", "a"]), Some("b"));
    }

    #[test]
    fn test_namespace_and_stamp_accessors() {
        let mut ds = daemonset();
        assert_eq!(ds.namespace(), None);
        ds.set_namespace("kmods");
        ds.set_label("app.kubernetes.io/managed-by", "Helm");
        ds.set_annotation("meta.helm.sh/release-name", "kmod-a");
        assert_eq!(ds.namespace(), Some("kmods"));
        assert_eq!(ds.label("app.kubernetes.io/managed-by"), Some("Helm"));
        assert_eq!(ds.annotation("meta.helm.sh/release-name"), Some("kmod-a"));
        assert_eq!(ds.key().to_string(), "DaemonSet kmods/kmod-driver");
        ds.clear_namespace();
        assert_eq!(ds.namespace(), None);
    }

    #[test]
    fn test_contained_in_ignores_server_fields() {
        let desired = daemonset();
        let mut live = daemonset();
        live.set(&["metadata", "resourceVersion"], json!("42"));
        live.set(&["status", "numberAvailable"], json!(3));
        live.set(
            &["spec", "template", "spec", "containers"],
            json!([{ "name": "driver", "imagePullPolicy": "IfNotPresent" }]),
        );
        assert!(desired.is_contained_in(&live));

        let mut changed = daemonset();
        changed.set(&["spec", "template", "spec", "containers"], json!([{ "name": "other" }]));
        assert!(!changed.is_contained_in(&live));
    }
}
