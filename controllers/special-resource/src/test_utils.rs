//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test
//! scenarios against `MockClusterClient`.

use crate::events::RecordingEventPublisher;
use crate::metrics::Metrics;
use crate::reconciler::kinds::KindRegistry;
use crate::reconciler::{Context, ReconcileSettings, Reconciler};
use chart::ChartFetcher;
use cluster_client::MockClusterClient;
use crds::labels::{KERNEL_VERSION_LABEL, OS_RELEASE_ID_LABEL, OS_VERSION_LABEL, WORKER_ROLE_LABEL};
use crds::{ChartReference, Manifest, ObjectKey, SpecialResource, SpecialResourceSpec, SpecialResourceState, SpecialResourceStatus};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Helper to create a worker Node carrying `labels`
pub fn worker_node(name: &str, labels: &[(&str, &str)]) -> Manifest {
    let mut node = Manifest::new("v1", "Node", name);
    node.set_label(WORKER_ROLE_LABEL, "");
    for (key, value) in labels {
        node.set_label(key, value);
    }
    node
}

/// Worker node with a complete RHEL 8.4 fingerprint
pub fn rhel_worker(name: &str) -> Manifest {
    worker_node(
        name,
        &[
            (KERNEL_VERSION_LABEL, "4.18.0-305.el8.x86_64"),
            (OS_RELEASE_ID_LABEL, "rhel"),
            (OS_VERSION_LABEL, "8.4"),
        ],
    )
}

/// Writes a chart directory with `templates` (file name, body) and `values`
pub fn write_chart(dir: &Path, name: &str, templates: &[(&str, &str)], values: &str) -> std::path::PathBuf {
    let root = dir.join(name);
    fs::create_dir_all(root.join("templates")).unwrap();
    fs::write(root.join("Chart.yaml"), format!("name: {name}\nversion: 0.0.1\n")).unwrap();
    fs::write(root.join("values.yaml"), values).unwrap();
    for (file, body) in templates {
        fs::write(root.join("templates").join(file), body).unwrap();
    }
    root
}

/// Helper to create a SpecialResource rendering the chart at `chart_path`
pub fn create_test_special_resource(name: &str, chart_path: &Path, dependencies: &[&str]) -> SpecialResource {
    let mut sr = SpecialResource::new(
        name,
        SpecialResourceSpec {
            chart: ChartReference {
                name: name.to_string(),
                version: "0.0.1".to_string(),
                repository: String::new(),
                path: Some(chart_path.display().to_string()),
            },
            namespace: name.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            ..SpecialResourceSpec::default()
        },
    );
    sr.metadata.generation = Some(1);
    sr.metadata.uid = Some(format!("uid-{name}"));
    sr
}

/// Gives `sr` a status in `state` for its current generation
pub fn with_state(mut sr: SpecialResource, state: SpecialResourceState) -> SpecialResource {
    sr.status = Some(SpecialResourceStatus {
        state,
        last_error: None,
        observed_generation: sr.metadata.generation,
    });
    sr
}

/// Stores `sr` in the mock cluster
pub fn store_special_resource(mock: &MockClusterClient, sr: &SpecialResource) {
    mock.insert(Manifest::from_value(serde_json::to_value(sr).unwrap()).unwrap());
}

/// Current copy of a stored SpecialResource, as the watcher would deliver it
pub fn fetch_special_resource(mock: &MockClusterClient, name: &str) -> SpecialResource {
    let object = mock.object(&SpecialResource::key_for(name)).unwrap();
    serde_json::from_value(object.into_value()).unwrap()
}

/// Key of a namespaced object
pub fn key(api_version: &str, kind: &str, namespace: &str, name: &str) -> ObjectKey {
    ObjectKey::namespaced(api_version, kind, namespace, name)
}

/// Sets the status fields a DaemonSet controller reports once all pods run
pub fn mark_daemonset_ready(mock: &MockClusterClient, key: &ObjectKey, pods: i64) {
    mock.set_status(
        key,
        serde_json::json!({ "desiredNumberScheduled": pods, "numberAvailable": pods }),
    );
}

/// Reconciler wired to a mock cluster and a recording event publisher
pub struct TestEnv {
    /// In-memory cluster
    pub mock: MockClusterClient,
    /// Published events
    pub events: RecordingEventPublisher,
    /// Reconciler under test
    pub reconciler: Reconciler,
    /// Operator shutdown token
    pub shutdown: CancellationToken,
    /// Chart cache and fixtures
    pub dir: TempDir,
}

impl TestEnv {
    /// Environment with one RHEL worker node
    pub fn new() -> Self {
        Self::with_settings(ReconcileSettings {
            operator_namespace: "sro".to_string(),
            state_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            reconcile_timeout: Duration::from_secs(600),
        })
    }

    /// Environment with custom timeouts
    pub fn with_settings(settings: ReconcileSettings) -> Self {
        let mock = MockClusterClient::new();
        mock.insert(rhel_worker("worker-0"));
        let events = RecordingEventPublisher::default();
        let dir = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let ctx = Context {
            client: Arc::new(mock.clone()),
            kinds: KindRegistry::default(),
            events: Arc::new(events.clone()),
            metrics: Arc::new(Metrics::new().unwrap()),
            fetcher: ChartFetcher::new(dir.path().join("cache")),
            settings,
            shutdown: shutdown.clone(),
        };
        Self {
            mock,
            events,
            reconciler: Reconciler::new(ctx),
            shutdown,
            dir,
        }
    }

    /// Writes a chart below the environment's temp dir
    pub fn chart(&self, name: &str, templates: &[(&str, &str)]) -> std::path::PathBuf {
        write_chart(self.dir.path(), name, templates, "")
    }

    /// Stores a SpecialResource for `chart` and returns the stored copy
    pub fn special_resource(&self, name: &str, chart: &Path, dependencies: &[&str]) -> SpecialResource {
        store_special_resource(&self.mock, &create_test_special_resource(name, chart, dependencies));
        fetch_special_resource(&self.mock, name)
    }

    /// Reconciles the stored copy of `name`
    pub async fn reconcile(&self, name: &str) -> kube_runtime::controller::Action {
        let sr = fetch_special_resource(&self.mock, name);
        self.reconciler.reconcile(&sr).await.unwrap()
    }

    /// `status.state` of the stored SpecialResource
    pub fn state(&self, name: &str) -> Option<String> {
        self.mock
            .object(&SpecialResource::key_for(name))
            .and_then(|o| o.get_str(&["status", "state"]).map(str::to_string))
    }

    /// `status.lastError` of the stored SpecialResource
    pub fn last_error(&self, name: &str) -> Option<String> {
        self.mock
            .object(&SpecialResource::key_for(name))
            .and_then(|o| o.get(&["status", "lastError"]).and_then(Value::as_str).map(str::to_string))
    }
}
