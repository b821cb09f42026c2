use crate::error::{ControllerError, DependencyError};
use crate::reconciler::dependencies::DependencyRegistry;
use crate::test_utils::key;
use cluster_client::{ClusterCall, MockClusterClient};
use crds::Manifest;
use crds::labels::DEPENDENCY_CONFIGMAP;
use serde_json::{Value, json};

const NAMESPACE: &str = "sro";

fn seed(mock: &MockClusterClient, data: Value) {
    let mut config_map = Manifest::new("v1", "ConfigMap", DEPENDENCY_CONFIGMAP);
    config_map.set_namespace(NAMESPACE);
    config_map.set(&["data"], data);
    mock.insert(config_map);
}

fn data(mock: &MockClusterClient) -> Option<Value> {
    mock.object(&key("v1", "ConfigMap", NAMESPACE, DEPENDENCY_CONFIGMAP))
        .and_then(|cm| cm.get(&["data"]).cloned())
}

#[tokio::test]
async fn test_first_record_creates_config_map() {
    let mock = MockClusterClient::new();
    let registry = DependencyRegistry::new(&mock, NAMESPACE);

    assert_eq!(registry.parent_of("simple-kmod").await.unwrap(), "");
    registry.record_dependency("driver-container-base", "simple-kmod").await.unwrap();

    assert_eq!(data(&mock), Some(json!({ "simple-kmod": "driver-container-base" })));
    assert_eq!(registry.parent_of("simple-kmod").await.unwrap(), "driver-container-base");
}

#[tokio::test]
async fn test_recording_an_existing_edge_writes_nothing() {
    let mock = MockClusterClient::new();
    seed(&mock, json!({ "b": "a" }));
    let registry = DependencyRegistry::new(&mock, NAMESPACE);

    registry.record_dependency("a", "b").await.unwrap();
    assert!(mock.mutations().is_empty());
}

#[tokio::test]
async fn test_cycle_is_rejected_and_nothing_written() {
    let mock = MockClusterClient::new();
    seed(&mock, json!({ "a": "b" }));
    let registry = DependencyRegistry::new(&mock, NAMESPACE);

    let err = registry.record_dependency("a", "b").await.unwrap_err();
    match &err {
        ControllerError::Dependency(DependencyError::Cycle { parent, child, .. }) => {
            assert_eq!(parent, "a");
            assert_eq!(child, "b");
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(!err.is_transient());
    assert!(mock.mutations().is_empty());
    assert_eq!(data(&mock), Some(json!({ "a": "b" })));

    let err = registry.check("a", "b").await.unwrap_err();
    assert_eq!(err.reason(), "DependencyError");
}

#[tokio::test]
async fn test_longer_cycle_is_rejected() {
    let mock = MockClusterClient::new();
    seed(&mock, json!({ "b": "a", "c": "b" }));
    let registry = DependencyRegistry::new(&mock, NAMESPACE);

    assert!(registry.check("c", "a").await.is_err());
    assert!(registry.check("a", "d").await.is_ok());
}

#[tokio::test]
async fn test_self_dependency_is_a_cycle() {
    let mock = MockClusterClient::new();
    let registry = DependencyRegistry::new(&mock, NAMESPACE);
    assert!(registry.record_dependency("a", "a").await.is_err());
    assert!(data(&mock).is_none());
}

#[tokio::test]
async fn test_conflicting_write_is_retried() {
    let mock = MockClusterClient::new();
    seed(&mock, json!({ "b": "a" }));
    mock.inject_conflicts(&key("v1", "ConfigMap", NAMESPACE, DEPENDENCY_CONFIGMAP), 2);
    let registry = DependencyRegistry::new(&mock, NAMESPACE);

    registry.record_dependency("a", "c").await.unwrap();
    assert_eq!(data(&mock), Some(json!({ "b": "a", "c": "a" })));
    let updates = mock.calls().iter().filter(|c| matches!(c, ClusterCall::Update(_))).count();
    assert_eq!(updates, 3);
}

#[tokio::test]
async fn test_persistent_conflict_gives_up() {
    let mock = MockClusterClient::new();
    seed(&mock, json!({}));
    mock.inject_conflicts(&key("v1", "ConfigMap", NAMESPACE, DEPENDENCY_CONFIGMAP), 100);
    let registry = DependencyRegistry::new(&mock, NAMESPACE);

    let err = registry.record_dependency("a", "b").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_remove_drops_only_the_child_record() {
    let mock = MockClusterClient::new();
    seed(&mock, json!({ "b": "a", "c": "a" }));
    let registry = DependencyRegistry::new(&mock, NAMESPACE);

    registry.remove("b").await.unwrap();
    assert_eq!(data(&mock), Some(json!({ "c": "a" })));

    mock.clear_calls();
    registry.remove("unknown").await.unwrap();
    assert!(mock.mutations().is_empty());
}

#[tokio::test]
async fn test_remove_without_config_map_is_a_no_op() {
    let mock = MockClusterClient::new();
    let registry = DependencyRegistry::new(&mock, NAMESPACE);
    registry.remove("b").await.unwrap();
    assert!(mock.mutations().is_empty());
}
