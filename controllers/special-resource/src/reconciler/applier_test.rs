use crate::error::ControllerError;
use crate::reconciler::applier::{Applier, ApplyOutcome, ApplyTarget};
use crate::reconciler::kinds::KindRegistry;
use crate::test_utils::key;
use cluster_client::{ClusterCall, MockClusterClient};
use crds::Manifest;
use crds::labels::{MANAGED_BY_LABEL, RELEASE_NAME_ANNOTATION, RELEASE_NAMESPACE_ANNOTATION};
use serde_json::{Value, json};
use std::collections::BTreeMap;

fn target() -> ApplyTarget {
    ApplyTarget {
        release_name: "simple-kmod".to_string(),
        release_namespace: "simple-kmod".to_string(),
        node_selector: BTreeMap::from([
            ("feature.node.kubernetes.io/kernel-version.full".to_string(), "4.18.0-305.el8.x86_64".to_string()),
            ("node-role.kubernetes.io/worker".to_string(), String::new()),
        ]),
    }
}

fn manifest(value: Value) -> Manifest {
    Manifest::from_value(value).unwrap()
}

#[test]
fn test_prepare_namespaces_by_scope() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    let applier = Applier::new(&mock, &kinds);

    let namespace = applier.prepare(
        manifest(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "simple-kmod", "namespace": "stray" } })),
        &target(),
    );
    assert_eq!(namespace.namespace(), None);

    let role = applier.prepare(
        manifest(json!({ "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": { "name": "r" } })),
        &target(),
    );
    assert_eq!(role.namespace(), None);

    let cm = applier.prepare(
        manifest(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c" } })),
        &target(),
    );
    assert_eq!(cm.namespace(), Some("simple-kmod"));

    let explicit = applier.prepare(
        manifest(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c", "namespace": "openshift-monitoring" } })),
        &target(),
    );
    assert_eq!(explicit.namespace(), Some("openshift-monitoring"));
}

#[test]
fn test_prepare_stamps_release() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    let applier = Applier::new(&mock, &kinds);

    let sa = applier.prepare(
        manifest(json!({ "apiVersion": "v1", "kind": "ServiceAccount", "metadata": { "name": "driver", "labels": { "app": "x" } } })),
        &target(),
    );
    assert_eq!(sa.label(MANAGED_BY_LABEL), Some("Helm"));
    assert_eq!(sa.label("app"), Some("x"));
    assert_eq!(sa.annotation(RELEASE_NAME_ANNOTATION), Some("simple-kmod"));
    assert_eq!(sa.annotation(RELEASE_NAMESPACE_ANNOTATION), Some("simple-kmod"));
}

#[test]
fn test_prepare_merges_node_selector() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    let applier = Applier::new(&mock, &kinds);

    let ds = applier.prepare(
        manifest(json!({
            "apiVersion": "apps/v1", "kind": "DaemonSet",
            "metadata": { "name": "driver" },
            "spec": { "template": { "spec": { "nodeSelector": {
                "custom": "yes",
                "feature.node.kubernetes.io/kernel-version.full": "stale"
            } } } }
        })),
        &target(),
    );
    let selector = ds.get(&["spec", "template", "spec", "nodeSelector"]).unwrap();
    assert_eq!(
        selector,
        &json!({
            "custom": "yes",
            "feature.node.kubernetes.io/kernel-version.full": "4.18.0-305.el8.x86_64",
            "node-role.kubernetes.io/worker": ""
        })
    );

    let pod = applier.prepare(
        manifest(json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p" }, "spec": {} })),
        &target(),
    );
    assert!(pod.get(&["spec", "nodeSelector", "node-role.kubernetes.io/worker"]).is_some());

    // Kinds without a selector path are left alone
    let cm = applier.prepare(
        manifest(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c" } })),
        &target(),
    );
    assert!(cm.get(&["spec"]).is_none());
}

#[tokio::test]
async fn test_apply_creates_missing_object() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    let applier = Applier::new(&mock, &kinds);

    let applied = applier
        .apply_one(
            manifest(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c" }, "data": { "k": "v" } })),
            &target(),
        )
        .await
        .unwrap();
    assert_eq!(applied.outcome, ApplyOutcome::Created);
    let live = mock.object(&key("v1", "ConfigMap", "simple-kmod", "c")).unwrap();
    assert_eq!(live.label(MANAGED_BY_LABEL), Some("Helm"));
}

#[tokio::test]
async fn test_apply_unchanged_when_live_contains_desired() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    let applier = Applier::new(&mock, &kinds);
    let cm = manifest(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c" }, "data": { "k": "v" } }));

    applier.apply_one(cm.clone(), &target()).await.unwrap();
    mock.clear_calls();

    let applied = applier.apply_one(cm, &target()).await.unwrap();
    assert_eq!(applied.outcome, ApplyOutcome::Unchanged);
    assert!(!mock.calls().iter().any(|c| matches!(c, ClusterCall::Update(_))));
}

#[tokio::test]
async fn test_update_without_resource_version_for_plain_kinds() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    let applier = Applier::new(&mock, &kinds);

    applier
        .apply_one(
            manifest(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c" }, "data": { "k": "v1" } })),
            &target(),
        )
        .await
        .unwrap();
    mock.clear_calls();

    let applied = applier
        .apply_one(
            manifest(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c" }, "data": { "k": "v2" } })),
            &target(),
        )
        .await
        .unwrap();
    assert_eq!(applied.outcome, ApplyOutcome::Updated);
    let submitted = mock.submitted();
    let update = submitted.last().unwrap();
    assert_eq!(update.resource_version(), None);
}

#[tokio::test]
async fn test_deployment_update_carries_live_resource_version() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    let applier = Applier::new(&mock, &kinds);
    let deployment = |image: &str| {
        manifest(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "builder" },
            "spec": { "replicas": 1, "template": { "spec": { "containers": [{ "name": "c", "image": image }] } } }
        }))
    };

    applier.apply_one(deployment("a:1"), &target()).await.unwrap();
    let live_version = mock
        .object(&key("apps/v1", "Deployment", "simple-kmod", "builder"))
        .unwrap()
        .resource_version()
        .map(str::to_string);
    mock.clear_calls();

    let applied = applier.apply_one(deployment("a:2"), &target()).await.unwrap();
    assert_eq!(applied.outcome, ApplyOutcome::Updated);
    let submitted = mock.submitted();
    let update = submitted.last().unwrap();
    assert_eq!(update.resource_version().map(str::to_string), live_version);
}

#[tokio::test]
async fn test_service_update_keeps_cluster_ip() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    let applier = Applier::new(&mock, &kinds);
    mock.insert(manifest(json!({
        "apiVersion": "v1", "kind": "Service",
        "metadata": { "name": "metrics", "namespace": "simple-kmod", "resourceVersion": "99" },
        "spec": { "clusterIP": "10.0.0.42", "ports": [{ "port": 8080 }] }
    })));

    let applied = applier
        .apply_one(
            manifest(json!({
                "apiVersion": "v1", "kind": "Service",
                "metadata": { "name": "metrics" },
                "spec": { "ports": [{ "port": 9090 }] }
            })),
            &target(),
        )
        .await
        .unwrap();
    assert_eq!(applied.outcome, ApplyOutcome::Updated);

    let submitted = mock.submitted();
    let update = submitted.last().unwrap();
    assert_eq!(update.resource_version(), Some("99"));
    assert_eq!(update.get_str(&["spec", "clusterIP"]), Some("10.0.0.42"));

    let live = mock.object(&key("v1", "Service", "simple-kmod", "metrics")).unwrap();
    assert_eq!(live.get_str(&["spec", "clusterIP"]), Some("10.0.0.42"));
    assert_eq!(live.get(&["spec", "ports"]), Some(&json!([{ "port": 9090 }])));
}

#[tokio::test]
async fn test_existing_service_account_is_never_updated() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    let applier = Applier::new(&mock, &kinds);
    mock.insert(manifest(json!({
        "apiVersion": "v1", "kind": "ServiceAccount",
        "metadata": { "name": "driver", "namespace": "simple-kmod" },
        "secrets": [{ "name": "driver-token-abcde" }]
    })));

    let applied = applier
        .apply_one(
            manifest(json!({ "apiVersion": "v1", "kind": "ServiceAccount", "metadata": { "name": "driver" } })),
            &target(),
        )
        .await
        .unwrap();
    assert_eq!(applied.outcome, ApplyOutcome::Unchanged);
    assert!(!mock.calls().iter().any(|c| matches!(c, ClusterCall::Update(_))));
    let live = mock.object(&key("v1", "ServiceAccount", "simple-kmod", "driver")).unwrap();
    assert_eq!(live.get(&["secrets"]), Some(&json!([{ "name": "driver-token-abcde" }])));
}

#[tokio::test]
async fn test_custom_resource_waits_for_its_crd() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    mock.unregister_kind("Widget");
    let applier = Applier::new(&mock, &kinds);

    let crd = manifest(json!({
        "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
        "metadata": { "name": "widgets.example.com" },
        "spec": { "names": { "kind": "Widget" }, "scope": "Namespaced" }
    }));
    applier.apply_one(crd, &target()).await.unwrap();

    let widget = manifest(json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w" } }));
    let applied = applier.apply_one(widget, &target()).await.unwrap();
    assert_eq!(applied.outcome, ApplyOutcome::Created);
    assert!(mock.calls().contains(&ClusterCall::RefreshDiscovery));
    assert!(mock.object(&key("example.com/v1", "Widget", "simple-kmod", "w")).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_unserved_kind_is_transient_after_waiting() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    mock.unregister_kind("Widget");
    let applier = Applier::new(&mock, &kinds);

    let widget = manifest(json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w" } }));
    let err = applier.apply_one(widget, &target()).await.unwrap_err();
    assert!(matches!(err, ControllerError::TransientApply { .. }), "{err:?}");
    assert!(err.is_transient());
    let creates = mock.calls().iter().filter(|c| matches!(c, ClusterCall::Create(_))).count();
    assert!(creates > 2, "create retried while waiting, got {creates}");
}

#[tokio::test]
async fn test_rejected_object_is_permanent_apply_error() {
    let kinds = KindRegistry::default();
    let mock = MockClusterClient::new();
    mock.reject_kind("Role", 422);
    let applier = Applier::new(&mock, &kinds);

    let role = manifest(json!({ "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "Role", "metadata": { "name": "r" } }));
    let err = applier.apply_one(role, &target()).await.unwrap_err();
    assert!(matches!(err, ControllerError::Apply { .. }), "{err:?}");
    assert!(!err.is_transient());
    assert_eq!(err.reason(), "ApplyError");
}
