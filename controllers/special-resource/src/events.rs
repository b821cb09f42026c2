//! Kubernetes Events for SpecialResources
//!
//! Reconcile outcomes are reported as `core/v1` Events attached to the
//! SpecialResource. Events are created through the [`ClusterClient`] so the
//! mock cluster sees them like any other object. SpecialResources are
//! cluster-scoped, so their Events live in the `default` namespace.
//! Publishing is best effort: a failed Event is logged and dropped.

use chrono::{SecondsFormat, Utc};
use cluster_client::ClusterClient;
use crds::{Manifest, SpecialResource};
use kube::runtime::events::EventType;
use serde_json::json;
use std::sync::Arc;
#[cfg(test)]
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Event reasons
pub mod reasons {
    /// Every state applied and ready
    pub const RECONCILED: &str = "Reconciled";
    /// Reconcile failed, the note carries the cause
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// A declared parent is not Ready yet
    pub const AWAITING_PARENT: &str = "AwaitingParent";
    /// Owned objects deleted after the SpecialResource was deleted
    pub const TORN_DOWN: &str = "TornDown";
}

/// Event actions
pub mod actions {
    /// Reconcile of the spec
    pub const RECONCILE: &str = "Reconcile";
    /// Teardown on deletion
    pub const TEARDOWN: &str = "Teardown";
}

/// Namespace Events about cluster-scoped objects are written to
const EVENT_NAMESPACE: &str = "default";

/// Component name reported as the Event source
pub const REPORTING_CONTROLLER: &str = "special-resource-operator";

/// Publishes Events about SpecialResources
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    /// Records one Event on `sr`
    async fn publish(&self, sr: &SpecialResource, type_: EventType, reason: &str, action: &str, note: Option<String>);
}

/// Creates Event objects through the cluster client
pub struct ClusterEventPublisher {
    client: Arc<dyn ClusterClient>,
    instance: String,
}

impl std::fmt::Debug for ClusterEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterEventPublisher").field("instance", &self.instance).finish()
    }
}

impl ClusterEventPublisher {
    /// Publisher reporting as `instance` (the operator pod identity)
    pub fn new(client: Arc<dyn ClusterClient>, instance: impl Into<String>) -> Self {
        Self {
            client,
            instance: instance.into(),
        }
    }
}

/// Builds the Event object for one publication
pub fn event_manifest(
    sr: &SpecialResource,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<&str>,
    instance: &str,
) -> Manifest {
    let now = Utc::now();
    let name = format!("{}.{:x}", sr.name(), now.timestamp_nanos_opt().unwrap_or_default());
    let type_ = match type_ {
        EventType::Normal => "Normal",
        EventType::Warning => "Warning",
    };

    let mut event = Manifest::new("v1", "Event", &name);
    event.set_namespace(EVENT_NAMESPACE);
    event.set(
        &["involvedObject"],
        json!({
            "apiVersion": crds::SPECIAL_RESOURCE_API_VERSION,
            "kind": crds::SPECIAL_RESOURCE_KIND,
            "name": sr.name(),
            "uid": sr.metadata.uid,
            "resourceVersion": sr.metadata.resource_version,
        }),
    );
    event.set(&["type"], json!(type_));
    event.set(&["reason"], json!(reason));
    event.set(&["action"], json!(action));
    event.set(&["message"], json!(note.unwrap_or_default()));
    event.set(&["count"], json!(1));
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    event.set(&["firstTimestamp"], json!(timestamp));
    event.set(&["lastTimestamp"], json!(timestamp));
    event.set(&["eventTime"], json!(now.to_rfc3339_opts(SecondsFormat::Micros, true)));
    event.set(&["source", "component"], json!(REPORTING_CONTROLLER));
    event.set(&["reportingComponent"], json!(REPORTING_CONTROLLER));
    event.set(&["reportingInstance"], json!(instance));
    event
}

#[async_trait::async_trait]
impl EventPublisher for ClusterEventPublisher {
    async fn publish(&self, sr: &SpecialResource, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let event = event_manifest(sr, type_, reason, action, note.as_deref(), &self.instance);
        if let Err(e) = self.client.create(&event).await {
            warn!("Failed to publish {} event for SpecialResource {}: {}", reason, sr.name(), e);
        }
    }
}

/// An Event captured by [`RecordingEventPublisher`]
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// SpecialResource name
    pub object: String,
    /// `true` for Warning events
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event note
    pub note: Option<String>,
}

/// Keeps Events in memory for assertions
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct RecordingEventPublisher {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

#[cfg(test)]
impl RecordingEventPublisher {
    /// Events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Reasons of the Events published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, sr: &SpecialResource, type_: EventType, reason: &str, _action: &str, note: Option<String>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                object: sr.name().to_string(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_client::{ClusterCall, MockClusterClient};
    use crds::SpecialResourceSpec;

    #[tokio::test]
    async fn test_cluster_publisher_creates_event_on_sr() {
        let mock = MockClusterClient::new();
        let publisher = ClusterEventPublisher::new(Arc::new(mock.clone()), "sro-0");
        let sr = SpecialResource::new("simple-kmod", SpecialResourceSpec::default());

        publisher
            .publish(&sr, EventType::Warning, reasons::RECONCILE_FAILED, actions::RECONCILE, Some("boom".into()))
            .await;

        let events = mock.objects_of_kind("Event");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.namespace(), Some("default"));
        assert_eq!(event.get_str(&["involvedObject", "name"]), Some("simple-kmod"));
        assert_eq!(event.get_str(&["involvedObject", "kind"]), Some("SpecialResource"));
        assert_eq!(event.get_str(&["type"]), Some("Warning"));
        assert_eq!(event.get_str(&["reason"]), Some("ReconcileFailed"));
        assert_eq!(event.get_str(&["message"]), Some("boom"));
        assert!(matches!(mock.calls().as_slice(), [ClusterCall::Create(_)]));
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let mock = MockClusterClient::new();
        mock.reject_kind("Event", 403);
        let publisher = ClusterEventPublisher::new(Arc::new(mock.clone()), "sro-0");
        let sr = SpecialResource::new("simple-kmod", SpecialResourceSpec::default());

        publisher
            .publish(&sr, EventType::Normal, reasons::RECONCILED, actions::RECONCILE, None)
            .await;
        assert!(mock.objects_of_kind("Event").is_empty());
    }

    #[tokio::test]
    async fn test_recording_publisher() {
        let recorder = RecordingEventPublisher::default();
        let sr = SpecialResource::new("a", SpecialResourceSpec::default());
        recorder
            .publish(&sr, EventType::Normal, reasons::AWAITING_PARENT, actions::RECONCILE, None)
            .await;
        assert_eq!(recorder.reasons(), vec!["AwaitingParent".to_string()]);
        assert!(!recorder.events()[0].warning);
    }
}
