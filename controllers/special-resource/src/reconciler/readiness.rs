//! Readiness polling
//!
//! Objects whose kind has a [`ReadinessRule`] are polled at a fixed interval,
//! first check immediately, until they converge or the deadline passes.
//! Everything else is ready as soon as it is applied.

use crate::error::ControllerError;
use crate::reconciler::kinds::{KindRegistry, ReadinessRule};
use cluster_client::{ClusterClient, ClusterError};
use crds::Manifest;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Label OpenShift puts on Builds pointing at their BuildConfig
const BUILD_CONFIG_LABEL: &str = "openshift.io/build-config.name";
/// Annotation carrying a Build's sequence number within its BuildConfig
const BUILD_NUMBER_ANNOTATION: &str = "openshift.io/build.number";
const BUILD_API_VERSION: &str = "build.openshift.io/v1";

/// Polls objects until their readiness predicate holds
#[derive(Clone, Copy)]
pub struct ReadinessPoller<'a> {
    client: &'a dyn ClusterClient,
    kinds: &'a KindRegistry,
    interval: Duration,
}

impl<'a> ReadinessPoller<'a> {
    /// Poller checking every `interval`
    pub fn new(client: &'a dyn ClusterClient, kinds: &'a KindRegistry, interval: Duration) -> Self {
        Self { client, kinds, interval }
    }

    /// Rule that applies to `object`, `None` when it is ready once applied
    pub fn rule_for(&self, object: &Manifest) -> Option<ReadinessRule> {
        match self.kinds.readiness(object.kind())? {
            ReadinessRule::OneTimerPod if object.get_str(&["spec", "restartPolicy"]) != Some("Never") => None,
            rule => Some(rule),
        }
    }

    /// Waits until `object` is ready or `deadline` passes
    pub async fn wait_ready(&self, object: &Manifest, deadline: Instant) -> Result<(), ControllerError> {
        let Some(rule) = self.rule_for(object) else {
            return Ok(());
        };
        let started = Instant::now();
        loop {
            if self.is_ready(object, rule).await? {
                debug!("{} is ready", object);
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ControllerError::ReadinessTimeout {
                    target: object.key().to_string(),
                    timeout: deadline.saturating_duration_since(started),
                });
            }
            debug!("{} not ready yet", object);
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    async fn is_ready(&self, object: &Manifest, rule: ReadinessRule) -> Result<bool, ControllerError> {
        let key = object.key();
        let live = match self.client.get(&key).await {
            Ok(live) => live,
            Err(ClusterError::NotFound(_)) => return Err(ControllerError::NotFound(key.to_string())),
            Err(e) => return Err(e.into()),
        };

        Ok(match rule {
            ReadinessRule::Replicas => replicas_ready(&live),
            ReadinessRule::DaemonSet => daemonset_ready(&live),
            ReadinessRule::OneTimerPod => live.get_str(&["status", "phase"]) == Some("Succeeded"),
            ReadinessRule::Build => build_complete(&live),
            ReadinessRule::BuildConfig => {
                let selector = format!("{}={}", BUILD_CONFIG_LABEL, live.name());
                let builds = self
                    .client
                    .list(BUILD_API_VERSION, "Build", live.namespace(), Some(&selector))
                    .await?;
                latest_build(&builds).is_some_and(build_complete)
            }
        })
    }
}

/// Deployment/StatefulSet: every desired replica ready at the current generation
pub fn replicas_ready(live: &Manifest) -> bool {
    let desired = live.get_i64(&["spec", "replicas"]).unwrap_or(1);
    let ready = live.get_i64(&["status", "readyReplicas"]).unwrap_or(0);
    let generation = live.generation().unwrap_or(0);
    let observed = live.get_i64(&["status", "observedGeneration"]).unwrap_or(0);
    ready == desired && observed >= generation
}

/// DaemonSet: at least one pod scheduled and all scheduled pods available
pub fn daemonset_ready(live: &Manifest) -> bool {
    let desired = live.get_i64(&["status", "desiredNumberScheduled"]).unwrap_or(0);
    let available = live.get_i64(&["status", "numberAvailable"]).unwrap_or(0);
    desired > 0 && available == desired
}

fn build_complete(build: &Manifest) -> bool {
    build.get_str(&["status", "phase"]) == Some("Complete")
}

fn build_number(build: &Manifest) -> i64 {
    build
        .annotation(BUILD_NUMBER_ANNOTATION)
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Most recent build: highest build number, then newest creation timestamp
fn latest_build(builds: &[Manifest]) -> Option<&Manifest> {
    builds.iter().max_by(|a, b| {
        build_number(a).cmp(&build_number(b)).then_with(|| {
            let created = |m: &Manifest| m.get(&["metadata", "creationTimestamp"]).and_then(Value::as_str).unwrap_or_default().to_string();
            created(a).cmp(&created(b))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(value: Value) -> Manifest {
        Manifest::from_value(value).unwrap()
    }

    #[test]
    fn test_replicas_predicate() {
        let mut deployment = manifest(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "d", "generation": 2 },
            "spec": { "replicas": 2 },
            "status": { "readyReplicas": 2, "observedGeneration": 1 }
        }));
        assert!(!replicas_ready(&deployment), "stale generation");
        deployment.set(&["status", "observedGeneration"], json!(2));
        assert!(replicas_ready(&deployment));
        deployment.set(&["status", "readyReplicas"], json!(1));
        assert!(!replicas_ready(&deployment));
    }

    #[test]
    fn test_replicas_default_to_one() {
        let statefulset = manifest(json!({
            "apiVersion": "apps/v1", "kind": "StatefulSet",
            "metadata": { "name": "s" },
            "status": { "readyReplicas": 1 }
        }));
        assert!(replicas_ready(&statefulset));
    }

    #[test]
    fn test_daemonset_predicate() {
        let mut ds = manifest(json!({
            "apiVersion": "apps/v1", "kind": "DaemonSet",
            "metadata": { "name": "ds" },
            "status": { "desiredNumberScheduled": 0, "numberAvailable": 0 }
        }));
        assert!(!daemonset_ready(&ds), "nothing scheduled yet");
        ds.set(&["status"], json!({ "desiredNumberScheduled": 3, "numberAvailable": 2 }));
        assert!(!daemonset_ready(&ds));
        ds.set(&["status", "numberAvailable"], json!(3));
        assert!(daemonset_ready(&ds));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_object_is_reported_as_not_found() {
        let mock = cluster_client::MockClusterClient::new();
        let kinds = KindRegistry::default();
        let poller = ReadinessPoller::new(&mock, &kinds, Duration::from_secs(5));
        let deployment = manifest(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "d", "namespace": "kmods" }
        }));

        let err = poller
            .wait_ready(&deployment, Instant::now() + Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NotFound(_)), "{err:?}");
        assert_eq!(err.reason(), "NotFound");
        assert!(err.is_transient());
    }

    #[test]
    fn test_latest_build_wins() {
        let build = |name: &str, number: &str, phase: &str| {
            manifest(json!({
                "apiVersion": BUILD_API_VERSION, "kind": "Build",
                "metadata": { "name": name, "annotations": { BUILD_NUMBER_ANNOTATION: number } },
                "status": { "phase": phase }
            }))
        };
        let builds = vec![build("b-1", "1", "Complete"), build("b-3", "3", "Running"), build("b-2", "2", "Failed")];
        let latest = latest_build(&builds).unwrap();
        assert_eq!(latest.name(), "b-3");
        assert!(!build_complete(latest));
        assert!(latest_build(&[]).is_none());
    }
}
