//! Reconciliation logic for SpecialResources.
//!
//! One reconcile walks the SpecialResource through
//! Resolving -> (AwaitingParent | Rendering) -> Applying -> Ready, or Failed.
//! A deleted SpecialResource goes through Tearing instead.
//!
//! - `fingerprint`: kernel/OS identity of the representative worker node
//! - `dependencies`: persistent child -> parent records
//! - `kinds`: per-kind apply and readiness rules
//! - `applier`, `readiness`, `sequencer`: state-by-state rollout
//! - `teardown`, `status`: deletion and status writes

pub mod applier;
pub mod dependencies;
pub mod fingerprint;
pub mod kinds;
pub mod readiness;
pub mod sequencer;
pub mod status;
pub mod teardown;

#[cfg(test)]
mod applier_test;
#[cfg(test)]
mod dependencies_test;

use crate::backoff::ExponentialBackoff;
use crate::error::{ControllerError, DependencyError};
use crate::events::{EventPublisher, actions, reasons};
use crate::metrics::Metrics;
use applier::{Applier, ApplyTarget};
use chart::{ChartFetcher, Release, compose, group_states, render_chart};
use cluster_client::{ClusterClient, ClusterError};
use crds::labels::FINALIZER;
use crds::{SpecialResource, SpecialResourceState};
use dependencies::DependencyRegistry;
use kinds::KindRegistry;
use kube::runtime::events::EventType;
use kube_runtime::controller::Action;
use readiness::ReadinessPoller;
use sequencer::{RolloutReport, Sequencer};
use serde_json::json;
use status::StatusWriter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often a SpecialResource waiting on its parent re-checks it
const PARENT_RECHECK_INTERVAL: Duration = Duration::from_secs(30);

/// First and maximum requeue delay after a transient failure, in seconds
const BACKOFF_MIN_SECONDS: u64 = 5;
const BACKOFF_MAX_SECONDS: u64 = 300;

/// Timeouts and intervals of one reconcile
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Namespace holding the dependency ConfigMap
    pub operator_namespace: String,
    /// Readiness deadline of each state
    pub state_timeout: Duration,
    /// Interval between readiness checks
    pub poll_interval: Duration,
    /// Deadline of a whole reconcile
    pub reconcile_timeout: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            operator_namespace: "special-resource-operator".to_string(),
            state_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            reconcile_timeout: Duration::from_secs(3600),
        }
    }
}

/// Everything a reconcile needs, passed explicitly
pub struct Context {
    /// Kubernetes API gateway
    pub client: Arc<dyn ClusterClient>,
    /// Per-kind rules
    pub kinds: KindRegistry,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Operator metrics
    pub metrics: Arc<Metrics>,
    /// Chart resolution
    pub fetcher: ChartFetcher,
    /// Timeouts and intervals
    pub settings: ReconcileSettings,
    /// Cancelled on operator shutdown
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("kinds", &self.kinds)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Generation whose reconcile failed, and when it may run again
#[derive(Debug, Clone, Copy)]
struct Parked {
    generation: Option<i64>,
    // None: not before the spec changes
    retry_at: Option<Instant>,
}

/// Backoff state for a SpecialResource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: ExponentialBackoff,
    error_count: u32,
    parked: Option<Parked>,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: ExponentialBackoff::new(BACKOFF_MIN_SECONDS, BACKOFF_MAX_SECONDS),
            error_count: 0,
            parked: None,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
        self.parked = None;
    }
}

/// What a successful pass ended in
#[derive(Debug)]
enum Converged {
    Ready(RolloutReport),
    AwaitingParent(String),
}

/// Reconciles SpecialResources.
pub struct Reconciler {
    pub(crate) ctx: Context,
    /// Error tracking per SpecialResource name
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn backoff_states(&self) -> std::sync::MutexGuard<'_, HashMap<String, BackoffState>> {
        self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next requeue delay for a failing SpecialResource
    fn next_backoff(&self, name: &str) -> Duration {
        let mut states = self.backoff_states();
        let state = states.entry(name.to_string()).or_insert_with(BackoffState::new);
        state.increment_error();
        state.backoff.next_backoff()
    }

    fn park(&self, name: &str, generation: Option<i64>, retry_at: Option<Instant>) {
        let mut states = self.backoff_states();
        let state = states.entry(name.to_string()).or_insert_with(BackoffState::new);
        state.parked = Some(Parked { generation, retry_at });
    }

    fn reset_error(&self, name: &str) {
        if let Some(state) = self.backoff_states().get_mut(name) {
            state.reset();
        }
    }

    /// Consecutive failures recorded for `name`
    pub fn error_count(&self, name: &str) -> u32 {
        self.backoff_states().get(name).map_or(0, |s| s.error_count)
    }

    // A failed generation is not retried early when its own status write
    // comes back as a watch event
    fn parked_action(&self, name: &str, generation: Option<i64>) -> Option<Action> {
        let parked = self.backoff_states().get(name)?.parked?;
        if parked.generation != generation {
            return None;
        }
        match parked.retry_at {
            None => Some(Action::await_change()),
            Some(at) => {
                let now = Instant::now();
                (now < at).then(|| Action::requeue(at - now))
            }
        }
    }

    /// Requeue decision for errors that escaped [`Reconciler::reconcile`]
    pub fn error_action(&self, name: &str, error: &ControllerError) -> Action {
        let delay = self.next_backoff(name);
        warn!(
            "Reconcile of SpecialResource {} errored ({}), retrying in {:?} after {} consecutive failures",
            name,
            error,
            delay,
            self.error_count(name)
        );
        Action::requeue(delay)
    }

    /// Reconciles one SpecialResource.
    ///
    /// Failures that belong to the SpecialResource are recorded in its status
    /// and turned into a requeue decision. An `Err` means the failure could
    /// not even be recorded (e.g. the status write failed).
    pub async fn reconcile(&self, sr: &SpecialResource) -> Result<Action, ControllerError> {
        let name = sr.name();
        if sr.is_being_deleted() {
            return self.finalize(sr).await;
        }
        if let Some(action) = self.parked_action(name, sr.metadata.generation) {
            debug!("SpecialResource {} is parked after a failure, skipping", name);
            return Ok(action);
        }

        info!("Reconciling SpecialResource {}", name);
        self.ensure_finalizer(sr).await?;

        let client = &*self.ctx.client;
        let mut status = StatusWriter::new(client, sr);
        let timeout = self.ctx.settings.reconcile_timeout;
        let result = tokio::select! {
            biased;
            () = self.ctx.shutdown.cancelled() => Err(ControllerError::Cancelled),
            result = tokio::time::timeout(timeout, self.converge(sr, &mut status)) => {
                result.unwrap_or(Err(ControllerError::ReconcileTimeout(timeout)))
            }
        };

        match result {
            Ok(Converged::Ready(report)) => {
                if status.set(SpecialResourceState::Ready, None).await? {
                    let note = format!(
                        "{} states applied ({} created, {} updated, {} unchanged)",
                        report.states, report.created, report.updated, report.unchanged
                    );
                    info!("SpecialResource {} is Ready: {}", name, note);
                    self.publish(sr, EventType::Normal, reasons::RECONCILED, actions::RECONCILE, Some(note))
                        .await;
                }
                self.reset_error(name);
                self.ctx.metrics.record_reconcile("ready");
                Ok(Action::await_change())
            }
            Ok(Converged::AwaitingParent(parent)) => {
                if status.set(SpecialResourceState::AwaitingParent, None).await? {
                    let note = format!("waiting for parent SpecialResource {parent} to be Ready");
                    info!("SpecialResource {}: {}", name, note);
                    self.publish(sr, EventType::Normal, reasons::AWAITING_PARENT, actions::RECONCILE, Some(note))
                        .await;
                }
                self.reset_error(name);
                self.ctx.metrics.record_reconcile("awaiting_parent");
                Ok(Action::requeue(PARENT_RECHECK_INTERVAL))
            }
            Err(ControllerError::Cancelled) => {
                info!("Reconcile of SpecialResource {} cancelled by shutdown", name);
                Ok(Action::await_change())
            }
            Err(e) => self.fail(sr, &mut status, e).await,
        }
    }

    async fn fail(&self, sr: &SpecialResource, status: &mut StatusWriter<'_>, e: ControllerError) -> Result<Action, ControllerError> {
        let name = sr.name();
        let message = e.to_string();
        self.ctx.metrics.record_reconcile("failed");
        self.ctx.metrics.record_error(e.reason());

        status.set(SpecialResourceState::Failed, Some(message.clone())).await?;
        self.publish(sr, EventType::Warning, reasons::RECONCILE_FAILED, actions::RECONCILE, Some(message))
            .await;

        let generation = sr.metadata.generation;
        if e.is_transient() {
            let delay = self.next_backoff(name);
            self.park(name, generation, Some(Instant::now() + delay));
            warn!("SpecialResource {} failed ({}): {}, retrying in {:?}", name, e.reason(), e, delay);
            Ok(Action::requeue(delay))
        } else {
            self.park(name, generation, None);
            error!("SpecialResource {} failed ({}): {}, waiting for a spec change", name, e.reason(), e);
            Ok(Action::await_change())
        }
    }

    async fn publish(&self, sr: &SpecialResource, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        self.ctx.events.publish(sr, type_, reason, action, note).await;
    }

    async fn converge(&self, sr: &SpecialResource, status: &mut StatusWriter<'_>) -> Result<Converged, ControllerError> {
        let client = &*self.ctx.client;
        let name = sr.name();
        status.progress(SpecialResourceState::Resolving).await?;

        let parents = self.load_parents(sr).await?;
        if let Some(parent) = parents.iter().find(|p| !p.is_ready()) {
            return Ok(Converged::AwaitingParent(parent.name().to_string()));
        }
        let registry = DependencyRegistry::new(client, &self.ctx.settings.operator_namespace);
        match sr.spec.dependencies.first() {
            Some(parent) => registry.record_dependency(parent, name).await?,
            None => registry.remove(name).await?,
        }

        let resolved = fingerprint::resolve(client, &sr.spec.node_selector).await?;

        status.progress(SpecialResourceState::Rendering).await?;
        let chart = self.ctx.fetcher.fetch(&sr.spec.chart).await?;
        let parent_outputs: Vec<_> = parents.iter().map(|p| p.spec.set.clone()).collect();
        let mut values = compose(&chart.defaults, &parent_outputs, &resolved.fingerprint.to_values(), &sr.spec.set);
        let spec = serde_json::to_value(&sr.spec)
            .map_err(|e| ControllerError::Config(format!("cannot expose spec of {name} to templates: {e}")))?;
        values.insert("specialResource".to_string(), json!({ "name": name, "spec": spec }));

        let release = Release {
            name: name.to_string(),
            namespace: sr.release_namespace().to_string(),
        };
        let states = group_states(render_chart(&chart, &release, &values)?);
        debug!(
            "Chart {} rendered {} states for SpecialResource {}",
            chart.metadata.name,
            states.len(),
            name
        );

        status.progress(SpecialResourceState::Applying).await?;
        let target = ApplyTarget {
            release_name: release.name,
            release_namespace: release.namespace,
            node_selector: resolved.node_selector,
        };
        let sequencer = Sequencer::new(
            Applier::new(client, &self.ctx.kinds),
            ReadinessPoller::new(client, &self.ctx.kinds, self.ctx.settings.poll_interval),
            self.ctx.settings.state_timeout,
            &self.ctx.metrics,
        );
        let report = sequencer.apply(&states, &target).await?;
        Ok(Converged::Ready(report))
    }

    /// Declared parents, after checking none of them closes a cycle
    async fn load_parents(&self, sr: &SpecialResource) -> Result<Vec<SpecialResource>, ControllerError> {
        let client = &*self.ctx.client;
        let registry = DependencyRegistry::new(client, &self.ctx.settings.operator_namespace);
        let mut parents = Vec::with_capacity(sr.spec.dependencies.len());
        for parent in &sr.spec.dependencies {
            registry.check(parent, sr.name()).await?;
            let object = match client.get(&SpecialResource::key_for(parent)).await {
                Ok(object) => object,
                Err(ClusterError::NotFound(_)) => {
                    return Err(DependencyError::MissingParent {
                        parent: parent.clone(),
                        child: sr.name().to_string(),
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            };
            let parent: SpecialResource = serde_json::from_value(object.into_value()).map_err(ClusterError::from)?;
            parents.push(parent);
        }
        Ok(parents)
    }

    async fn ensure_finalizer(&self, sr: &SpecialResource) -> Result<(), ControllerError> {
        let finalizers = sr.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        let mut updated = finalizers;
        updated.push(FINALIZER.to_string());
        self.patch_finalizers(sr, updated).await?;
        debug!("Added finalizer to SpecialResource {}", sr.name());
        Ok(())
    }

    async fn patch_finalizers(&self, sr: &SpecialResource, finalizers: Vec<String>) -> Result<(), ControllerError> {
        self.ctx
            .client
            .patch_merge(
                &SpecialResource::key_for(sr.name()),
                &json!({ "metadata": { "finalizers": finalizers } }),
            )
            .await?;
        Ok(())
    }

    /// Tears down a deleted SpecialResource and releases its finalizer
    async fn finalize(&self, sr: &SpecialResource) -> Result<Action, ControllerError> {
        let name = sr.name();
        let finalizers = sr.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(Action::await_change());
        }

        info!("Tearing down SpecialResource {}", name);
        let client = &*self.ctx.client;
        StatusWriter::new(client, sr).set(SpecialResourceState::Tearing, None).await?;

        let deleted = teardown::tear_down(client, &self.ctx.kinds, name).await?;
        DependencyRegistry::new(client, &self.ctx.settings.operator_namespace)
            .remove(name)
            .await?;
        self.publish(
            sr,
            EventType::Normal,
            reasons::TORN_DOWN,
            actions::TEARDOWN,
            Some(format!("deleted {deleted} objects")),
        )
        .await;

        let remaining = finalizers.into_iter().filter(|f| f != FINALIZER).collect();
        self.patch_finalizers(sr, remaining).await?;
        self.backoff_states().remove(name);
        self.ctx.metrics.record_reconcile("torn_down");
        info!("SpecialResource {} torn down", name);
        Ok(Action::await_change())
    }
}
