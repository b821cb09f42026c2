//! State sequencing
//!
//! States are walked in ascending key order. Within a state every manifest
//! is applied (concurrently) before the readiness set is awaited, and the
//! next state starts only once the whole readiness set converged. All
//! readiness waits of a state share one deadline.

use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::applier::{Applied, Applier, ApplyTarget};
use crate::reconciler::readiness::ReadinessPoller;
use chart::State;
use futures::future::try_join_all;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Counts from one rollout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutReport {
    /// States walked
    pub states: usize,
    /// Objects created
    pub created: usize,
    /// Objects updated
    pub updated: usize,
    /// Objects already up to date
    pub unchanged: usize,
}

impl RolloutReport {
    fn add(&mut self, applied: &[Applied]) {
        use crate::reconciler::applier::ApplyOutcome;
        for a in applied {
            match a.outcome {
                ApplyOutcome::Created => self.created += 1,
                ApplyOutcome::Updated => self.updated += 1,
                ApplyOutcome::Unchanged => self.unchanged += 1,
            }
        }
    }
}

/// Applies states in order, gating each on readiness
#[derive(Clone, Copy)]
pub struct Sequencer<'a> {
    applier: Applier<'a>,
    poller: ReadinessPoller<'a>,
    state_timeout: Duration,
    metrics: &'a Metrics,
}

impl<'a> Sequencer<'a> {
    /// Sequencer with a per-state readiness deadline of `state_timeout`
    pub fn new(applier: Applier<'a>, poller: ReadinessPoller<'a>, state_timeout: Duration, metrics: &'a Metrics) -> Self {
        Self {
            applier,
            poller,
            state_timeout,
            metrics,
        }
    }

    /// Rolls out `states`; failures carry the key of the state they happened in
    pub async fn apply(&self, states: &[State], target: &ApplyTarget) -> Result<RolloutReport, ControllerError> {
        let mut ordered: Vec<&State> = states.iter().collect();
        ordered.sort_by_key(|s| s.key);

        let mut report = RolloutReport::default();
        for state in ordered {
            let started = Instant::now();
            let applied = self
                .apply_state(state, target)
                .await
                .map_err(|e| e.in_state(state.key))?;
            report.add(&applied);
            report.states += 1;
            self.metrics.observe_state(started.elapsed());
            info!(
                "State {} of {} done: {} objects in {:?}",
                state.key,
                target.release_name,
                applied.len(),
                started.elapsed()
            );
        }
        Ok(report)
    }

    async fn apply_state(&self, state: &State, target: &ApplyTarget) -> Result<Vec<Applied>, ControllerError> {
        let applied = try_join_all(
            state
                .manifests
                .iter()
                .map(|rendered| self.applier.apply_one(rendered.manifest.clone(), target)),
        )
        .await?;
        for a in &applied {
            self.metrics.record_apply(a.outcome);
        }

        let deadline = Instant::now() + self.state_timeout;
        try_join_all(
            applied
                .iter()
                .filter(|a| self.poller.rule_for(&a.object).is_some())
                .map(|a| self.poller.wait_ready(&a.object, deadline)),
        )
        .await?;
        Ok(applied)
    }
}
