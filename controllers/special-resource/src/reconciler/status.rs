//! SpecialResource status writes
//!
//! Status is only patched when it would change. A SpecialResource that is
//! already Ready for its current generation keeps that status while an
//! unchanged spec is re-applied, so a converged reconcile writes nothing.
//! Likewise a SpecialResource waiting on its parent does not flip back to
//! Resolving each time the parent is re-checked.

use crate::error::ControllerError;
use cluster_client::ClusterClient;
use crds::{ObjectKey, SpecialResource, SpecialResourceState, SpecialResourceStatus};
use serde_json::json;
use tracing::debug;

/// Status patch body. `lastError: null` clears a previous error.
pub fn status_patch(status: &SpecialResourceStatus) -> serde_json::Value {
    json!({
        "status": {
            "state": status.state.as_str(),
            "lastError": status.last_error,
            "observedGeneration": status.observed_generation,
        }
    })
}

/// Writes the status of one SpecialResource during a reconcile
pub struct StatusWriter<'a> {
    client: &'a dyn ClusterClient,
    key: ObjectKey,
    generation: Option<i64>,
    current: Option<SpecialResourceStatus>,
}

impl std::fmt::Debug for StatusWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWriter")
            .field("key", &self.key)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl<'a> StatusWriter<'a> {
    /// Writer starting from the status `sr` was read with
    pub fn new(client: &'a dyn ClusterClient, sr: &SpecialResource) -> Self {
        Self {
            client,
            key: SpecialResource::key_for(sr.name()),
            generation: sr.metadata.generation,
            current: sr.status.clone(),
        }
    }

    /// Last known state
    pub fn state(&self) -> Option<SpecialResourceState> {
        self.current.as_ref().map(|s| s.state)
    }

    // Intermediate phases that would only repeat what the status already says
    fn is_redundant(&self, state: SpecialResourceState) -> bool {
        let Some(current) = self.current.as_ref().filter(|s| s.observed_generation == self.generation) else {
            return false;
        };
        match current.state {
            SpecialResourceState::Ready => true,
            SpecialResourceState::AwaitingParent => state == SpecialResourceState::Resolving,
            _ => false,
        }
    }

    /// Reports an intermediate phase, unless it is redundant for the current generation
    pub async fn progress(&mut self, state: SpecialResourceState) -> Result<(), ControllerError> {
        if self.is_redundant(state) {
            return Ok(());
        }
        self.set(state, None).await.map(|_| ())
    }

    /// Sets `state` and `last_error`; returns whether a patch was sent
    pub async fn set(&mut self, state: SpecialResourceState, last_error: Option<String>) -> Result<bool, ControllerError> {
        let desired = SpecialResourceStatus {
            state,
            last_error,
            observed_generation: self.generation,
        };
        if self.current.as_ref() == Some(&desired) {
            return Ok(false);
        }
        self.client.patch_status(&self.key, &status_patch(&desired)).await?;
        debug!("SpecialResource {} status -> {}", self.key.name, state);
        self.current = Some(desired);
        Ok(true)
    }
}
