//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! Only the replica holding the Lease runs reconciles. The holder renews
//! `renewTime` every renew interval; any replica may take over a Lease whose
//! `renewTime + leaseDurationSeconds` lies in the past. Every Lease write is
//! conditional on the resourceVersion that was read, so two replicas racing
//! for an expired Lease cannot both win.

use crate::error::ControllerError;
use chrono::{DateTime, SecondsFormat, Utc};
use cluster_client::{ClusterClient, ClusterError};
use crds::{Manifest, ObjectKey};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LEASE_API_VERSION: &str = "coordination.k8s.io/v1";
const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Identity of this replica: pod name plus a random suffix
pub fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

fn micro_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Competes for and holds the operator Lease
pub struct LeaderElector {
    client: Arc<dyn ClusterClient>,
    key: ObjectKey,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lease", &self.key)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Elector for the Lease `namespace/name`
    pub fn new(client: Arc<dyn ClusterClient>, namespace: &str, name: &str, identity: impl Into<String>) -> Self {
        Self {
            client,
            key: ObjectKey::namespaced(LEASE_API_VERSION, "Lease", namespace, name),
            identity: identity.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }

    fn lease_seconds(&self) -> i64 {
        i64::try_from(self.lease_duration.as_secs()).unwrap_or(i64::MAX)
    }

    /// True when the Lease was not renewed within its duration
    fn is_expired(lease: &Manifest, now: DateTime<Utc>) -> bool {
        let Some(renewed) = lease
            .get_str(&["spec", "renewTime"])
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        else {
            return true;
        };
        let duration = lease.get_i64(&["spec", "leaseDurationSeconds"]).unwrap_or(0);
        renewed.with_timezone(&Utc) + chrono::Duration::seconds(duration) < now
    }

    /// One election round: creates, renews or takes over the Lease.
    ///
    /// Returns whether this replica holds the Lease afterwards.
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool, ControllerError> {
        let live = match self.client.get(&self.key).await {
            Ok(live) => live,
            Err(ClusterError::NotFound(_)) => return self.create(now).await,
            Err(e) => return Err(e.into()),
        };

        let holder = live.get_str(&["spec", "holderIdentity"]).unwrap_or_default();
        let mut lease = live.clone();
        if holder == self.identity {
            lease.set(&["spec", "renewTime"], json!(micro_time(now)));
        } else if holder.is_empty() || Self::is_expired(&live, now) {
            let transitions = live.get_i64(&["spec", "leaseTransitions"]).unwrap_or(0);
            if !holder.is_empty() {
                info!("Lease {} held by {} expired, taking over", self.key, holder);
            }
            lease.set(
                &["spec"],
                json!({
                    "holderIdentity": self.identity,
                    "leaseDurationSeconds": self.lease_seconds(),
                    "acquireTime": micro_time(now),
                    "renewTime": micro_time(now),
                    "leaseTransitions": transitions + 1,
                }),
            );
        } else {
            debug!("Lease {} held by {}", self.key, holder);
            return Ok(false);
        }

        match self.client.update(&lease).await {
            Ok(_) => Ok(true),
            Err(ClusterError::Conflict(_)) => {
                debug!("Lease {} changed under us", self.key);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<bool, ControllerError> {
        let mut lease = Manifest::new(LEASE_API_VERSION, "Lease", &self.key.name);
        if let Some(namespace) = &self.key.namespace {
            lease.set_namespace(namespace);
        }
        lease.set(
            &["spec"],
            json!({
                "holderIdentity": self.identity,
                "leaseDurationSeconds": self.lease_seconds(),
                "acquireTime": micro_time(now),
                "renewTime": micro_time(now),
                "leaseTransitions": 0,
            }),
        );
        match self.client.create(&lease).await {
            Ok(_) => Ok(true),
            Err(ClusterError::AlreadyExists(_) | ClusterError::Conflict(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks until this replica leads; `false` when shut down first
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Result<bool, ControllerError> {
        info!("Waiting to acquire lease {} as {}", self.key, self.identity);
        loop {
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => {
                    info!("Acquired lease {}", self.key);
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => warn!("Lease {} election round failed: {}", self.key, e),
            }
            tokio::select! {
                () = shutdown.cancelled() => return Ok(false),
                () = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    /// Renews the Lease until shutdown. Fails with `LeaseLost` when another
    /// replica took it or it could not be renewed within its duration.
    pub async fn hold(&self, shutdown: &CancellationToken) -> Result<(), ControllerError> {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.renew_interval) => {}
            }
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    return Err(ControllerError::LeaseLost(format!("lease {} taken by another replica", self.key)));
                }
                Err(e) if last_renewed.elapsed() >= self.lease_duration => {
                    return Err(ControllerError::LeaseLost(format!(
                        "lease {} not renewed for {:?}: {}",
                        self.key,
                        last_renewed.elapsed(),
                        e
                    )));
                }
                Err(e) => warn!("Renewing lease {} failed: {}", self.key, e),
            }
        }
    }

    /// Gives the Lease up so another replica can take over immediately
    pub async fn release(&self) -> Result<(), ControllerError> {
        let mut lease = match self.client.get(&self.key).await {
            Ok(lease) => lease,
            Err(ClusterError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if lease.get_str(&["spec", "holderIdentity"]) != Some(self.identity.as_str()) {
            return Ok(());
        }
        lease.set(&["spec", "holderIdentity"], json!(""));
        self.client.update(&lease).await?;
        info!("Released lease {}", self.key);
        Ok(())
    }
}
