//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the Kubernetes
//! client, reconciler, metrics endpoint and optional leader election
//! together and runs them until shutdown.

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crate::events::ClusterEventPublisher;
use crate::leader::{self, LeaderElector};
use crate::metrics::{self, Health, Metrics};
use crate::reconciler::kinds::KindRegistry;
use crate::reconciler::{Context, ReconcileSettings, Reconciler};
use crate::watcher;
use chart::ChartFetcher;
use cluster_client::{ClusterClient, KubeClusterClient};
use crds::SpecialResource;
use kube::{Api, Client};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Main controller for SpecialResource management.
pub struct Controller {
    config: OperatorConfig,
    api: Api<SpecialResource>,
    reconciler: Arc<Reconciler>,
    metrics: Arc<Metrics>,
    health: Health,
    elector: Option<LeaderElector>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("elector", &self.elector)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: OperatorConfig, shutdown: CancellationToken) -> Result<Self, ControllerError> {
        info!("Initializing Special Resource Operator");

        let kube_client = Client::try_default().await?;
        let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(kube_client.clone()));
        let metrics = Arc::new(Metrics::new()?);
        let identity = leader::default_identity();

        let ctx = Context {
            client: cluster.clone(),
            kinds: KindRegistry::default(),
            events: Arc::new(ClusterEventPublisher::new(cluster.clone(), identity.clone())),
            metrics: metrics.clone(),
            fetcher: ChartFetcher::new(&config.chart_cache_dir),
            settings: ReconcileSettings {
                operator_namespace: config.operator_namespace.clone(),
                state_timeout: config.state_timeout(),
                poll_interval: config.poll_interval(),
                reconcile_timeout: config.reconcile_timeout(),
            },
            shutdown: shutdown.clone(),
        };

        let elector = config
            .enable_leader_election
            .then(|| LeaderElector::new(cluster, &config.operator_namespace, &config.lease_name, identity));

        Ok(Self {
            api: Api::all(kube_client),
            reconciler: Arc::new(Reconciler::new(ctx)),
            metrics,
            health: Health::default(),
            elector,
            shutdown,
            config,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        let addr = self.config.metrics_socket_addr()?;
        let router = metrics::router(self.metrics.clone(), self.health.clone());
        let mut metrics_server = tokio::spawn(metrics::serve(addr, router, self.shutdown.clone()));

        if let Some(elector) = &self.elector {
            if !elector.acquire(&self.shutdown).await? {
                info!("Shut down before acquiring leadership");
                return Ok(());
            }
        }

        info!("Special Resource Operator running");
        self.health.set_ready(true);
        let mut sr_watcher = tokio::spawn(watcher::watch_special_resources(
            self.api.clone(),
            self.reconciler.clone(),
            self.config.concurrency,
            self.shutdown.clone(),
        ));
        let leadership = async {
            match &self.elector {
                Some(elector) => elector.hold(&self.shutdown).await,
                None => {
                    self.shutdown.cancelled().await;
                    Ok(())
                }
            }
        };

        let result = tokio::select! {
            result = &mut sr_watcher => result
                .map_err(|e| ControllerError::Watch(format!("SpecialResource watcher panicked: {}", e)))
                .and_then(|r| r),
            result = &mut metrics_server => result
                .map_err(|e| ControllerError::Watch(format!("Metrics server panicked: {}", e)))
                .and_then(|r| r),
            result = leadership => result,
        };

        // Stop whatever is still running and let in-flight reconciles see the cancellation
        self.shutdown.cancel();
        self.health.set_ready(false);
        if !sr_watcher.is_finished() {
            if let Err(e) = sr_watcher.await {
                warn!("SpecialResource watcher did not stop cleanly: {}", e);
            }
        }
        if let Some(elector) = &self.elector {
            if let Err(e) = elector.release().await {
                warn!("Failed to release lease: {}", e);
            }
        }

        info!("Special Resource Operator stopped");
        result
    }
}
