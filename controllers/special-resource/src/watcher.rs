//! SpecialResource watcher.
//!
//! Drives reconciles through `kube_runtime::Controller`, which handles
//! reconnection, per-object serialization and requeues. A SpecialResource
//! also triggers a reconcile of every SpecialResource that depends on it, so
//! a child waiting on its parent moves on as soon as the parent turns Ready.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::SpecialResource;
use futures::StreamExt;
use kube::Api;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, controller::Config as ControllerConfig, watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Names of the SpecialResources among `candidates` that declare `parent`
pub fn dependents_of<'a>(
    parent: &str,
    candidates: impl IntoIterator<Item = &'a SpecialResource>,
) -> Vec<ObjectRef<SpecialResource>> {
    candidates
        .into_iter()
        .filter(|child| child.spec.dependencies.iter().any(|d| d == parent))
        .map(ObjectRef::from_obj)
        .collect()
}

/// Watches SpecialResources until `shutdown` is cancelled
pub async fn watch_special_resources(
    api: Api<SpecialResource>,
    reconciler: Arc<Reconciler>,
    concurrency: u16,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    info!("Starting SpecialResource watcher");

    let controller = Controller::new(api.clone(), watcher::Config::default());
    let store = controller.store();

    let reconcile = |sr: Arc<SpecialResource>, ctx: Arc<Reconciler>| async move { ctx.reconcile(&sr).await };
    let error_policy =
        |sr: Arc<SpecialResource>, error: &ControllerError, ctx: Arc<Reconciler>| ctx.error_action(sr.name(), error);

    // Debounce batches the burst of status writes a reconcile produces
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(5))
        .concurrency(concurrency);

    let run = controller
        .watches(api, watcher::Config::default(), move |parent: SpecialResource| {
            let children = store.state();
            dependents_of(parent.name(), children.iter().map(Arc::as_ref))
        })
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((sr, _)) => debug!("Reconciled SpecialResource {}", sr.name),
                Err(e) => warn!("SpecialResource controller error: {}", e),
            }
        });

    tokio::select! {
        () = shutdown.cancelled() => info!("SpecialResource watcher stopping"),
        () = run => warn!("SpecialResource watch stream ended"),
    }
    Ok(())
}
