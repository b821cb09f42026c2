//! Release teardown
//!
//! Ownership is reconstructed from live cluster state: every object carrying
//! the managed-by label and this release's name annotation belongs to the
//! SpecialResource. Namespaced objects go first and cluster-scoped ones
//! (namespaces, cluster roles) last, so namespaces are not pulled out from
//! under objects still being deleted.

use crate::error::ControllerError;
use crate::reconciler::kinds::KindRegistry;
use cluster_client::{ClusterClient, ClusterError};
use crds::Manifest;
use crds::labels::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, RELEASE_NAME_ANNOTATION};
use tracing::{debug, info};

/// True when `object` was applied for the release `release_name`
pub fn owned_by(object: &Manifest, release_name: &str) -> bool {
    object.label(MANAGED_BY_LABEL) == Some(MANAGED_BY_VALUE) && object.annotation(RELEASE_NAME_ANNOTATION) == Some(release_name)
}

/// Deletes every object owned by `release_name`; returns how many were deleted
pub async fn tear_down(
    client: &dyn ClusterClient,
    kinds: &KindRegistry,
    release_name: &str,
) -> Result<usize, ControllerError> {
    let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
    let (cluster_scoped, namespaced): (Vec<Manifest>, Vec<Manifest>) = client
        .list_all_kinds(&selector)
        .await?
        .into_iter()
        .filter(|object| owned_by(object, release_name))
        .partition(|object| object.namespace().is_none() || kinds.is_cluster_scoped(object.kind()));

    let mut deleted = 0;
    for object in namespaced.iter().chain(cluster_scoped.iter()) {
        let key = object.key();
        match client.delete(&key).await {
            Ok(()) => {
                debug!("Deleted {}", key);
                deleted += 1;
            }
            Err(ClusterError::NotFound(_)) => debug!("{} already gone", key),
            Err(e) => return Err(e.into()),
        }
    }
    info!("Tore down {} objects of release {}", deleted, release_name);
    Ok(deleted)
}
