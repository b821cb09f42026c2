//! Dependency registry
//!
//! Child -> parent relations live in the `data` of the
//! `special-resource-dependencies` ConfigMap in the operator namespace. A
//! missing ConfigMap reads as empty and is created by the first write.
//! Writes are conditional on the resourceVersion that was read and are
//! retried when another reconcile got there first.

use crate::error::{ControllerError, DependencyError};
use cluster_client::{ClusterClient, ClusterError};
use crds::labels::DEPENDENCY_CONFIGMAP;
use crds::{Manifest, ObjectKey};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Attempts per write before giving up on conflicts
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Persistent child -> parent mapping
#[derive(Clone, Copy)]
pub struct DependencyRegistry<'a> {
    client: &'a dyn ClusterClient,
    namespace: &'a str,
}

/// ConfigMap contents and the object they were read from
struct Snapshot {
    records: BTreeMap<String, String>,
    live: Option<Manifest>,
}

impl<'a> DependencyRegistry<'a> {
    /// Registry backed by the ConfigMap in `namespace`
    pub fn new(client: &'a dyn ClusterClient, namespace: &'a str) -> Self {
        Self { client, namespace }
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::namespaced("v1", "ConfigMap", self.namespace, DEPENDENCY_CONFIGMAP)
    }

    async fn load(&self) -> Result<Snapshot, ControllerError> {
        match self.client.get(&self.key()).await {
            Ok(live) => {
                let records = live
                    .get(&["data"])
                    .and_then(Value::as_object)
                    .map(|data| {
                        data.iter()
                            .filter_map(|(child, parent)| parent.as_str().map(|p| (child.clone(), p.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Snapshot { records, live: Some(live) })
            }
            Err(ClusterError::NotFound(_)) => Ok(Snapshot {
                records: BTreeMap::new(),
                live: None,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Recorded parent of `child`, empty when there is none
    pub async fn parent_of(&self, child: &str) -> Result<String, ControllerError> {
        Ok(self.load().await?.records.get(child).cloned().unwrap_or_default())
    }

    /// Fails when recording `child -> parent` would create a cycle; writes nothing
    pub async fn check(&self, parent: &str, child: &str) -> Result<(), ControllerError> {
        let snapshot = self.load().await?;
        match find_cycle(&snapshot.records, parent, child) {
            Some(chain) => Err(cycle(parent, child, chain)),
            None => Ok(()),
        }
    }

    /// Records `child -> parent`, replacing any previous parent of `child`
    pub async fn record_dependency(&self, parent: &str, child: &str) -> Result<(), ControllerError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut snapshot = self.load().await?;
            if snapshot.records.get(child).map(String::as_str) == Some(parent) {
                return Ok(());
            }
            if let Some(chain) = find_cycle(&snapshot.records, parent, child) {
                return Err(cycle(parent, child, chain));
            }
            snapshot.records.insert(child.to_string(), parent.to_string());

            match self.write(snapshot).await {
                Ok(()) => {
                    info!("Recorded dependency {} -> {}", child, parent);
                    return Ok(());
                }
                Err(ClusterError::Conflict(_) | ClusterError::AlreadyExists(_)) => {
                    debug!("Dependency record write conflicted (attempt {}), retrying", attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ClusterError::Conflict(self.key().to_string()).into())
    }

    /// Drops the record where `child` is the child, if any
    pub async fn remove(&self, child: &str) -> Result<(), ControllerError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut snapshot = self.load().await?;
            if snapshot.records.remove(child).is_none() {
                return Ok(());
            }
            match self.write(snapshot).await {
                Ok(()) => {
                    info!("Removed dependency record of {}", child);
                    return Ok(());
                }
                Err(ClusterError::Conflict(_) | ClusterError::NotFound(_)) => {
                    debug!("Dependency record removal conflicted (attempt {}), retrying", attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ClusterError::Conflict(self.key().to_string()).into())
    }

    async fn write(&self, snapshot: Snapshot) -> Result<(), ClusterError> {
        let data = Value::Object(
            snapshot
                .records
                .into_iter()
                .map(|(child, parent)| (child, Value::String(parent)))
                .collect(),
        );
        match snapshot.live {
            // resourceVersion from the read makes the update conditional
            Some(mut live) => {
                live.set(&["data"], data);
                self.client.update(&live).await.map(|_| ())
            }
            None => {
                let mut config_map = Manifest::new("v1", "ConfigMap", DEPENDENCY_CONFIGMAP);
                config_map.set_namespace(self.namespace);
                config_map.set(&["data"], data);
                self.client.create(&config_map).await.map(|_| ())
            }
        }
    }
}

fn cycle(parent: &str, child: &str, chain: Vec<String>) -> ControllerError {
    DependencyError::Cycle {
        parent: parent.to_string(),
        child: child.to_string(),
        chain,
    }
    .into()
}

/// Walks the ancestry of `parent`; returns the loop if it reaches `child`
fn find_cycle(records: &BTreeMap<String, String>, parent: &str, child: &str) -> Option<Vec<String>> {
    let mut chain = vec![child.to_string(), parent.to_string()];
    let mut seen = HashSet::from([parent]);
    let mut current = parent;
    loop {
        if current == child {
            return Some(chain);
        }
        let next = records.get(current).map(String::as_str).filter(|p| !p.is_empty())?;
        if !seen.insert(next) {
            // Pre-existing loop not involving `child`
            return None;
        }
        chain.push(next.to_string());
        current = next;
    }
}
