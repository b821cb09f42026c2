//! kube-rs backed cluster client
//!
//! Kinds are resolved to API resources through discovery and cached per
//! `apiVersion/kind`. `refresh_discovery` drops the cache, which is how the
//! applier recovers from "kind not registered" after a CRD is installed.

use crate::cluster_trait::ClusterClient;
use crate::error::ClusterError;
use crds::{Manifest, ObjectKey};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{GroupVersionKind, TypeMeta};
use kube::discovery::{self, verbs, ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Cluster client backed by a kube-rs [`Client`]
pub struct KubeClusterClient {
    client: Client,
    kinds: RwLock<HashMap<String, (ApiResource, ApiCapabilities)>>,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Wraps an existing kube-rs client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            kinds: RwLock::new(HashMap::new()),
        }
    }

    /// Underlying kube-rs client (used for event recording)
    pub fn kube_client(&self) -> &Client {
        &self.client
    }

    async fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, ApiCapabilities), ClusterError> {
        let cache_key = format!("{api_version}/{kind}");
        if let Some(found) = self.kinds.read().await.get(&cache_key) {
            return Ok(found.clone());
        }

        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);
        match discovery::pinned_kind(&self.client, &gvk).await {
            Ok(found) => {
                debug!("Resolved {} to resource {}", cache_key, found.0.plural);
                self.kinds.write().await.insert(cache_key, found.clone());
                Ok(found)
            }
            Err(kube::Error::Discovery(e)) => {
                debug!("Discovery has no {}: {}", cache_key, e);
                Err(ClusterError::KindNotRegistered(cache_key))
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(ClusterError::KindNotRegistered(cache_key))
            }
            Err(e) => Err(ClusterError::from_kube(&cache_key, e)),
        }
    }

    async fn api_for(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, ApiResource), ClusterError> {
        let (resource, capabilities) = self.resolve(api_version, kind).await?;
        let api = if capabilities.scope == Scope::Namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
                None => Api::default_namespaced_with(self.client.clone(), &resource),
            }
        } else {
            Api::all_with(self.client.clone(), &resource)
        };
        Ok((api, resource))
    }

    async fn api_for_key(&self, key: &ObjectKey) -> Result<(Api<DynamicObject>, ApiResource), ClusterError> {
        self.api_for(&key.api_version, &key.kind, key.namespace.as_deref()).await
    }
}

fn to_dynamic(object: &Manifest) -> Result<DynamicObject, ClusterError> {
    Ok(serde_json::from_value(object.as_value().clone())?)
}

/// List items come back without type information; restore it from the resource
fn from_dynamic(mut object: DynamicObject, resource: &ApiResource) -> Result<Manifest, ClusterError> {
    if object.types.is_none() {
        object.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
    Ok(Manifest::from_value(serde_json::to_value(object)?)?)
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, key: &ObjectKey) -> Result<Manifest, ClusterError> {
        let (api, resource) = self.api_for_key(key).await?;
        let object = api
            .get(&key.name)
            .await
            .map_err(|e| ClusterError::from_kube(&key.to_string(), e))?;
        from_dynamic(object, &resource)
    }

    async fn create(&self, object: &Manifest) -> Result<Manifest, ClusterError> {
        let key = object.key();
        let (api, resource) = self.api_for_key(&key).await?;
        let created = api
            .create(&PostParams::default(), &to_dynamic(object)?)
            .await
            .map_err(|e| ClusterError::from_kube(&key.to_string(), e))?;
        from_dynamic(created, &resource)
    }

    async fn update(&self, object: &Manifest) -> Result<Manifest, ClusterError> {
        let key = object.key();
        let (api, resource) = self.api_for_key(&key).await?;
        let updated = api
            .replace(&key.name, &PostParams::default(), &to_dynamic(object)?)
            .await
            .map_err(|e| ClusterError::from_kube(&key.to_string(), e))?;
        from_dynamic(updated, &resource)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        let (api, _) = self.api_for_key(key).await?;
        api.delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| ClusterError::from_kube(&key.to_string(), e))?;
        Ok(())
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Manifest>, ClusterError> {
        let (resource, capabilities) = self.resolve(api_version, kind).await?;
        let api: Api<DynamicObject> = match namespace {
            Some(ns) if capabilities.scope == Scope::Namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        };
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = api
            .list(&params)
            .await
            .map_err(|e| ClusterError::from_kube(&format!("{api_version}/{kind}"), e))?;
        list.items
            .into_iter()
            .map(|object| from_dynamic(object, &resource))
            .collect()
    }

    async fn list_all_kinds(&self, label_selector: &str) -> Result<Vec<Manifest>, ClusterError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let params = ListParams::default().labels(label_selector);
        let mut seen = HashSet::new();
        let mut objects = Vec::new();

        for group in discovery.groups() {
            for (resource, capabilities) in group.recommended_resources() {
                if !capabilities.supports_operation(verbs::LIST) || !capabilities.supports_operation(verbs::DELETE) {
                    continue;
                }
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
                let list = match api.list(&params).await {
                    Ok(list) => list,
                    Err(e) => {
                        let error = ClusterError::from_kube(&format!("{}/{}", resource.api_version, resource.kind), e);
                        if !error.is_unlistable() {
                            return Err(error);
                        }
                        debug!("Skipping {} while listing {}: {}", resource.kind, label_selector, error);
                        continue;
                    }
                };
                for object in list.items {
                    // The same object can be served under several group versions
                    if let Some(uid) = object.metadata.uid.clone() {
                        if !seen.insert(uid) {
                            continue;
                        }
                    }
                    objects.push(from_dynamic(object, &resource)?);
                }
            }
        }

        info!("Found {} objects matching {}", objects.len(), label_selector);
        Ok(objects)
    }

    async fn patch_merge(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<Manifest, ClusterError> {
        let (api, resource) = self.api_for_key(key).await?;
        let patched = api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| ClusterError::from_kube(&key.to_string(), e))?;
        from_dynamic(patched, &resource)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<Manifest, ClusterError> {
        let (api, resource) = self.api_for_key(key).await?;
        let patched = api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| ClusterError::from_kube(&key.to_string(), e))?;
        from_dynamic(patched, &resource)
    }

    async fn refresh_discovery(&self) -> Result<(), ClusterError> {
        let mut kinds = self.kinds.write().await;
        info!("Refreshing API discovery cache ({} kinds cached)", kinds.len());
        kinds.clear();
        Ok(())
    }
}
