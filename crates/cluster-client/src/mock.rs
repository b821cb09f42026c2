//! Mock ClusterClient for unit testing
//!
//! Objects are kept in memory keyed by [`ObjectKey`]. The mock behaves like
//! an API server where it matters to the operator: resourceVersions are
//! assigned and checked, updates keep the live status, deleting an object
//! with finalizers only marks it, and kinds can be made "not registered"
//! until a CRD declaring them is created and discovery is refreshed.
//! Every call is recorded so tests can assert on what was (not) mutated.

use crate::cluster_trait::ClusterClient;
use crate::error::ClusterError;
use crate::selector;
use crds::{Manifest, ObjectKey};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A recorded call against the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    /// `get`
    Get(ObjectKey),
    /// `create`
    Create(ObjectKey),
    /// `update`
    Update(ObjectKey),
    /// `delete`
    Delete(ObjectKey),
    /// `list`
    List {
        /// Listed kind
        kind: String,
        /// Namespace filter
        namespace: Option<String>,
        /// Label selector
        label_selector: Option<String>,
    },
    /// `list_all_kinds`
    ListAllKinds(String),
    /// `patch_merge`
    PatchMerge(ObjectKey),
    /// `patch_status`
    PatchStatus(ObjectKey),
    /// `refresh_discovery`
    RefreshDiscovery,
}

impl ClusterCall {
    /// True for calls that write to the cluster
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            ClusterCall::Create(_)
                | ClusterCall::Update(_)
                | ClusterCall::Delete(_)
                | ClusterCall::PatchMerge(_)
                | ClusterCall::PatchStatus(_)
        )
    }

    /// Key of the object the call targeted, if any
    pub fn key(&self) -> Option<&ObjectKey> {
        match self {
            ClusterCall::Get(key)
            | ClusterCall::Create(key)
            | ClusterCall::Update(key)
            | ClusterCall::Delete(key)
            | ClusterCall::PatchMerge(key)
            | ClusterCall::PatchStatus(key) => Some(key),
            _ => None,
        }
    }
}

/// In-memory ClusterClient
#[derive(Debug, Clone, Default)]
pub struct MockClusterClient {
    objects: Arc<Mutex<BTreeMap<ObjectKey, Manifest>>>,
    calls: Arc<Mutex<Vec<ClusterCall>>>,
    // Bodies passed to `create` and `update`, as submitted
    submitted: Arc<Mutex<Vec<Manifest>>>,
    // Kinds the API server does not serve
    unregistered: Arc<Mutex<HashSet<String>>>,
    // Kinds declared by a created CRD, served after the next discovery refresh
    pending_registration: Arc<Mutex<HashSet<String>>>,
    // Remaining injected conflicts per object, consumed by `update`
    conflicts: Arc<Mutex<HashMap<ObjectKey, usize>>>,
    // HTTP codes returned for writes to a kind
    rejected_kinds: Arc<Mutex<HashMap<String, u16>>>,
    // HTTP codes returned when `list_all_kinds` lists a kind
    failing_lists: Arc<Mutex<HashMap<String, u16>>>,
    next_version: Arc<Mutex<u64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockClusterClient {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as-is (for test setup), assigning a resourceVersion when absent
    pub fn insert(&self, mut object: Manifest) {
        if object.resource_version().is_none() {
            object.set(&["metadata", "resourceVersion"], Value::String(self.next_version()));
        }
        lock(&self.objects).insert(object.key(), object);
    }

    /// Current copy of an object
    pub fn object(&self, key: &ObjectKey) -> Option<Manifest> {
        lock(&self.objects).get(key).cloned()
    }

    /// Every stored object
    pub fn objects(&self) -> Vec<Manifest> {
        lock(&self.objects).values().cloned().collect()
    }

    /// Stored objects of one kind
    pub fn objects_of_kind(&self, kind: &str) -> Vec<Manifest> {
        lock(&self.objects).values().filter(|o| o.kind() == kind).cloned().collect()
    }

    /// Overwrite an object's `status` (simulates a workload controller)
    pub fn set_status(&self, key: &ObjectKey, status: Value) {
        let version = self.next_version();
        if let Some(object) = lock(&self.objects).get_mut(key) {
            object.set(&["status"], status);
            object.set(&["metadata", "resourceVersion"], Value::String(version));
        }
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<ClusterCall> {
        lock(&self.calls).clone()
    }

    /// Calls that wrote to the cluster
    pub fn mutations(&self) -> Vec<ClusterCall> {
        lock(&self.calls).iter().filter(|c| c.is_mutation()).cloned().collect()
    }

    /// Bodies passed to `create` and `update`, in call order
    pub fn submitted(&self) -> Vec<Manifest> {
        lock(&self.submitted).clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
        lock(&self.submitted).clear();
    }

    /// Make `kind` unknown to the API server
    pub fn unregister_kind(&self, kind: &str) {
        lock(&self.unregistered).insert(kind.to_string());
    }

    /// Fail the next `count` conditional updates of `key` with `Conflict`
    pub fn inject_conflicts(&self, key: &ObjectKey, count: usize) {
        lock(&self.conflicts).insert(key.clone(), count);
    }

    /// Reject every create/update of `kind` with HTTP `code`
    pub fn reject_kind(&self, kind: &str, code: u16) {
        lock(&self.rejected_kinds).insert(kind.to_string(), code);
    }

    /// Make `list_all_kinds` fail with `code` when it reaches `kind`.
    ///
    /// Codes for unlistable collections (403, 404, 405) only hide the kind,
    /// like the real client; any other code fails the whole call.
    pub fn fail_list(&self, kind: &str, code: u16) {
        lock(&self.failing_lists).insert(kind.to_string(), code);
    }

    fn next_version(&self) -> String {
        let mut version = lock(&self.next_version);
        *version += 1;
        version.to_string()
    }

    fn record(&self, call: ClusterCall) {
        lock(&self.calls).push(call);
    }

    fn check_registered(&self, kind: &str, api_version: &str) -> Result<(), ClusterError> {
        if lock(&self.unregistered).contains(kind) {
            return Err(ClusterError::KindNotRegistered(format!("{api_version}/{kind}")));
        }
        Ok(())
    }

    fn check_rejected(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        match lock(&self.rejected_kinds).get(&key.kind) {
            Some(code) => Err(ClusterError::Rejected {
                target: key.to_string(),
                code: *code,
                message: "rejected by mock".to_string(),
            }),
            None => Ok(()),
        }
    }

    fn take_conflict(&self, key: &ObjectKey) -> bool {
        let mut conflicts = lock(&self.conflicts);
        match conflicts.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    // Objects marked for deletion go away once their finalizers are gone
    fn collect_if_finalized(objects: &mut BTreeMap<ObjectKey, Manifest>, key: &ObjectKey) {
        let finalized = objects.get(key).is_some_and(|o| {
            o.get(&["metadata", "deletionTimestamp"]).is_some()
                && o.get(&["metadata", "finalizers"])
                    .and_then(Value::as_array)
                    .is_none_or(Vec::is_empty)
        });
        if finalized {
            objects.remove(key);
        }
    }
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn get(&self, key: &ObjectKey) -> Result<Manifest, ClusterError> {
        self.record(ClusterCall::Get(key.clone()));
        self.check_registered(&key.kind, &key.api_version)?;
        lock(&self.objects)
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))
    }

    async fn create(&self, object: &Manifest) -> Result<Manifest, ClusterError> {
        let key = object.key();
        self.record(ClusterCall::Create(key.clone()));
        lock(&self.submitted).push(object.clone());
        self.check_registered(&key.kind, &key.api_version)?;
        self.check_rejected(&key)?;

        let mut created = object.clone();
        created.set(&["metadata", "resourceVersion"], Value::String(self.next_version()));
        created.set(&["metadata", "generation"], Value::from(1));
        created.set(&["metadata", "uid"], Value::String(format!("uid-{}", key.name)));

        {
            let mut objects = lock(&self.objects);
            if objects.contains_key(&key) {
                return Err(ClusterError::AlreadyExists(key.to_string()));
            }
            objects.insert(key, created.clone());
        }

        if object.kind() == "CustomResourceDefinition" {
            if let Some(kind) = object.get_str(&["spec", "names", "kind"]) {
                lock(&self.pending_registration).insert(kind.to_string());
            }
        }
        Ok(created)
    }

    async fn update(&self, object: &Manifest) -> Result<Manifest, ClusterError> {
        let key = object.key();
        self.record(ClusterCall::Update(key.clone()));
        lock(&self.submitted).push(object.clone());
        self.check_registered(&key.kind, &key.api_version)?;
        self.check_rejected(&key)?;

        let version = self.next_version();
        let mut objects = lock(&self.objects);
        let live = objects.get(&key).ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        if let Some(expected) = object.resource_version() {
            if Some(expected) != live.resource_version() || self.take_conflict(&key) {
                return Err(ClusterError::Conflict(key.to_string()));
            }
        }

        let mut updated = object.clone();
        if let Some(status) = live.get(&["status"]) {
            updated.set(&["status"], status.clone());
        }
        let generation = live.generation().unwrap_or(1);
        let next_generation = if live.get(&["spec"]) == object.get(&["spec"]) {
            generation
        } else {
            generation + 1
        };
        updated.set(&["metadata", "generation"], Value::from(next_generation));
        updated.set(&["metadata", "resourceVersion"], Value::String(version));
        if let Some(uid) = live.get(&["metadata", "uid"]) {
            updated.set(&["metadata", "uid"], uid.clone());
        }
        objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        self.record(ClusterCall::Delete(key.clone()));
        self.check_registered(&key.kind, &key.api_version)?;

        let mut objects = lock(&self.objects);
        let object = objects.get_mut(key).ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        let has_finalizers = object
            .get(&["metadata", "finalizers"])
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            object.set(
                &["metadata", "deletionTimestamp"],
                Value::String("2024-01-01T00:00:00Z".to_string()),
            );
        } else {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Manifest>, ClusterError> {
        self.record(ClusterCall::List {
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            label_selector: label_selector.map(str::to_string),
        });
        self.check_registered(kind, api_version)?;

        Ok(lock(&self.objects)
            .values()
            .filter(|o| o.kind() == kind && o.api_version() == api_version)
            .filter(|o| namespace.is_none() || o.namespace() == namespace)
            .filter(|o| label_selector.is_none_or(|s| selector::matches(s, o)))
            .cloned()
            .collect())
    }

    async fn list_all_kinds(&self, label_selector: &str) -> Result<Vec<Manifest>, ClusterError> {
        self.record(ClusterCall::ListAllKinds(label_selector.to_string()));
        let mut hidden = lock(&self.unregistered).clone();
        for (kind, code) in lock(&self.failing_lists).iter() {
            let error = if *code == 404 {
                ClusterError::NotFound(kind.clone())
            } else {
                ClusterError::Rejected {
                    target: kind.clone(),
                    code: *code,
                    message: "list failed".to_string(),
                }
            };
            if !error.is_unlistable() {
                return Err(error);
            }
            hidden.insert(kind.clone());
        }
        Ok(lock(&self.objects)
            .values()
            .filter(|o| !hidden.contains(o.kind()))
            .filter(|o| selector::matches(label_selector, o))
            .cloned()
            .collect())
    }

    async fn patch_merge(&self, key: &ObjectKey, patch: &Value) -> Result<Manifest, ClusterError> {
        self.record(ClusterCall::PatchMerge(key.clone()));
        self.check_registered(&key.kind, &key.api_version)?;

        let version = self.next_version();
        let mut objects = lock(&self.objects);
        let object = objects.get_mut(key).ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        let mut value = object.as_value().clone();
        merge_patch(&mut value, patch);
        *object = Manifest::from_value(value)?;
        object.set(&["metadata", "resourceVersion"], Value::String(version));
        let patched = object.clone();
        Self::collect_if_finalized(&mut objects, key);
        Ok(patched)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<Manifest, ClusterError> {
        self.record(ClusterCall::PatchStatus(key.clone()));
        self.check_registered(&key.kind, &key.api_version)?;

        let version = self.next_version();
        let mut objects = lock(&self.objects);
        let object = objects.get_mut(key).ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        if let Some(status_patch) = patch.get("status") {
            let mut status = object.get(&["status"]).cloned().unwrap_or(Value::Null);
            merge_patch(&mut status, status_patch);
            object.set(&["status"], status);
        }
        object.set(&["metadata", "resourceVersion"], Value::String(version));
        Ok(object.clone())
    }

    async fn refresh_discovery(&self) -> Result<(), ClusterError> {
        self.record(ClusterCall::RefreshDiscovery);
        let pending: Vec<String> = lock(&self.pending_registration).drain().collect();
        let mut unregistered = lock(&self.unregistered);
        for kind in pending {
            unregistered.remove(&kind);
        }
        Ok(())
    }
}
