//! Typed object store on top of a [`KVStore`].
//!
//! Objects are stored as JSON under their storage key, with their
//! `apiVersion` and `kind` filled in. Every write runs in one backend
//! transaction that bumps a global revision counter, maintains the label and
//! owner indices, and emits a watch event once committed.
//!
//! Deletion honours finalizers: deleting an object that still carries
//! finalizers only stamps `deletionTimestamp`; the object disappears on the
//! first write that leaves it with a deletion timestamp and no finalizers.

use crate::encoding::REVISION_KEY;
use crate::{IndexKey, KVStore, KeyEncoder, Keyspace, Transaction};
use cirrus_core::{
    CirrusError, GroupVersionKind, Resource, ResourceEvent, ResourceKey, Result,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration for the watch event channel
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the broadcast channel
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Filter for [`ObjectStore::list`]
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    /// Restrict to one namespace; ignored for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Every label must match exactly
    pub labels: BTreeMap<String, String>,
    /// Only objects carrying an owner reference with this uid
    pub owner_uid: Option<String>,
}

impl ListParams {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn owned_by(mut self, uid: impl Into<String>) -> Self {
        self.owner_uid = Some(uid.into());
        self
    }
}

/// Outcome of a single-object write
enum Written {
    Added(Value),
    Modified(Value),
    Removed(Value),
    Unchanged(Value),
}

impl Written {
    fn into_value(self) -> Value {
        match self {
            Written::Added(v)
            | Written::Modified(v)
            | Written::Removed(v)
            | Written::Unchanged(v) => v,
        }
    }
}

/// Object store shared by all reconcilers
pub struct ObjectStore {
    kv: Arc<dyn KVStore>,
    event_tx: broadcast::Sender<ResourceEvent>,
}

impl ObjectStore {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self::with_config(kv, EventBusConfig::default())
    }

    pub fn with_config(kv: Arc<dyn KVStore>, config: EventBusConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.capacity);
        Self { kv, event_tx }
    }

    /// Subscribe to watch events of every kind
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.event_tx.subscribe()
    }

    /// Get an object; a missing object is a `ResourceNotFound` error
    pub fn get<T: Resource>(&self, namespace: &str, name: &str) -> Result<T> {
        let key = T::key_for(namespace, name);
        self.get_opt(namespace, name)?
            .ok_or_else(|| CirrusError::resource_not_found(key.to_string()))
    }

    /// Get an object if it exists
    pub fn get_opt<T: Resource>(&self, namespace: &str, name: &str) -> Result<Option<T>> {
        let key = T::key_for(namespace, name);
        debug!("Getting object: {}", key);

        match self.read_value(&key)? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    /// Get the raw JSON of an object
    pub fn get_value(&self, key: &ResourceKey) -> Result<Option<Value>> {
        self.read_value(key)
    }

    /// List objects of a kind
    pub fn list<T: Resource>(&self, params: &ListParams) -> Result<Vec<T>> {
        let namespace = if T::NAMESPACED {
            params.namespace.as_deref()
        } else {
            None
        };
        let values = self.list_values(
            &T::gvk(),
            namespace,
            &params.labels,
            params.owner_uid.as_deref(),
        )?;
        values.into_iter().map(decode).collect()
    }

    /// List raw JSON objects of any kind
    pub fn list_values(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
        owner_uid: Option<&str>,
    ) -> Result<Vec<Value>> {
        let prefix = KeyEncoder::encode_prefix(gvk, namespace);
        debug!("Listing objects with prefix: {}", prefix);

        // Narrow through an index when one applies, then verify every filter
        let candidates: Vec<Value> = if let Some(uid) = owner_uid {
            self.indexed(&IndexKey::encode_prefix_for_owner(uid), &prefix)?
        } else if let Some((key, value)) = labels.iter().next() {
            self.indexed(&IndexKey::encode_prefix_for_label(key, value), &prefix)?
        } else {
            self.kv
                .scan(Keyspace::Objects, prefix.as_bytes())?
                .iter()
                .map(|(_, data)| parse(data))
                .collect::<Result<_>>()?
        };

        let items: Vec<Value> = candidates
            .into_iter()
            .filter(|v| {
                labels
                    .iter()
                    .all(|(k, val)| label_of(v, k) == Some(val.as_str()))
            })
            .filter(|v| owner_uid.is_none_or(|uid| owner_uids(v).iter().any(|u| u == uid)))
            .collect();

        debug!("Found {} objects", items.len());
        Ok(items)
    }

    /// Storage keys of every object (any kind) with an owner reference to `owner_uid`
    pub fn dependents(&self, owner_uid: &str) -> Result<Vec<String>> {
        let prefix = IndexKey::encode_prefix_for_owner(owner_uid);
        self.kv
            .scan(Keyspace::Indices, prefix.as_bytes())?
            .into_iter()
            .map(|(_, key)| {
                String::from_utf8(key.to_vec()).map_err(|e| {
                    CirrusError::internal_error(format!("corrupt owner index entry: {}", e))
                })
            })
            .collect()
    }

    /// Create a new object. Assigns uid, creation timestamp and resource version.
    pub fn create<T: Resource>(&self, resource: T) -> Result<T> {
        let key = resource_key(&resource)?;
        info!("Creating object: {}", key);

        let mut value = encode(&resource)?;
        let written = self.write(&key, |current| {
            if current.is_some() {
                return Err(CirrusError::resource_already_exists(key.to_string()));
            }
            let meta = metadata_mut(&mut value)?;
            meta.insert("uid".into(), Value::String(Uuid::new_v4().to_string()));
            meta.insert("creationTimestamp".into(), serde_json::to_value(now())?);
            meta.remove("deletionTimestamp");
            Ok(Some(value))
        })?;

        decode(written.into_value())
    }

    /// Replace an object. When the incoming object carries a resource version
    /// it must match the stored one.
    pub fn update<T: Resource>(&self, resource: T) -> Result<T> {
        let key = resource_key(&resource)?;
        debug!("Updating object: {}", key);

        let value = encode(&resource)?;
        let written = self.write(&key, |current| {
            let current =
                current.ok_or_else(|| CirrusError::resource_not_found(key.to_string()))?;
            check_version(&key, &current, &value)?;
            Ok(Some(carry_server_fields(&current, value)))
        })?;

        decode(written.into_value())
    }

    /// Apply a JSON merge patch to a stored object
    pub fn patch<T: Resource>(&self, namespace: &str, name: &str, merge: &Value) -> Result<T> {
        let key = T::key_for(namespace, name);
        debug!("Merge-patching object: {}", key);

        let written = self.write(&key, |current| {
            let current =
                current.ok_or_else(|| CirrusError::resource_not_found(key.to_string()))?;
            check_version(&key, &current, merge)?;
            let mut next = current.clone();
            json_patch::merge(&mut next, merge);
            Ok(Some(carry_server_fields(&current, next)))
        })?;

        decode(written.into_value())
    }

    /// Apply the changes between `before` and `after` to the stored object.
    ///
    /// Only fields that differ between the two snapshots are touched, so
    /// concurrent writes to other fields survive. A patch that no longer
    /// applies to the stored object is reported as a conflict.
    pub fn patch_diff<T: Resource>(&self, before: &T, after: &T) -> Result<T> {
        let key = resource_key(after)?;
        let diff = json_patch::diff(&encode(before)?, &encode(after)?);
        if diff.0.is_empty() {
            debug!("No changes to patch for {}", key);
        }

        let written = self.write(&key, |current| {
            let current =
                current.ok_or_else(|| CirrusError::resource_not_found(key.to_string()))?;
            if diff.0.is_empty() {
                return Ok(Some(current));
            }
            let mut next = current.clone();
            json_patch::patch(&mut next, &diff.0).map_err(|e| {
                CirrusError::conflict(key.to_string(), "patch base", format!("{}", e))
            })?;
            Ok(Some(carry_server_fields(&current, next)))
        })?;

        decode(written.into_value())
    }

    /// Request deletion. Objects with finalizers only get a deletion timestamp.
    pub fn delete<T: Resource>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = T::key_for(namespace, name);
        self.delete_key(&key)
    }

    /// Request deletion of an object of any kind
    pub fn delete_key(&self, key: &ResourceKey) -> Result<()> {
        info!("Deleting object: {}", key);

        self.write(key, |current| {
            let mut current =
                current.ok_or_else(|| CirrusError::resource_not_found(key.to_string()))?;
            if finalizers_of(&current).is_empty() {
                return Ok(None);
            }
            let meta = metadata_mut(&mut current)?;
            if meta.get("deletionTimestamp").is_none_or(Value::is_null) {
                meta.insert("deletionTimestamp".into(), serde_json::to_value(now())?);
            }
            Ok(Some(current))
        })?;

        Ok(())
    }

    /// Create or replace an object from raw JSON (object import)
    pub fn apply_value(&self, key: &ResourceKey, mut value: Value) -> Result<Value> {
        let obj = value.as_object_mut().ok_or_else(|| {
            CirrusError::invalid_resource("object must be a map", "Provide a YAML mapping")
        })?;
        obj.insert("apiVersion".into(), Value::String(key.gvk.api_version()));
        obj.insert("kind".into(), Value::String(key.gvk.kind.clone()));

        let written = self.write(key, |current| match current {
            Some(current) => Ok(Some(carry_server_fields(&current, value))),
            None => {
                let meta = metadata_mut(&mut value)?;
                meta.insert("uid".into(), Value::String(Uuid::new_v4().to_string()));
                meta.insert("creationTimestamp".into(), serde_json::to_value(now())?);
                Ok(Some(value))
            }
        })?;
        Ok(written.into_value())
    }

    fn read_value(&self, key: &ResourceKey) -> Result<Option<Value>> {
        let storage_key = KeyEncoder::encode_resource_key(key);
        match self.kv.get(Keyspace::Objects, storage_key.as_bytes())? {
            Some(data) => Ok(Some(parse(&data)?)),
            None => Ok(None),
        }
    }

    fn indexed(&self, index_prefix: &str, object_prefix: &str) -> Result<Vec<Value>> {
        let mut seen = BTreeSet::new();
        let mut values = Vec::new();
        for (_, storage_key) in self.kv.scan(Keyspace::Indices, index_prefix.as_bytes())? {
            if !storage_key.starts_with(object_prefix.as_bytes())
                || !seen.insert(storage_key.clone())
            {
                continue;
            }
            if let Some(data) = self.kv.get(Keyspace::Objects, &storage_key)? {
                values.push(parse(&data)?);
            }
        }
        Ok(values)
    }

    /// Run one read-modify-write cycle in a backend transaction.
    ///
    /// `f` receives the stored JSON (if any) and returns the next state:
    /// `None` removes the object. A next state carrying a deletion timestamp
    /// but no finalizers is removed as well.
    fn write<F>(&self, key: &ResourceKey, f: F) -> Result<Written>
    where
        F: FnOnce(Option<Value>) -> Result<Option<Value>>,
    {
        let storage_key = KeyEncoder::encode_resource_key(key);
        let mut txn = self.kv.transaction()?;

        let current = match txn.get(Keyspace::Objects, storage_key.as_bytes())? {
            Some(data) => Some(parse(&data)?),
            None => None,
        };

        let next = f(current.clone())?;
        let next = next.filter(|v| !(is_deleting(v) && finalizers_of(v).is_empty()));

        let written = match (current, next) {
            (None, None) => return Err(CirrusError::resource_not_found(key.to_string())),
            (Some(current), None) => {
                txn.delete(Keyspace::Objects, storage_key.as_bytes())?;
                update_indices(txn.as_mut(), &storage_key, Some(&current), None)?;
                Written::Removed(current)
            }
            (Some(current), Some(next)) if strip_version(&current) == strip_version(&next) => {
                Written::Unchanged(current)
            }
            (current, Some(mut next)) => {
                let revision = next_revision(txn.as_mut())?;
                if let Some(obj) = next.as_object_mut() {
                    obj.insert("apiVersion".into(), Value::String(key.gvk.api_version()));
                    obj.insert("kind".into(), Value::String(key.gvk.kind.clone()));
                }
                metadata_mut(&mut next)?.insert(
                    "resourceVersion".into(),
                    Value::String(revision.to_string()),
                );
                let data = serde_json::to_vec(&next)?;
                txn.put(Keyspace::Objects, storage_key.as_bytes(), &data)?;
                update_indices(txn.as_mut(), &storage_key, current.as_ref(), Some(&next))?;
                if current.is_some() {
                    Written::Modified(next)
                } else {
                    Written::Added(next)
                }
            }
        };

        txn.commit()?;
        self.publish(key, &written);
        Ok(written)
    }

    fn publish(&self, key: &ResourceKey, written: &Written) {
        let event = match written {
            Written::Added(v) => {
                ResourceEvent::added(key.clone(), v.clone(), version_string(v))
            }
            Written::Modified(v) => {
                ResourceEvent::modified(key.clone(), v.clone(), version_string(v))
            }
            Written::Removed(v) => {
                info!("Removed object: {}", key);
                ResourceEvent::deleted(key.clone(), v.clone(), version_string(v))
            }
            Written::Unchanged(_) => return,
        };
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

fn next_revision(txn: &mut dyn Transaction) -> Result<u64> {
    let current = match txn.get(Keyspace::Indices, REVISION_KEY)? {
        Some(data) => std::str::from_utf8(&data)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| CirrusError::internal_error("corrupt revision counter"))?,
        None => 0,
    };
    let next = current + 1;
    txn.put(Keyspace::Indices, REVISION_KEY, next.to_string().as_bytes())?;
    Ok(next)
}

fn index_entries(storage_key: &str, value: &Value) -> BTreeSet<String> {
    let mut entries = BTreeSet::new();
    if let Some(labels) = value["metadata"]["labels"].as_object() {
        for (k, v) in labels {
            if let Some(v) = v.as_str() {
                entries.insert(
                    IndexKey::Label {
                        key: k.clone(),
                        value: v.to_string(),
                        storage_key: storage_key.to_string(),
                    }
                    .encode(),
                );
            }
        }
    }
    for uid in owner_uids(value) {
        entries.insert(
            IndexKey::Owner {
                owner_uid: uid,
                storage_key: storage_key.to_string(),
            }
            .encode(),
        );
    }
    entries
}

fn update_indices(
    txn: &mut dyn Transaction,
    storage_key: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Result<()> {
    let old = before
        .map(|v| index_entries(storage_key, v))
        .unwrap_or_default();
    let new = after
        .map(|v| index_entries(storage_key, v))
        .unwrap_or_default();

    for stale in old.difference(&new) {
        txn.delete(Keyspace::Indices, stale.as_bytes())?;
    }
    for fresh in new.difference(&old) {
        txn.put(Keyspace::Indices, fresh.as_bytes(), storage_key.as_bytes())?;
    }
    Ok(())
}

fn resource_key<T: Resource>(resource: &T) -> Result<ResourceKey> {
    resource.resource_key().map_err(|e| {
        CirrusError::invalid_resource(
            e.to_string(),
            "Set metadata.name and, for namespaced kinds, metadata.namespace",
        )
    })
}

fn encode<T: Resource>(resource: &T) -> Result<Value> {
    Ok(serde_json::to_value(resource)?)
}

fn decode<T: Resource>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn parse(data: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(data)?)
}

fn now() -> Time {
    Time(chrono::Utc::now())
}

fn metadata_mut(value: &mut Value) -> Result<&mut serde_json::Map<String, Value>> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| CirrusError::internal_error("object is not a JSON map"))?;
    obj.entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()))
        .as_object_mut()
        .ok_or_else(|| CirrusError::internal_error("metadata is not a JSON map"))
}

fn version_of(value: &Value) -> Option<&str> {
    value
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
}

fn version_string(value: &Value) -> String {
    version_of(value).unwrap_or_default().to_string()
}

fn label_of<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .pointer("/metadata/labels")
        .and_then(|l| l.get(key))
        .and_then(Value::as_str)
}

fn owner_uids(value: &Value) -> Vec<String> {
    value
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(|r| r.get("uid").and_then(Value::as_str).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn finalizers_of(value: &Value) -> Vec<&str> {
    value
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|f| f.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn is_deleting(value: &Value) -> bool {
    value
        .pointer("/metadata/deletionTimestamp")
        .is_some_and(|v| !v.is_null())
}

/// Reject a write whose resource version does not match the stored object
fn check_version(key: &ResourceKey, current: &Value, incoming: &Value) -> Result<()> {
    if let (Some(expected), Some(actual)) = (version_of(incoming), version_of(current)) {
        if expected != actual {
            return Err(CirrusError::conflict(key.to_string(), expected, actual));
        }
    }
    Ok(())
}

/// Keep identity and lifecycle fields owned by the store
fn carry_server_fields(current: &Value, mut next: Value) -> Value {
    if let (Some(meta), Some(cur)) = (
        next.get_mut("metadata").and_then(Value::as_object_mut),
        current.get("metadata").and_then(Value::as_object),
    ) {
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            match cur.get(field) {
                Some(v) if !v.is_null() => {
                    meta.insert(field.to_string(), v.clone());
                }
                _ => {
                    meta.remove(field);
                }
            }
        }
    }
    next
}

fn strip_version(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("resourceVersion");
    }
    if let Some(obj) = value.as_object_mut() {
        obj.remove("apiVersion");
        obj.remove("kind");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RedbBackend;
    use cirrus_core::well_known::CLUSTER_NAME_LABEL;
    use cirrus_core::{
        IPAddressClaim, Secret, VSphereFailureDomain, VSphereVM, WatchEventType,
    };
    use tempfile::tempdir;

    fn make_store() -> (ObjectStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let backend = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        (ObjectStore::new(backend), dir)
    }

    fn make_vm(name: &str) -> VSphereVM {
        let mut vm = VSphereVM::default();
        vm.metadata.name = Some(name.to_string());
        vm.metadata.namespace = Some("default".to_string());
        vm.spec.server = "vcenter.example.com".to_string();
        vm
    }

    #[test]
    fn test_create_assigns_identity() {
        let (store, _dir) = make_store();

        let created = store.create(make_vm("vm-1")).unwrap();
        assert!(created.uid().is_some());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        assert!(created.metadata.creation_timestamp.is_some());

        let err = store.create(make_vm("vm-1")).unwrap_err();
        assert!(matches!(err, CirrusError::ResourceAlreadyExists { .. }));

        let raw = store
            .get_value(&VSphereVM::key_for("default", "vm-1"))
            .unwrap()
            .unwrap();
        assert_eq!(raw["kind"], "VSphereVM");
        assert_eq!(raw["apiVersion"], "infrastructure.cluster.x-k8s.io/v1beta1");
    }

    #[test]
    fn test_update_checks_resource_version() {
        let (store, _dir) = make_store();
        let created = store.create(make_vm("vm-1")).unwrap();

        let mut first = created.clone();
        first.spec.datacenter = "dc0".to_string();
        let updated = store.update(first).unwrap();
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("2"));
        assert_eq!(updated.uid(), created.uid());

        let mut stale = created;
        stale.spec.datacenter = "dc1".to_string();
        let err = store.update(stale).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_patch_diff_keeps_concurrent_changes() {
        let (store, _dir) = make_store();
        let before = store.create(make_vm("vm-1")).unwrap();

        // Someone else changes the spec in between
        store
            .patch::<VSphereVM>(
                "default",
                "vm-1",
                &serde_json::json!({"spec": {"datacenter": "dc0"}}),
            )
            .unwrap();

        let mut after = before.clone();
        after.status.ready = true;
        let patched = store.patch_diff(&before, &after).unwrap();

        assert!(patched.status.ready);
        assert_eq!(patched.spec.datacenter, "dc0");
    }

    #[test]
    fn test_delete_waits_for_finalizers() {
        let (store, _dir) = make_store();
        let mut vm = make_vm("vm-1");
        vm.add_finalizer("test/finalizer");
        store.create(vm).unwrap();

        store.delete::<VSphereVM>("default", "vm-1").unwrap();
        let deleting: VSphereVM = store.get("default", "vm-1").unwrap();
        assert!(deleting.is_deleting());

        let mut released = deleting.clone();
        released.remove_finalizer("test/finalizer");
        store.patch_diff(&deleting, &released).unwrap();

        assert!(store
            .get_opt::<VSphereVM>("default", "vm-1")
            .unwrap()
            .is_none());
        let err = store.delete::<VSphereVM>("default", "vm-1").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_list_by_label_and_owner() {
        let (store, _dir) = make_store();
        let vm = store.create(make_vm("vm-1")).unwrap();
        let owner = vm.owner_reference(true).unwrap();

        for (name, cluster) in [("vm-1-0-0", "prod"), ("vm-1-0-1", "prod"), ("other-0-0", "dev")] {
            let mut claim = IPAddressClaim::default();
            claim.metadata.name = Some(name.to_string());
            claim.metadata.namespace = Some("default".to_string());
            claim.set_label(CLUSTER_NAME_LABEL, cluster);
            if name.starts_with("vm-1") {
                claim.set_owner_reference(owner.clone());
            }
            store.create(claim).unwrap();
        }

        let prod: Vec<IPAddressClaim> = store
            .list(&ListParams::in_namespace("default").with_label(CLUSTER_NAME_LABEL, "prod"))
            .unwrap();
        assert_eq!(prod.len(), 2);

        let owned: Vec<IPAddressClaim> = store
            .list(&ListParams::default().owned_by(vm.uid().unwrap()))
            .unwrap();
        assert_eq!(owned.len(), 2);
        assert_eq!(store.dependents(vm.uid().unwrap()).unwrap().len(), 2);

        let elsewhere: Vec<IPAddressClaim> = store
            .list(&ListParams::in_namespace("kube-system"))
            .unwrap();
        assert!(elsewhere.is_empty());
    }

    #[test]
    fn test_owner_index_follows_updates() {
        let (store, _dir) = make_store();
        let vm = store.create(make_vm("vm-1")).unwrap();

        let mut fd = VSphereFailureDomain::default();
        fd.metadata.name = Some("fd-a".to_string());
        fd.set_owner_reference(vm.owner_reference(false).unwrap());
        let fd = store.create(fd).unwrap();
        assert_eq!(store.dependents(vm.uid().unwrap()).unwrap().len(), 1);

        let mut orphan = fd.clone();
        orphan.remove_owner_reference(vm.uid().unwrap());
        store.patch_diff(&fd, &orphan).unwrap();
        assert!(store.dependents(vm.uid().unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_secret_roundtrip() {
        let (store, _dir) = make_store();
        let mut secret = Secret::default();
        secret.metadata.name = Some("creds".to_string());
        secret.metadata.namespace = Some("default".to_string());
        secret.string_data = Some([("username".to_string(), "admin".to_string())].into());
        store.create(secret).unwrap();

        let loaded: Secret = store.get("default", "creds").unwrap();
        assert_eq!(
            loaded
                .string_data
                .unwrap()
                .get("username")
                .map(String::as_str),
            Some("admin")
        );
    }

    #[tokio::test]
    async fn test_events_published() {
        let (store, _dir) = make_store();
        let mut rx = store.subscribe();

        let created = store.create(make_vm("vm-1")).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, WatchEventType::Added);
        assert_eq!(event.resource_key.name, "vm-1");

        // A no-op write publishes nothing
        store.patch_diff(&created, &created).unwrap();

        store.delete::<VSphereVM>("default", "vm-1").unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, WatchEventType::Deleted);
        assert_eq!(event.gvk.kind, "VSphereVM");
    }
}
