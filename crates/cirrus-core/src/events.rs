use crate::types::{GroupVersionKind, ResourceKey};
use serde::{Deserialize, Serialize};

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A resource event emitted by the object store on mutations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Type of watch event (ADDED, MODIFIED, DELETED)
    pub event_type: WatchEventType,
    /// GroupVersionKind of the resource
    pub gvk: GroupVersionKind,
    /// Full resource key (gvk + namespace + name)
    pub resource_key: ResourceKey,
    /// The serialized resource object
    pub object: serde_json::Value,
    /// Resource version at the time of the event
    pub resource_version: String,
}

impl ResourceEvent {
    /// Create an ADDED event
    pub fn added(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self::new(
            WatchEventType::Added,
            resource_key,
            object,
            resource_version,
        )
    }

    /// Create a MODIFIED event
    pub fn modified(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self::new(
            WatchEventType::Modified,
            resource_key,
            object,
            resource_version,
        )
    }

    /// Create a DELETED event
    pub fn deleted(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self::new(
            WatchEventType::Deleted,
            resource_key,
            object,
            resource_version,
        )
    }

    fn new(
        event_type: WatchEventType,
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self {
            event_type,
            gvk: resource_key.gvk.clone(),
            resource_key,
            object,
            resource_version,
        }
    }

    /// Labels of the carried object, if any
    pub fn label(&self, key: &str) -> Option<&str> {
        self.object
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.get(key))
            .and_then(|v| v.as_str())
    }

    /// Owner references of the carried object as (kind, name) pairs
    pub fn owners(&self) -> Vec<(String, String)> {
        self.object
            .get("metadata")
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|o| o.as_array())
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| {
                        let kind = r.get("kind")?.as_str()?;
                        let name = r.get("name")?.as_str()?;
                        Some((kind.to_string(), name.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
