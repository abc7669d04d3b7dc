//! Cirrus Core - Resource model for the Cirrus infrastructure reconcilers
//!
//! This crate provides:
//! - Typed cluster, VM, IP address and placement resources
//! - Ordered status conditions with summary aggregation
//! - Error types with miette diagnostics
//! - Type-safe resource keys and identifiers
//! - Serialization helpers

pub mod conditions;
pub mod error;
pub mod events;
pub mod resources;
pub mod selector;
pub mod types;
pub mod well_known;

// Re-export commonly used types
pub use conditions::{Condition, ConditionSeverity, ConditionStatus, Conditions};
pub use error::{CirrusError, Result};
pub use events::{ResourceEvent, WatchEventType};
pub use resources::*;
pub use types::{GroupVersionKind, ResourceKey, ResourceVersion};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::Secret;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};

/// Every kind the store knows how to hold, as (apiVersion, kind, namespaced)
pub const KNOWN_KINDS: &[(&str, &str, bool)] = &[
    (Cluster::API_VERSION, Cluster::KIND, Cluster::NAMESPACED),
    (VSphereCluster::API_VERSION, VSphereCluster::KIND, VSphereCluster::NAMESPACED),
    (VSphereVM::API_VERSION, VSphereVM::KIND, VSphereVM::NAMESPACED),
    (IPAddressClaim::API_VERSION, IPAddressClaim::KIND, IPAddressClaim::NAMESPACED),
    (IPAddress::API_VERSION, IPAddress::KIND, IPAddress::NAMESPACED),
    (
        VSphereDeploymentZone::API_VERSION,
        VSphereDeploymentZone::KIND,
        VSphereDeploymentZone::NAMESPACED,
    ),
    (
        VSphereFailureDomain::API_VERSION,
        VSphereFailureDomain::KIND,
        VSphereFailureDomain::NAMESPACED,
    ),
    (Machine::API_VERSION, Machine::KIND, Machine::NAMESPACED),
    (
        KubeadmControlPlane::API_VERSION,
        KubeadmControlPlane::KIND,
        KubeadmControlPlane::NAMESPACED,
    ),
    (
        MachineDeployment::API_VERSION,
        MachineDeployment::KIND,
        MachineDeployment::NAMESPACED,
    ),
    (
        VSphereClusterIdentity::API_VERSION,
        VSphereClusterIdentity::KIND,
        VSphereClusterIdentity::NAMESPACED,
    ),
    (Secret::API_VERSION, Secret::KIND, Secret::NAMESPACED),
];

/// Look up a known kind by name, case-insensitively
pub fn lookup_kind(kind: &str) -> Option<(GroupVersionKind, bool)> {
    KNOWN_KINDS
        .iter()
        .find(|(_, k, _)| k.eq_ignore_ascii_case(kind))
        .map(|(api_version, k, namespaced)| {
            (
                GroupVersionKind::from_api_version_kind(api_version, k),
                *namespaced,
            )
        })
}

/// Serialize a resource to JSON
pub fn to_json<T: serde::Serialize>(resource: &T) -> Result<String> {
    serde_json::to_string(resource).map_err(|e| {
        CirrusError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Serialize a resource to pretty JSON
pub fn to_json_pretty<T: serde::Serialize>(resource: &T) -> Result<String> {
    serde_json::to_string_pretty(resource).map_err(|e| {
        CirrusError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a resource from JSON
pub fn from_json<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| {
        CirrusError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Serialize a resource to YAML
pub fn to_yaml<T: serde::Serialize>(resource: &T) -> Result<String> {
    serde_yaml::to_string(resource).map_err(|e| {
        CirrusError::serialization_error(
            format!("Failed to serialize to YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Split a multi-document YAML stream into JSON values, skipping empty documents
pub fn yaml_documents(data: &str) -> Result<Vec<serde_json::Value>> {
    use serde::Deserialize;

    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let value = serde_json::Value::deserialize(document).map_err(|e| {
            CirrusError::serialization_error(
                format!("Failed to deserialize from YAML: {}", e),
                Some(Box::new(e)),
            )
        })?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}
