use super::{impl_resource, ApiEndpoint, INFRA_API_VERSION};
use crate::conditions::Conditions;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Infrastructure side of a managed cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereCluster {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VSphereClusterSpec,
    #[serde(default)]
    pub status: VSphereClusterStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterSpec {
    pub server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_ref: Option<IdentityRef>,
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,
    /// Selects VSphereDeploymentZones by label. Unset disables failure domains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_modules: Vec<ClusterModule>,
}

/// Where the platform credentials of a cluster come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRef {
    pub kind: IdentityKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityKind {
    /// A Secret in the cluster's namespace
    Secret,
    /// A cluster-scoped identity pointing at a Secret in the controller namespace
    VSphereClusterIdentity,
}

/// One anti-affinity grouping, keyed by (control_plane, target_object_name)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterModule {
    pub control_plane: bool,
    pub target_object_name: String,
    #[serde(rename = "moduleUUID")]
    pub module_uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(
        default,
        rename = "vCenterVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub vcenter_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_domains: BTreeMap<String, FailureDomainSpec>,
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
}

/// Entry of the computed failure-domain map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomainSpec {
    #[serde(default)]
    pub control_plane: bool,
}

impl_resource!(VSphereCluster, INFRA_API_VERSION, "VSphereCluster");

/// Cluster-scoped credential indirection shared by several clusters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterIdentity {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VSphereClusterIdentitySpec,
    #[serde(default)]
    pub status: VSphereClusterIdentityStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterIdentitySpec {
    /// Secret in the controller namespace holding username/password
    pub secret_name: String,
    /// Namespaces whose clusters may use this identity; empty allows all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_namespaces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterIdentityStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
}

impl VSphereClusterIdentity {
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        self.spec.allowed_namespaces.is_empty()
            || self.spec.allowed_namespaces.iter().any(|n| n == namespace)
    }
}

impl_resource!(
    VSphereClusterIdentity,
    INFRA_API_VERSION,
    "VSphereClusterIdentity",
    false
);
