use super::{impl_resource, INFRA_API_VERSION};
use crate::conditions::Conditions;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A concrete placement target bound to one failure domain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereDeploymentZone {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VSphereDeploymentZoneSpec,
    #[serde(default)]
    pub status: VSphereDeploymentZoneStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereDeploymentZoneSpec {
    pub server: String,
    /// Name of the VSphereFailureDomain this zone places into
    pub failure_domain: String,
    /// Whether control-plane machines may land here; unset means yes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<bool>,
    #[serde(default)]
    pub placement_constraint: PlacementConstraint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementConstraint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereDeploymentZoneStatus {
    /// Unset until the first validation pass finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
}

impl VSphereDeploymentZone {
    pub fn is_control_plane(&self) -> bool {
        self.spec.control_plane.unwrap_or(true)
    }
}

impl_resource!(
    VSphereDeploymentZone,
    INFRA_API_VERSION,
    "VSphereDeploymentZone",
    false
);

/// Region/zone pair mapped onto platform tags, plus its topology
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereFailureDomain {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VSphereFailureDomainSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereFailureDomainSpec {
    pub region: FailureDomain,
    pub zone: FailureDomain,
    pub topology: Topology,
}

/// One tagged scope (region or zone)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomain {
    /// Tag name
    pub name: String,
    #[serde(rename = "type")]
    pub type_: FailureDomainType,
    pub tag_category: String,
    /// Create the category and tag and attach it instead of only verifying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_configure: Option<bool>,
}

impl FailureDomain {
    pub fn auto_configure(&self) -> bool {
        self.auto_configure.unwrap_or(false)
    }
}

/// Which platform objects carry the tag of a scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureDomainType {
    #[default]
    Datacenter,
    ComputeCluster,
    HostGroup,
}

impl FailureDomainType {
    /// Platform object type the tag category is associated with
    pub fn associable_type(&self) -> &'static str {
        match self {
            Self::Datacenter => "Datacenter",
            Self::ComputeCluster => "ClusterComputeResource",
            Self::HostGroup => "HostSystem",
        }
    }
}

impl fmt::Display for FailureDomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datacenter => write!(f, "Datacenter"),
            Self::ComputeCluster => write!(f, "ComputeCluster"),
            Self::HostGroup => write!(f, "HostGroup"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub datacenter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<FailureDomainHosts>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,
}

/// VM-host affinity placement inside a compute cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomainHosts {
    pub vm_group_name: String,
    pub host_group_name: String,
}

impl FailureDomainHosts {
    pub fn is_defined(&self) -> bool {
        !self.vm_group_name.is_empty() && !self.host_group_name.is_empty()
    }
}

impl_resource!(
    VSphereFailureDomain,
    INFRA_API_VERSION,
    "VSphereFailureDomain",
    false
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_domain_from_yaml() {
        let yaml = r#"
metadata:
  name: fd-a
spec:
  region:
    name: us-east
    type: Datacenter
    tagCategory: k8s-region
    autoConfigure: true
  zone:
    name: us-east-1a
    type: ComputeCluster
    tagCategory: k8s-zone
  topology:
    datacenter: dc0
    computeCluster: cluster0
    hosts:
      vmGroupName: vms-a
      hostGroupName: hosts-a
    networks: [vm-network]
    datastore: ds0
"#;
        let fd: VSphereFailureDomain = serde_yaml::from_str(yaml).unwrap();
        assert!(fd.spec.region.auto_configure());
        assert!(!fd.spec.zone.auto_configure());
        assert_eq!(
            fd.spec.zone.type_.associable_type(),
            "ClusterComputeResource"
        );
        assert!(fd.spec.topology.hosts.as_ref().unwrap().is_defined());
    }

    #[test]
    fn test_zone_control_plane_default() {
        let mut zone = VSphereDeploymentZone::default();
        assert!(zone.is_control_plane());
        zone.spec.control_plane = Some(false);
        assert!(!zone.is_control_plane());
    }
}
