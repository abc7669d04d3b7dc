use super::{impl_resource, IPAM_API_VERSION};
use crate::conditions::Conditions;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Reference to a named object in the same namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRef {
    pub name: String,
}

/// Reference to a named object of a given kind in the same namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

/// Request for one address from an IP pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressClaim {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: IPAddressClaimSpec,
    #[serde(default)]
    pub status: IPAddressClaimStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressClaimSpec {
    pub pool_ref: TypedLocalRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressClaimStatus {
    /// Set by the IPAM provider once an address was allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_ref: Option<LocalRef>,
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
}

impl IPAddressClaim {
    /// Name of the claim for the `pool_idx`-th pool of the `device_idx`-th device
    pub fn name_for(vm_name: &str, device_idx: usize, pool_idx: usize) -> String {
        format!("{}-{}-{}", vm_name, device_idx, pool_idx)
    }

    pub fn is_fulfilled(&self) -> bool {
        self.status
            .address_ref
            .as_ref()
            .is_some_and(|r| !r.name.is_empty())
    }
}

impl_resource!(IPAddressClaim, IPAM_API_VERSION, "IPAddressClaim");

/// An address allocated by the IPAM provider for one claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPAddress {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: IPAddressSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressSpec {
    pub address: String,
    pub prefix: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    pub claim_ref: LocalRef,
    pub pool_ref: TypedLocalRef,
}

impl IPAddress {
    /// Address in CIDR notation
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.spec.address, self.spec.prefix)
    }

    pub fn is_ipv6(&self) -> bool {
        self.spec.address.contains(':')
    }
}

impl_resource!(IPAddress, IPAM_API_VERSION, "IPAddress");
