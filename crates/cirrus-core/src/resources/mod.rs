mod capi;
mod ipam;
mod vsphere_cluster;
mod vsphere_vm;
mod zone;

pub use capi::{
    ApiEndpoint, Cluster, ClusterSpec, ClusterStatus, KubeadmControlPlane,
    KubeadmControlPlaneSpec, Machine, MachineDeployment, MachineDeploymentSpec, MachineSpec,
    ObjectRef, CONTROL_PLANE_INITIALIZED,
};
pub use ipam::{
    IPAddress, IPAddressClaim, IPAddressClaimSpec, IPAddressClaimStatus, IPAddressSpec, LocalRef,
    TypedLocalRef,
};
pub use vsphere_cluster::{
    ClusterModule, FailureDomainSpec, IdentityKind, IdentityRef, VSphereCluster,
    VSphereClusterIdentity, VSphereClusterIdentitySpec, VSphereClusterIdentityStatus,
    VSphereClusterSpec, VSphereClusterStatus,
};
pub use vsphere_vm::{
    NetworkDeviceSpec, NetworkSpec, NetworkStatus, VSphereVM, VSphereVMSpec, VSphereVMStatus,
    VirtualMachineState,
};
pub use zone::{
    FailureDomain, FailureDomainHosts, FailureDomainType, PlacementConstraint, Topology,
    VSphereDeploymentZone, VSphereDeploymentZoneSpec, VSphereDeploymentZoneStatus,
    VSphereFailureDomain, VSphereFailureDomainSpec,
};

use crate::{GroupVersionKind, ResourceKey, ResourceVersion};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";
pub const INFRA_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";
pub const IPAM_API_VERSION: &str = "ipam.cluster.x-k8s.io/v1beta1";
pub const CONTROL_PLANE_API_VERSION: &str = "controlplane.cluster.x-k8s.io/v1beta1";

/// Base validation for all resources
pub fn validate_base(metadata: &ObjectMeta) -> Result<(), ResourceError> {
    if metadata.name.is_none() {
        return Err(ResourceError::MissingField("metadata.name".to_string()));
    }

    if let Some(name) = &metadata.name {
        if !is_valid_name(name) {
            return Err(ResourceError::InvalidName(name.clone()));
        }
    }

    Ok(())
}

/// A persisted object kind.
///
/// Type information lives in associated constants so generic store and
/// reconciler code can address a kind without holding an instance.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// apiVersion of this kind, e.g. "infrastructure.cluster.x-k8s.io/v1beta1"
    const API_VERSION: &'static str;

    /// Kind name, e.g. "VSphereVM"
    const KIND: &'static str;

    /// Cluster-scoped kinds override this with `false`
    const NAMESPACED: bool = true;

    /// Get the metadata of this resource
    fn metadata(&self) -> &ObjectMeta;

    /// Get mutable metadata
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Get the GroupVersionKind of this kind
    fn gvk() -> GroupVersionKind {
        GroupVersionKind::from_api_version_kind(Self::API_VERSION, Self::KIND)
    }

    /// Build the key of an object of this kind. The namespace is dropped for
    /// cluster-scoped kinds.
    fn key_for(namespace: &str, name: &str) -> ResourceKey {
        if Self::NAMESPACED {
            ResourceKey::new(Self::gvk(), namespace, name)
        } else {
            ResourceKey::cluster_scoped(Self::gvk(), name)
        }
    }

    /// Get the ResourceKey
    fn resource_key(&self) -> Result<ResourceKey, ResourceError> {
        let metadata = self.metadata();
        let name = metadata
            .name
            .as_ref()
            .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;
        if Self::NAMESPACED && metadata.namespace.as_deref().unwrap_or_default().is_empty() {
            return Err(ResourceError::MissingField("metadata.namespace".to_string()));
        }
        Ok(Self::key_for(
            metadata.namespace.as_deref().unwrap_or_default(),
            name,
        ))
    }

    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Get the resource version
    fn resource_version(&self) -> Option<ResourceVersion> {
        self.metadata()
            .resource_version
            .as_ref()
            .map(ResourceVersion::new)
    }

    /// Set the resource version
    fn set_resource_version(&mut self, version: ResourceVersion) {
        self.metadata_mut().resource_version = Some(version.0);
    }

    /// Get the UID
    fn uid(&self) -> Option<&str> {
        self.metadata().uid.as_deref()
    }

    /// Whether deletion was requested and only finalizers keep the object
    fn is_deleting(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata()
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    fn set_label(&mut self, key: &str, value: &str) {
        self.metadata_mut()
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
    }

    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata()
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    /// Add a finalizer; returns true when it was not present before
    fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        true
    }

    /// Remove a finalizer; returns true when it was present
    fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let Some(finalizers) = self.metadata_mut().finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        let removed = finalizers.len() != before;
        if finalizers.is_empty() {
            self.metadata_mut().finalizers = None;
        }
        removed
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.metadata()
            .owner_references
            .as_deref()
            .unwrap_or_default()
    }

    /// First owner reference of the given kind
    fn owner_of_kind(&self, kind: &str) -> Option<&OwnerReference> {
        self.owner_references().iter().find(|o| o.kind == kind)
    }

    fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_references().iter().any(|o| o.uid == uid)
    }

    /// Insert an owner reference, replacing any previous one with the same uid.
    /// Returns true when the metadata changed.
    fn set_owner_reference(&mut self, owner: OwnerReference) -> bool {
        let refs = self
            .metadata_mut()
            .owner_references
            .get_or_insert_with(Vec::new);
        if let Some(existing) = refs.iter_mut().find(|o| o.uid == owner.uid) {
            if *existing == owner {
                return false;
            }
            *existing = owner;
            return true;
        }
        refs.push(owner);
        true
    }

    /// Drop the owner reference with this uid; returns true when one was removed
    fn remove_owner_reference(&mut self, uid: &str) -> bool {
        let Some(refs) = self.metadata_mut().owner_references.as_mut() else {
            return false;
        };
        let before = refs.len();
        refs.retain(|o| o.uid != uid);
        let removed = refs.len() != before;
        if refs.is_empty() {
            self.metadata_mut().owner_references = None;
        }
        removed
    }

    /// Build an owner reference pointing at this object.
    /// Fails when the object has not been persisted yet (no uid).
    fn owner_reference(&self, controller: bool) -> Result<OwnerReference, ResourceError> {
        let uid = self
            .uid()
            .ok_or_else(|| ResourceError::MissingField("metadata.uid".to_string()))?;
        Ok(OwnerReference {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            name: self.name().to_string(),
            uid: uid.to_string(),
            controller: controller.then_some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// Validate the resource
    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(self.metadata())
    }
}

/// Resource-related errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Validate a Kubernetes resource name (DNS-1123 subdomain)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    bytes.iter().all(|b| alnum(*b) || *b == b'-' || *b == b'.')
}

/// Implement [`Resource`] for a struct with a `metadata: ObjectMeta` field
macro_rules! impl_resource {
    ($ty:ty, $api_version:expr, $kind:literal) => {
        impl_resource!($ty, $api_version, $kind, true);
    };
    ($ty:ty, $api_version:expr, $kind:literal, $namespaced:literal) => {
        impl $crate::resources::Resource for $ty {
            const API_VERSION: &'static str = $api_version;
            const KIND: &'static str = $kind;
            const NAMESPACED: bool = $namespaced;

            fn metadata(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(
                &mut self,
            ) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}
pub(crate) use impl_resource;

use k8s_openapi::api::core::v1::Secret;

impl Resource for Secret {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Secret";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(name: &str) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.to_string());
        secret.metadata.namespace = Some("default".to_string());
        secret.metadata.uid = Some(format!("uid-{}", name));
        secret
    }

    #[test]
    fn test_is_valid_name() {
        assert!(is_valid_name("vm-1"));
        assert!(is_valid_name("prod-cluster-md-0"));
        assert!(is_valid_name("zone.a"));

        assert!(!is_valid_name(""));
        assert!(!is_valid_name("VM")); // uppercase
        assert!(!is_valid_name("-vm")); // starts with dash
        assert!(!is_valid_name("vm-")); // ends with dash
        assert!(!is_valid_name("vm_1")); // underscore
    }

    #[test]
    fn test_resource_key_scoping() {
        let key = secret("creds").resource_key().unwrap();
        assert_eq!(key.storage_key(), "core/Secret/default/creds");

        let mut fd = VSphereFailureDomain::default();
        fd.metadata.name = Some("fd-a".to_string());
        fd.metadata.namespace = Some("ignored".to_string());
        let key = fd.resource_key().unwrap();
        assert!(!key.is_namespaced());

        let mut vm = VSphereVM::default();
        vm.metadata.name = Some("vm-1".to_string());
        assert!(matches!(
            vm.resource_key(),
            Err(ResourceError::MissingField(_))
        ));
    }

    #[test]
    fn test_finalizer_helpers() {
        let mut s = secret("creds");
        assert!(s.add_finalizer("a"));
        assert!(!s.add_finalizer("a"));
        assert!(s.has_finalizer("a"));
        assert!(s.remove_finalizer("a"));
        assert!(!s.remove_finalizer("a"));
        assert!(s.metadata.finalizers.is_none());
    }

    #[test]
    fn test_owner_reference_helpers() {
        let owner = secret("owner");
        let mut child = secret("child");

        let reference = owner.owner_reference(true).unwrap();
        assert_eq!(reference.kind, "Secret");
        assert_eq!(reference.controller, Some(true));

        assert!(child.set_owner_reference(reference.clone()));
        assert!(!child.set_owner_reference(reference));
        assert!(child.is_owned_by("uid-owner"));
        assert!(child.owner_of_kind("Secret").is_some());

        assert!(child.remove_owner_reference("uid-owner"));
        assert!(child.owner_references().is_empty());

        let unsaved = Secret::default();
        assert!(unsaved.owner_reference(false).is_err());
    }
}
