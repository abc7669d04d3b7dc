use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;
use cirrus_core::{ApiEndpoint, VSphereCluster, VSphereVM};
use std::sync::Arc;

/// Inventory lookups scoped to one datacenter
#[async_trait]
pub trait Finder: Send + Sync {
    async fn datacenter(&self, name: &str) -> Result<ManagedObject>;

    async fn resource_pool(&self, datacenter: &str, path: &str) -> Result<ManagedObject>;

    async fn folder(&self, datacenter: &str, path: &str) -> Result<ManagedObject>;

    async fn compute_cluster(&self, datacenter: &str, path: &str) -> Result<ManagedObject>;

    async fn datastore(&self, datacenter: &str, path: &str) -> Result<ManagedObject>;

    async fn network(&self, datacenter: &str, path: &str) -> Result<ManagedObject>;

    /// Compute resource a resource pool belongs to
    async fn resource_pool_owner(&self, pool: &ManagedObject) -> Result<ManagedObject>;

    /// Hosts that are members of a host group on a compute cluster
    async fn hosts_in_group(
        &self,
        cluster: &ManagedObject,
        host_group: &str,
    ) -> Result<Vec<ManagedObject>>;

    /// VM/host affinity rule binding the two groups, if one exists
    async fn vm_host_rule(
        &self,
        cluster: &ManagedObject,
        vm_group: &str,
        host_group: &str,
    ) -> Result<Option<VmHostRule>>;
}

/// Tag and category management
#[async_trait]
pub trait TagManager: Send + Sync {
    /// Create a category if missing and return its id
    async fn create_category(&self, name: &str, associable_types: &[&str]) -> Result<String>;

    /// Create a tag in a category if missing and return its id
    async fn create_tag(&self, name: &str, category_id: &str) -> Result<String>;

    /// Look up a tag by name inside a category given by name
    async fn get_tag_for_category(&self, tag: &str, category: &str) -> Result<String>;

    async fn attach_tag(&self, tag_id: &str, object: &ManagedObject) -> Result<()>;

    async fn has_tag(&self, tag_id: &str, object: &ManagedObject) -> Result<bool>;
}

/// An authenticated connection to one vCenter
#[async_trait]
pub trait Session: Send + Sync {
    fn key(&self) -> &SessionKey;

    /// Whether the login is still valid
    async fn is_active(&self) -> bool;

    /// vCenter version string, e.g. "8.0.2"
    async fn version(&self) -> Result<String>;

    fn finder(&self) -> &dyn Finder;

    fn tags(&self) -> &dyn TagManager;
}

/// Opens fresh sessions; wrapped by the session cache
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, params: &SessionParams) -> Result<Arc<dyn Session>>;
}

/// Hands out sessions, reusing a live one for the same key
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_or_create(&self, params: &SessionParams) -> Result<Arc<dyn Session>>;
}

/// Low-level VM lifecycle
#[async_trait]
pub trait VmService: Send + Sync {
    /// Create or converge the VM, returning its observed state
    async fn reconcile_vm(
        &self,
        session: &dyn Session,
        vm: &VSphereVM,
        addresses: &[BoundAddress],
    ) -> Result<VmOutcome>;

    async fn destroy_vm(&self, session: &dyn Session, vm: &VSphereVM) -> Result<DestroyOutcome>;
}

/// Anti-affinity groups on the platform
#[async_trait]
pub trait ClusterModuleService: Send + Sync {
    /// Create a module for the target. An empty id means creation was skipped.
    async fn create(&self, session: &dyn Session, target: &ModuleTarget) -> Result<String>;

    async fn does_exist(
        &self,
        session: &dyn Session,
        target: &ModuleTarget,
        module_uuid: &str,
    ) -> Result<bool>;

    async fn remove(&self, session: &dyn Session, module_uuid: &str) -> Result<()>;
}

/// Resolves vCenter credentials
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Credentials a cluster is configured with through its identity
    async fn get_credentials(&self, cluster: &VSphereCluster) -> Result<Credentials>;

    /// Credentials for a server when no cluster is at hand
    async fn credentials_for_server(&self, server: &str) -> Result<Credentials>;
}

/// Calls into the workload cluster
#[async_trait]
pub trait RemoteClusterClient: Send + Sync {
    async fn is_api_server_online(&self, endpoint: &ApiEndpoint) -> bool;

    /// Delete the Node object named after a VM; a missing node is not an error
    async fn delete_node(&self, endpoint: &ApiEndpoint, node_name: &str) -> Result<()>;
}
