use crate::error::{PlatformError, Result};
use crate::traits::*;
use crate::types::*;
use async_trait::async_trait;
use cirrus_core::{ApiEndpoint, NetworkStatus, Resource, VSphereVM, VirtualMachineState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Inventory served by the mock platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MockInventory {
    /// Reported vCenter version
    pub version: String,
    pub datacenters: Vec<String>,
    pub compute_clusters: Vec<MockComputeCluster>,
    /// Resource pools on standalone hosts, not owned by a compute cluster
    pub standalone_resource_pools: Vec<String>,
    pub folders: Vec<String>,
    pub datastores: Vec<String>,
    pub networks: Vec<String>,
    /// Servers refusing connections
    pub unreachable_servers: Vec<String>,
    /// Reconcile passes a new VM spends cloning before it is ready
    pub provisioning_passes: u32,
    /// First three octets of DHCP leases handed to VMs
    pub dhcp_prefix: String,
    pub api_server_online: bool,
}

impl Default for MockInventory {
    fn default() -> Self {
        Self {
            version: "8.0.2".to_string(),
            datacenters: vec!["dc0".to_string()],
            compute_clusters: vec![MockComputeCluster::default()],
            standalone_resource_pools: Vec::new(),
            folders: vec!["vms".to_string()],
            datastores: vec!["ds0".to_string()],
            networks: vec!["vm-network".to_string()],
            unreachable_servers: Vec::new(),
            provisioning_passes: 1,
            dhcp_prefix: "10.0.0".to_string(),
            api_server_online: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MockComputeCluster {
    pub name: String,
    pub resource_pools: Vec<String>,
    pub hosts: Vec<String>,
    pub host_groups: BTreeMap<String, Vec<String>>,
    pub vm_host_rules: Vec<MockVmHostRule>,
}

impl Default for MockComputeCluster {
    fn default() -> Self {
        Self {
            name: "cluster0".to_string(),
            resource_pools: vec!["pool0".to_string()],
            hosts: vec!["esx-0".to_string(), "esx-1".to_string()],
            host_groups: BTreeMap::new(),
            vm_host_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockVmHostRule {
    pub name: String,
    pub vm_group: String,
    pub host_group: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
struct MockCategory {
    id: String,
    associable_types: Vec<String>,
}

#[derive(Debug, Clone)]
struct MockTag {
    name: String,
    category_id: String,
}

#[derive(Debug, Clone)]
struct MockVm {
    passes: u32,
    bios_uuid: String,
    moref: String,
    network: Vec<NetworkStatus>,
}

#[derive(Debug, Default)]
struct MockState {
    inventory: MockInventory,
    generation: u64,
    connects: usize,
    categories: BTreeMap<String, MockCategory>,
    tags: BTreeMap<String, MockTag>,
    attachments: BTreeSet<(String, ManagedObject)>,
    modules: BTreeMap<String, String>,
    vms: BTreeMap<String, MockVm>,
    next_vm: u32,
    vm_calls: usize,
    withhold_addresses: bool,
    withhold_bios_uuid: bool,
    failing_module_checks: bool,
    incompatible_targets: BTreeSet<String>,
    deleted_nodes: Vec<String>,
}

impl MockState {
    fn ensure_datacenter(&self, name: &str) -> Result<ManagedObject> {
        if self.inventory.datacenters.iter().any(|dc| dc == leaf(name)) {
            Ok(ManagedObject::new(
                ObjectKind::Datacenter,
                leaf(name),
                format!("datacenter-{}", leaf(name)),
            ))
        } else {
            Err(PlatformError::not_found("Datacenter", name))
        }
    }

    fn cluster(&self, name: &str) -> Option<&MockComputeCluster> {
        self.inventory
            .compute_clusters
            .iter()
            .find(|c| c.name == leaf(name))
    }
}

/// Last element of an inventory path
fn leaf(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

fn lookup(
    names: &[String],
    kind: ObjectKind,
    prefix: &str,
    path: &str,
) -> Result<ManagedObject> {
    names
        .iter()
        .find(|n| n.as_str() == leaf(path))
        .map(|n| ManagedObject::new(kind, n.clone(), format!("{}-{}", prefix, n)))
        .ok_or_else(|| PlatformError::not_found(kind.as_str(), path))
}

/// In-memory virtualization platform for development and tests
///
/// Serves a static inventory, keeps tags, categories, cluster modules and
/// VMs in memory, and simulates cloning by reporting `Creating` for a
/// configurable number of passes. Cloning the handle shares the state.
#[derive(Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn new(inventory: MockInventory) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                inventory,
                ..Default::default()
            })),
        }
    }

    pub fn inventory(&self) -> MockInventory {
        self.state.lock().inventory.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Invalidate every open session, as a vCenter restart would
    pub fn expire_sessions(&self) {
        self.state.lock().generation += 1;
    }

    pub fn set_server_reachable(&self, server: &str, reachable: bool) {
        let mut state = self.state.lock();
        state.inventory.unreachable_servers.retain(|s| s != server);
        if !reachable {
            state.inventory.unreachable_servers.push(server.to_string());
        }
    }

    pub fn set_version(&self, version: &str) {
        self.state.lock().inventory.version = version.to_string();
    }

    pub fn set_api_server_online(&self, online: bool) {
        self.state.lock().inventory.api_server_online = online;
    }

    /// Keep ready VMs from reporting any address
    pub fn withhold_addresses(&self, withhold: bool) {
        self.state.lock().withhold_addresses = withhold;
    }

    /// Report ready VMs without a BIOS UUID
    pub fn withhold_bios_uuid(&self, withhold: bool) {
        self.state.lock().withhold_bios_uuid = withhold;
    }

    /// Make every module existence check fail
    pub fn fail_module_checks(&self, fail: bool) {
        self.state.lock().failing_module_checks = fail;
    }

    /// Place a target's machines in a pool not owned by a compute cluster
    pub fn mark_incompatible(&self, target_name: &str) {
        self.state
            .lock()
            .incompatible_targets
            .insert(target_name.to_string());
    }

    pub fn modules(&self) -> Vec<String> {
        self.state.lock().modules.keys().cloned().collect()
    }

    /// Remove a module behind the reconciler's back
    pub fn drop_module(&self, module_uuid: &str) -> bool {
        self.state.lock().modules.remove(module_uuid).is_some()
    }

    pub fn vm_service_calls(&self) -> usize {
        self.state.lock().vm_calls
    }

    pub fn vm_exists(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .vms
            .contains_key(&format!("{}/{}", namespace, name))
    }

    pub fn deleted_nodes(&self) -> Vec<String> {
        self.state.lock().deleted_nodes.clone()
    }

    /// Names of objects carrying a tag, by category and tag name
    pub fn tagged_objects(&self, category: &str, tag: &str) -> Vec<String> {
        let state = self.state.lock();
        let Some(cat) = state.categories.get(category) else {
            return Vec::new();
        };
        let tag_ids: BTreeSet<&String> = state
            .tags
            .iter()
            .filter(|(_, t)| t.name == tag && t.category_id == cat.id)
            .map(|(id, _)| id)
            .collect();
        state
            .attachments
            .iter()
            .filter(|(id, _)| tag_ids.contains(id))
            .map(|(_, obj)| obj.name.clone())
            .collect()
    }

    pub fn category_count(&self) -> usize {
        self.state.lock().categories.len()
    }
}

/// A session handed out by [`MockPlatform`]
pub struct MockSession {
    key: SessionKey,
    generation: u64,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl SessionConnector for MockPlatform {
    async fn connect(&self, params: &SessionParams) -> Result<Arc<dyn Session>> {
        let mut state = self.state.lock();
        if state
            .inventory
            .unreachable_servers
            .iter()
            .any(|s| s == &params.server)
        {
            return Err(PlatformError::connection_failed(
                &params.server,
                "connection refused",
            ));
        }
        if params.credentials.is_empty() {
            return Err(PlatformError::connection_failed(
                &params.server,
                "login rejected: empty username or password",
            ));
        }
        if !params.datacenter.is_empty() {
            state.ensure_datacenter(&params.datacenter)?;
        }
        state.connects += 1;
        debug!("Mock: session opened for {}", params.key());
        Ok(Arc::new(MockSession {
            key: params.key(),
            generation: state.generation,
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl Session for MockSession {
    fn key(&self) -> &SessionKey {
        &self.key
    }

    async fn is_active(&self) -> bool {
        self.state.lock().generation == self.generation
    }

    async fn version(&self) -> Result<String> {
        let version = self.state.lock().inventory.version.clone();
        if version.is_empty() {
            return Err(PlatformError::operation_failed(
                "RetrieveServiceContent",
                "server did not report a version",
            ));
        }
        Ok(version)
    }

    fn finder(&self) -> &dyn Finder {
        self
    }

    fn tags(&self) -> &dyn TagManager {
        self
    }
}

#[async_trait]
impl Finder for MockSession {
    async fn datacenter(&self, name: &str) -> Result<ManagedObject> {
        self.state.lock().ensure_datacenter(name)
    }

    async fn resource_pool(&self, datacenter: &str, path: &str) -> Result<ManagedObject> {
        let state = self.state.lock();
        state.ensure_datacenter(datacenter)?;
        let mut pools: Vec<String> = state
            .inventory
            .compute_clusters
            .iter()
            .flat_map(|c| c.resource_pools.iter().cloned())
            .collect();
        pools.extend(state.inventory.standalone_resource_pools.iter().cloned());
        lookup(&pools, ObjectKind::ResourcePool, "resgroup", path)
    }

    async fn folder(&self, datacenter: &str, path: &str) -> Result<ManagedObject> {
        let state = self.state.lock();
        state.ensure_datacenter(datacenter)?;
        lookup(
            &state.inventory.folders,
            ObjectKind::Folder,
            "group-v",
            path,
        )
    }

    async fn compute_cluster(&self, datacenter: &str, path: &str) -> Result<ManagedObject> {
        let state = self.state.lock();
        state.ensure_datacenter(datacenter)?;
        let names: Vec<String> = state
            .inventory
            .compute_clusters
            .iter()
            .map(|c| c.name.clone())
            .collect();
        lookup(&names, ObjectKind::ClusterComputeResource, "domain-c", path)
    }

    async fn datastore(&self, datacenter: &str, path: &str) -> Result<ManagedObject> {
        let state = self.state.lock();
        state.ensure_datacenter(datacenter)?;
        lookup(
            &state.inventory.datastores,
            ObjectKind::Datastore,
            "datastore",
            path,
        )
    }

    async fn network(&self, datacenter: &str, path: &str) -> Result<ManagedObject> {
        let state = self.state.lock();
        state.ensure_datacenter(datacenter)?;
        lookup(
            &state.inventory.networks,
            ObjectKind::Network,
            "network",
            path,
        )
    }

    async fn resource_pool_owner(&self, pool: &ManagedObject) -> Result<ManagedObject> {
        let state = self.state.lock();
        if let Some(cluster) = state
            .inventory
            .compute_clusters
            .iter()
            .find(|c| c.resource_pools.contains(&pool.name))
        {
            return Ok(ManagedObject::new(
                ObjectKind::ClusterComputeResource,
                cluster.name.clone(),
                format!("domain-c-{}", cluster.name),
            ));
        }
        if state
            .inventory
            .standalone_resource_pools
            .contains(&pool.name)
        {
            return Ok(ManagedObject::new(
                ObjectKind::ComputeResource,
                format!("{}-host", pool.name),
                format!("domain-s-{}", pool.name),
            ));
        }
        Err(PlatformError::not_found("ResourcePool", &pool.name))
    }

    async fn hosts_in_group(
        &self,
        cluster: &ManagedObject,
        host_group: &str,
    ) -> Result<Vec<ManagedObject>> {
        let state = self.state.lock();
        let cluster = state
            .cluster(&cluster.name)
            .ok_or_else(|| PlatformError::not_found("ClusterComputeResource", &cluster.name))?;
        let hosts = cluster
            .host_groups
            .get(host_group)
            .ok_or_else(|| PlatformError::not_found("HostGroup", host_group))?;
        Ok(hosts
            .iter()
            .map(|h| ManagedObject::new(ObjectKind::HostSystem, h.clone(), format!("host-{}", h)))
            .collect())
    }

    async fn vm_host_rule(
        &self,
        cluster: &ManagedObject,
        vm_group: &str,
        host_group: &str,
    ) -> Result<Option<VmHostRule>> {
        let state = self.state.lock();
        let cluster = state
            .cluster(&cluster.name)
            .ok_or_else(|| PlatformError::not_found("ClusterComputeResource", &cluster.name))?;
        Ok(cluster
            .vm_host_rules
            .iter()
            .find(|r| r.vm_group == vm_group && r.host_group == host_group)
            .map(|r| VmHostRule {
                name: r.name.clone(),
                vm_group: r.vm_group.clone(),
                host_group: r.host_group.clone(),
                enabled: r.enabled,
            }))
    }
}

#[async_trait]
impl TagManager for MockSession {
    async fn create_category(&self, name: &str, associable_types: &[&str]) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(existing) = state.categories.get(name) {
            return Ok(existing.id.clone());
        }
        let id = format!(
            "urn:vmomi:InventoryServiceCategory:{}",
            uuid::Uuid::new_v4()
        );
        state.categories.insert(
            name.to_string(),
            MockCategory {
                id: id.clone(),
                associable_types: associable_types.iter().map(|t| t.to_string()).collect(),
            },
        );
        debug!("Mock: category {} created", name);
        Ok(id)
    }

    async fn create_tag(&self, name: &str, category_id: &str) -> Result<String> {
        let mut state = self.state.lock();
        if !state.categories.values().any(|c| c.id == category_id) {
            return Err(PlatformError::not_found("TagCategory", category_id));
        }
        if let Some((id, _)) = state
            .tags
            .iter()
            .find(|(_, t)| t.name == name && t.category_id == category_id)
        {
            return Ok(id.clone());
        }
        let id = format!("urn:vmomi:InventoryServiceTag:{}", uuid::Uuid::new_v4());
        state.tags.insert(
            id.clone(),
            MockTag {
                name: name.to_string(),
                category_id: category_id.to_string(),
            },
        );
        debug!("Mock: tag {} created", name);
        Ok(id)
    }

    async fn get_tag_for_category(&self, tag: &str, category: &str) -> Result<String> {
        let state = self.state.lock();
        let cat = state
            .categories
            .get(category)
            .ok_or_else(|| PlatformError::not_found("TagCategory", category))?;
        state
            .tags
            .iter()
            .find(|(_, t)| t.name == tag && t.category_id == cat.id)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| PlatformError::not_found("Tag", tag))
    }

    async fn attach_tag(&self, tag_id: &str, object: &ManagedObject) -> Result<()> {
        let mut state = self.state.lock();
        let tag = state
            .tags
            .get(tag_id)
            .ok_or_else(|| PlatformError::not_found("Tag", tag_id))?;
        let allowed = state
            .categories
            .values()
            .find(|c| c.id == tag.category_id)
            .map(|c| {
                c.associable_types.is_empty()
                    || c.associable_types.iter().any(|t| t == object.kind.as_str())
            })
            .unwrap_or(false);
        if !allowed {
            return Err(PlatformError::operation_failed(
                "AttachTag",
                format!(
                    "category of tag {} cannot be associated with {}",
                    tag_id, object.kind
                ),
            ));
        }
        state
            .attachments
            .insert((tag_id.to_string(), object.clone()));
        Ok(())
    }

    async fn has_tag(&self, tag_id: &str, object: &ManagedObject) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .attachments
            .contains(&(tag_id.to_string(), object.clone())))
    }
}

fn vm_key(vm: &VSphereVM) -> String {
    format!("{}/{}", vm.namespace(), vm.name())
}

fn strip_prefix_len(address: &str) -> String {
    address.split('/').next().unwrap_or(address).to_string()
}

#[async_trait]
impl VmService for MockPlatform {
    async fn reconcile_vm(
        &self,
        session: &dyn Session,
        vm: &VSphereVM,
        addresses: &[BoundAddress],
    ) -> Result<VmOutcome> {
        if !session.is_active().await {
            return Err(PlatformError::connection_failed(
                &session.key().server,
                "session expired",
            ));
        }

        let mut state = self.state.lock();
        state.vm_calls += 1;
        let key = vm_key(vm);

        if !state.vms.contains_key(&key) {
            state.next_vm += 1;
            let moref = format!("vm-{}", state.next_vm);
            state.vms.insert(
                key.clone(),
                MockVm {
                    passes: 0,
                    bios_uuid: uuid::Uuid::new_v4().to_string(),
                    moref,
                    network: Vec::new(),
                },
            );
        }

        let passes_needed = state.inventory.provisioning_passes;
        let withhold = state.withhold_addresses;
        let withhold_bios_uuid = state.withhold_bios_uuid;
        let dhcp_prefix = state.inventory.dhcp_prefix.clone();
        let ordinal = state.next_vm;
        let Some(entry) = state.vms.get_mut(&key) else {
            return Err(PlatformError::not_found("VirtualMachine", key));
        };
        entry.passes += 1;

        if entry.passes <= passes_needed {
            return Ok(VmOutcome::pending(
                VirtualMachineState::Creating,
                format!("cloning {} from template {}", key, vm.spec.template),
            ));
        }

        entry.network = vm
            .spec
            .network
            .devices
            .iter()
            .enumerate()
            .map(|(idx, device)| {
                let mut ip_addrs = Vec::new();
                if !withhold {
                    ip_addrs.extend(device.ip_addrs.iter().map(|a| strip_prefix_len(a)));
                    ip_addrs.extend(
                        addresses
                            .iter()
                            .filter(|a| a.device_index == idx)
                            .map(|a| strip_prefix_len(&a.address)),
                    );
                    if device.dhcp4 {
                        ip_addrs.push(format!("{}.{}", dhcp_prefix, 10 + ordinal));
                    }
                }
                NetworkStatus {
                    connected: true,
                    ip_addrs,
                    mac_addr: device.mac_addr.clone().unwrap_or_else(|| {
                        format!("00:50:56:00:{:02x}:{:02x}", ordinal % 256, idx)
                    }),
                    network_name: device.network_name.clone(),
                }
            })
            .collect();

        Ok(VmOutcome {
            state: VirtualMachineState::Ready,
            bios_uuid: (!withhold_bios_uuid).then(|| entry.bios_uuid.clone()),
            vm_ref: Some(entry.moref.clone()),
            network: entry.network.clone(),
            message: None,
        })
    }

    async fn destroy_vm(&self, _session: &dyn Session, vm: &VSphereVM) -> Result<DestroyOutcome> {
        let mut state = self.state.lock();
        state.vm_calls += 1;
        let key = vm_key(vm);
        if state.vms.remove(&key).is_some() {
            debug!("Mock: destroy task started for {}", key);
            Ok(DestroyOutcome {
                requeue: true,
                state: VirtualMachineState::Pending,
            })
        } else {
            Ok(DestroyOutcome {
                requeue: false,
                state: VirtualMachineState::NotFound,
            })
        }
    }
}

#[async_trait]
impl ClusterModuleService for MockPlatform {
    async fn create(&self, _session: &dyn Session, target: &ModuleTarget) -> Result<String> {
        if target.template_kind != VSPHERE_MACHINE_TEMPLATE_KIND {
            debug!(
                "Mock: skipping module for {} ({})",
                target, target.template_kind
            );
            return Ok(String::new());
        }
        let mut state = self.state.lock();
        if state.incompatible_targets.contains(&target.name) {
            return Err(PlatformError::incompatible_owner(
                target.to_string(),
                "resource pool is owned by a standalone host",
            ));
        }
        let module_uuid = uuid::Uuid::new_v4().to_string();
        state
            .modules
            .insert(module_uuid.clone(), target.to_string());
        debug!("Mock: module {} created for {}", module_uuid, target);
        Ok(module_uuid)
    }

    async fn does_exist(
        &self,
        _session: &dyn Session,
        _target: &ModuleTarget,
        module_uuid: &str,
    ) -> Result<bool> {
        let state = self.state.lock();
        if state.failing_module_checks {
            return Err(PlatformError::operation_failed(
                "ListClusterModules",
                "service unavailable",
            ));
        }
        Ok(state.modules.contains_key(module_uuid))
    }

    async fn remove(&self, _session: &dyn Session, module_uuid: &str) -> Result<()> {
        if self.state.lock().modules.remove(module_uuid).is_some() {
            debug!("Mock: module {} removed", module_uuid);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClusterClient for MockPlatform {
    async fn is_api_server_online(&self, endpoint: &ApiEndpoint) -> bool {
        !endpoint.is_zero() && self.state.lock().inventory.api_server_online
    }

    async fn delete_node(&self, _endpoint: &ApiEndpoint, node_name: &str) -> Result<()> {
        self.state.lock().deleted_nodes.push(node_name.to_string());
        Ok(())
    }
}
