use cirrus_core::{NetworkStatus, VirtualMachineState};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Username and password for one vCenter
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() || self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to open a session against one vCenter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub server: String,
    pub datacenter: String,
    pub thumbprint: String,
    pub credentials: Credentials,
}

impl SessionParams {
    pub fn new(server: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            server: server.into(),
            credentials,
            ..Default::default()
        }
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = datacenter.into();
        self
    }

    pub fn with_thumbprint(mut self, thumbprint: impl Into<String>) -> Self {
        self.thumbprint = thumbprint.into();
        self
    }

    /// Cache key. Excludes the password
    pub fn key(&self) -> SessionKey {
        SessionKey {
            server: self.server.clone(),
            datacenter: self.datacenter.clone(),
            username: self.credentials.username.clone(),
            thumbprint: self.thumbprint.clone(),
        }
    }
}

/// Identity of a cached session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub server: String,
    pub datacenter: String,
    pub username: String,
    pub thumbprint: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{}", self.server, self.datacenter, self.username)
    }
}

/// Inventory object types the reconcilers look up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Datacenter,
    ClusterComputeResource,
    /// Standalone host acting as its own compute resource
    ComputeResource,
    HostSystem,
    ResourcePool,
    Folder,
    Datastore,
    Network,
    VirtualMachine,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Datacenter => "Datacenter",
            Self::ClusterComputeResource => "ClusterComputeResource",
            Self::ComputeResource => "ComputeResource",
            Self::HostSystem => "HostSystem",
            Self::ResourcePool => "ResourcePool",
            Self::Folder => "Folder",
            Self::Datastore => "Datastore",
            Self::Network => "Network",
            Self::VirtualMachine => "VirtualMachine",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an object in the platform inventory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagedObject {
    pub kind: ObjectKind,
    pub name: String,
    /// Platform-assigned identifier, stable across renames
    pub moref: String,
}

impl ManagedObject {
    pub fn new(kind: ObjectKind, name: impl Into<String>, moref: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            moref: moref.into(),
        }
    }
}

impl fmt::Display for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.moref)
    }
}

/// A VM/host affinity rule on a compute cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHostRule {
    pub name: String,
    pub vm_group: String,
    pub host_group: String,
    pub enabled: bool,
}

/// An address bound to a network device from an IP pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundAddress {
    pub device_index: usize,
    /// Address in CIDR notation
    pub address: String,
    pub gateway: Option<String>,
}

/// Result of converging one VM on the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmOutcome {
    pub state: VirtualMachineState,
    pub bios_uuid: Option<String>,
    pub vm_ref: Option<String>,
    pub network: Vec<NetworkStatus>,
    /// Human readable progress for non-ready states
    pub message: Option<String>,
}

impl VmOutcome {
    pub fn pending(state: VirtualMachineState, message: impl Into<String>) -> Self {
        Self {
            state,
            bios_uuid: None,
            vm_ref: None,
            network: Vec::new(),
            message: Some(message.into()),
        }
    }

    /// Every address reported on any device, in device order
    pub fn addresses(&self) -> Vec<String> {
        self.network
            .iter()
            .flat_map(|n| n.ip_addrs.iter().cloned())
            .collect()
    }
}

/// Result of a destroy call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyOutcome {
    /// The platform is still working on it; ask again later
    pub requeue: bool,
    pub state: VirtualMachineState,
}

/// The object a cluster module groups machines for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleTarget {
    pub namespace: String,
    pub name: String,
    pub control_plane: bool,
    /// Kind of the infrastructure machine template the target stamps out
    pub template_kind: String,
}

impl fmt::Display for ModuleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.control_plane {
            "KubeadmControlPlane"
        } else {
            "MachineDeployment"
        };
        write!(f, "{}/{}/{}", kind, self.namespace, self.name)
    }
}

/// Template kind for which cluster modules are supported
pub const VSPHERE_MACHINE_TEMPLATE_KIND: &str = "VSphereMachineTemplate";
