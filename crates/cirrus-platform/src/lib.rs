//! Cirrus Platform - Capabilities consumed from the virtualization platform
//!
//! Sessions and the session cache, inventory lookups, tags, the VM and
//! cluster module services, credentials and the workload cluster client.
//! `MockPlatform` implements all of them in memory.

// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod error;
pub mod mock;
pub mod remote;
pub mod session;
pub mod traits;
pub mod types;

use std::sync::Arc;

pub use error::{PlatformError, Result};
pub use mock::{MockComputeCluster, MockInventory, MockPlatform, MockVmHostRule};
pub use remote::HttpRemoteClusterClient;
pub use session::SessionCache;
pub use traits::{
    ClusterModuleService, CredentialsProvider, Finder, RemoteClusterClient, Session,
    SessionConnector, SessionProvider, TagManager, VmService,
};
pub use types::{
    BoundAddress, Credentials, DestroyOutcome, ManagedObject, ModuleTarget, ObjectKind,
    SessionKey, SessionParams, VmHostRule, VmOutcome, VSPHERE_MACHINE_TEMPLATE_KIND,
};

/// The platform services the reconcilers call
#[derive(Clone)]
pub struct Platform {
    pub sessions: Arc<dyn SessionProvider>,
    pub vms: Arc<dyn VmService>,
    pub modules: Arc<dyn ClusterModuleService>,
    pub remote: Arc<dyn RemoteClusterClient>,
}

impl Platform {
    /// Wire every service to one mock platform behind a session cache
    pub fn mock(platform: MockPlatform) -> Self {
        Self {
            sessions: Arc::new(SessionCache::new(Arc::new(platform.clone()))),
            vms: Arc::new(platform.clone()),
            modules: Arc::new(platform.clone()),
            remote: Arc::new(platform),
        }
    }

    /// Same as [`Platform::mock`] but with a real workload cluster client
    pub fn with_remote(mut self, remote: Arc<dyn RemoteClusterClient>) -> Self {
        self.remote = remote;
        self
    }
}
