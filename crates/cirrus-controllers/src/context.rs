use crate::config::ControllerConfig;
use crate::error::Result;
use cirrus_core::well_known::CLUSTER_NAME_LABEL;
use cirrus_core::{Cluster, Resource, VSphereCluster};
use cirrus_platform::{CredentialsProvider, Platform, Session, SessionParams};
use cirrus_storage::ObjectStore;
use std::sync::Arc;

/// Dependencies handed to every reconciler
pub struct Context {
    pub store: Arc<ObjectStore>,
    pub platform: Platform,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(
        store: Arc<ObjectStore>,
        platform: Platform,
        credentials: Arc<dyn CredentialsProvider>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            platform,
            credentials,
            config,
        }
    }

    /// Cluster an object belongs to according to its cluster-name label
    pub fn cluster_for<T: Resource>(&self, object: &T) -> Result<Option<Cluster>> {
        match object.label(CLUSTER_NAME_LABEL) {
            Some(name) => Ok(self.store.get_opt::<Cluster>(object.namespace(), name)?),
            None => Ok(None),
        }
    }

    /// VSphereCluster a Cluster points at through its infrastructure reference
    pub fn infra_cluster_for(&self, cluster: &Cluster) -> Result<Option<VSphereCluster>> {
        match &cluster.spec.infrastructure_ref {
            Some(r) if r.kind == VSphereCluster::KIND => Ok(self
                .store
                .get_opt::<VSphereCluster>(cluster.namespace(), &r.name)?),
            _ => Ok(None),
        }
    }

    pub async fn session(&self, params: &SessionParams) -> Result<Arc<dyn Session>> {
        Ok(self.platform.sessions.get_or_create(params).await?)
    }
}
