//! Fixtures shared by the reconciler tests

use crate::config::ControllerConfig;
use crate::context::Context;
use crate::identity::StoreCredentialsProvider;
use cirrus_core::well_known::CLUSTER_NAME_LABEL;
use cirrus_core::{
    Cluster, ObjectMeta, ObjectRef, Resource, Secret, VSphereCluster,
};
use cirrus_platform::{Credentials, MockInventory, MockPlatform, Platform};
use cirrus_storage::{ObjectStore, RedbBackend};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

pub(crate) const SERVER: &str = "vcenter.local";
pub(crate) const NAMESPACE: &str = "default";

pub(crate) struct Fixture {
    pub ctx: Arc<Context>,
    pub mock: MockPlatform,
    _dir: TempDir,
}

impl Fixture {
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_inventory(MockInventory::default(), config)
    }

    pub fn with_inventory(inventory: MockInventory, config: ControllerConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();
        let store = Arc::new(ObjectStore::new(Arc::new(backend)));
        let mock = MockPlatform::new(inventory);
        let credentials = Arc::new(StoreCredentialsProvider::new(
            store.clone(),
            config.controller_namespace.clone(),
            Some(Credentials::new("admin", "secret")),
        ));
        let ctx = Arc::new(Context::new(
            store,
            Platform::mock(mock.clone()),
            credentials,
            config,
        ));
        Self {
            ctx,
            mock,
            _dir: dir,
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.ctx.store
    }

    /// A Cluster and its VSphereCluster, owner-linked and labelled
    pub fn create_cluster(&self, name: &str) -> (Cluster, VSphereCluster) {
        let mut cluster = Cluster {
            metadata: meta(NAMESPACE, name),
            ..Default::default()
        };
        cluster.spec.infrastructure_ref = Some(ObjectRef {
            api_version: VSphereCluster::API_VERSION.to_string(),
            kind: VSphereCluster::KIND.to_string(),
            name: name.to_string(),
        });
        let cluster = self.store().create(cluster).unwrap();

        let mut vsphere = VSphereCluster {
            metadata: meta(NAMESPACE, name),
            ..Default::default()
        };
        vsphere.spec.server = SERVER.to_string();
        vsphere.set_label(CLUSTER_NAME_LABEL, name);
        vsphere.set_owner_reference(cluster.owner_reference(true).unwrap());
        let vsphere = self.store().create(vsphere).unwrap();

        (cluster, vsphere)
    }

    pub fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        username: &str,
        password: &str,
    ) -> Secret {
        let secret = Secret {
            metadata: meta(namespace, name),
            string_data: Some(BTreeMap::from([
                ("username".to_string(), username.to_string()),
                ("password".to_string(), password.to_string()),
            ])),
            ..Default::default()
        };
        self.store().create(secret).unwrap()
    }
}

pub(crate) fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
        ..Default::default()
    }
}
