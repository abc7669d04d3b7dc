//! Credential resolution and the cluster-scoped identity reconciler.

use crate::context::Context;
use crate::error::{ReconcileError, Result};
use crate::patch::PatchHelper;
use crate::reconciler::{Action, Reconciler};
use async_trait::async_trait;
use cirrus_core::conditions::{self, reasons};
use cirrus_core::well_known::IDENTITY_FINALIZER;
use cirrus_core::{
    ConditionSeverity, GroupVersionKind, IdentityKind, Resource, ResourceEvent, ResourceKey,
    Secret, VSphereCluster, VSphereClusterIdentity,
};
use cirrus_platform::{Credentials, CredentialsProvider, PlatformError};
use cirrus_storage::{ListParams, ObjectStore};
use std::sync::Arc;
use tracing::{debug, info};

/// Resolves credentials from secrets and identities held in the object store
pub struct StoreCredentialsProvider {
    store: Arc<ObjectStore>,
    controller_namespace: String,
    default: Option<Credentials>,
}

impl StoreCredentialsProvider {
    pub fn new(
        store: Arc<ObjectStore>,
        controller_namespace: impl Into<String>,
        default: Option<Credentials>,
    ) -> Self {
        Self {
            store,
            controller_namespace: controller_namespace.into(),
            default,
        }
    }

    fn secret_credentials(
        &self,
        namespace: &str,
        name: &str,
    ) -> cirrus_platform::Result<Credentials> {
        let secret = self
            .store
            .get_opt::<Secret>(namespace, name)?
            .ok_or_else(|| {
                PlatformError::invalid_credentials(format!(
                    "secret {}/{} does not exist",
                    namespace, name
                ))
            })?;
        credentials_from_secret(&secret)
    }
}

#[async_trait]
impl CredentialsProvider for StoreCredentialsProvider {
    async fn get_credentials(
        &self,
        cluster: &VSphereCluster,
    ) -> cirrus_platform::Result<Credentials> {
        let Some(identity_ref) = &cluster.spec.identity_ref else {
            return self.default.clone().ok_or_else(|| {
                PlatformError::invalid_credentials(format!(
                    "VSphereCluster {}/{} has no identityRef and no default credentials are configured",
                    cluster.namespace(),
                    cluster.name()
                ))
            });
        };

        match identity_ref.kind {
            IdentityKind::Secret => {
                self.secret_credentials(cluster.namespace(), &identity_ref.name)
            }
            IdentityKind::VSphereClusterIdentity => {
                let identity = self
                    .store
                    .get_opt::<VSphereClusterIdentity>("", &identity_ref.name)?
                    .ok_or_else(|| {
                        PlatformError::invalid_credentials(format!(
                            "VSphereClusterIdentity {} does not exist",
                            identity_ref.name
                        ))
                    })?;
                if !identity.status.ready {
                    return Err(PlatformError::invalid_credentials(format!(
                        "VSphereClusterIdentity {} is not ready",
                        identity_ref.name
                    )));
                }
                if !identity.allows_namespace(cluster.namespace()) {
                    return Err(PlatformError::invalid_credentials(format!(
                        "VSphereClusterIdentity {} may not be used from namespace {}",
                        identity_ref.name,
                        cluster.namespace()
                    )));
                }
                self.secret_credentials(&self.controller_namespace, &identity.spec.secret_name)
            }
        }
    }

    async fn credentials_for_server(&self, server: &str) -> cirrus_platform::Result<Credentials> {
        let clusters = self.store.list::<VSphereCluster>(&ListParams::default())?;
        for cluster in clusters
            .iter()
            .filter(|c| c.spec.server == server && !c.is_deleting())
        {
            match self.get_credentials(cluster).await {
                Ok(credentials) => return Ok(credentials),
                Err(e) => debug!(
                    "Skipping credentials of {}/{}: {}",
                    cluster.namespace(),
                    cluster.name(),
                    e
                ),
            }
        }

        self.default.clone().ok_or_else(|| {
            PlatformError::invalid_credentials(format!(
                "no cluster for server {} has usable credentials and no default is configured",
                server
            ))
        })
    }
}

/// Read `username` and `password` from either `stringData` or `data`
pub fn credentials_from_secret(secret: &Secret) -> cirrus_platform::Result<Credentials> {
    let read = |key: &str| -> String {
        secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(key).cloned())
            .or_else(|| {
                secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get(key))
                    .and_then(|b| String::from_utf8(b.0.clone()).ok())
            })
            .unwrap_or_default()
    };

    let credentials = Credentials::new(read("username"), read("password"));
    if credentials.is_empty() {
        return Err(PlatformError::invalid_credentials(format!(
            "secret {}/{} is missing username or password",
            secret.namespace(),
            secret.name()
        )));
    }
    Ok(credentials)
}

/// Binds a cluster-scoped identity to its secret in the controller namespace
pub struct IdentityReconciler {
    ctx: Arc<Context>,
}

impl IdentityReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn reconcile_normal(&self, identity: &mut VSphereClusterIdentity) -> Result<Action> {
        let namespace = &self.ctx.config.controller_namespace;
        let Some(secret) = self
            .ctx
            .store
            .get_opt::<Secret>(namespace, &identity.spec.secret_name)?
        else {
            identity.status.ready = false;
            identity.status.conditions.mark_false(
                conditions::CREDENTIALS_AVAILABLE,
                reasons::SECRET_NOT_AVAILABLE,
                ConditionSeverity::Warning,
                format!(
                    "secret {}/{} not found",
                    namespace, identity.spec.secret_name
                ),
            );
            return Ok(Action::await_change());
        };

        let uid = identity.uid().unwrap_or_default().to_string();
        if let Some(other) = secret
            .owner_of_kind(VSphereClusterIdentity::KIND)
            .filter(|o| o.uid != uid)
        {
            let message = format!(
                "secret {}/{} already belongs to identity {}",
                namespace,
                secret.name(),
                other.name
            );
            identity.status.ready = false;
            identity.status.conditions.mark_false(
                conditions::CREDENTIALS_AVAILABLE,
                reasons::SECRET_ALREADY_IN_USE,
                ConditionSeverity::Error,
                message.clone(),
            );
            return Err(ReconcileError::invariant(reasons::SECRET_ALREADY_IN_USE, message));
        }

        if let Err(e) = credentials_from_secret(&secret) {
            identity.status.ready = false;
            identity.status.conditions.mark_false(
                conditions::CREDENTIALS_AVAILABLE,
                reasons::SECRET_NOT_AVAILABLE,
                ConditionSeverity::Error,
                e.to_string(),
            );
            return Err(ReconcileError::invariant(
                reasons::SECRET_NOT_AVAILABLE,
                e.to_string(),
            ));
        }

        let mut owned = secret.clone();
        owned.set_owner_reference(identity.owner_reference(true)?);
        owned.add_finalizer(IDENTITY_FINALIZER);
        self.ctx.store.patch_diff(&secret, &owned)?;

        identity
            .status
            .conditions
            .mark_true(conditions::CREDENTIALS_AVAILABLE);
        identity.status.ready = true;
        Ok(Action::await_change())
    }

    fn reconcile_delete(&self, identity: &mut VSphereClusterIdentity) -> Result<Action> {
        let namespace = &self.ctx.config.controller_namespace;
        let uid = identity.uid().unwrap_or_default().to_string();

        if let Some(secret) = self
            .ctx
            .store
            .get_opt::<Secret>(namespace, &identity.spec.secret_name)?
            .filter(|s| s.is_owned_by(&uid))
        {
            let mut released = secret.clone();
            released.remove_owner_reference(&uid);
            released.remove_finalizer(IDENTITY_FINALIZER);
            let released = self.ctx.store.patch_diff(&secret, &released)?;
            if released.owner_references().is_empty() {
                info!("Deleting identity secret {}/{}", namespace, released.name());
                self.ctx.store.delete::<Secret>(namespace, released.name())?;
            }
        }

        identity.remove_finalizer(IDENTITY_FINALIZER);
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for IdentityReconciler {
    fn name(&self) -> &'static str {
        "vsphereclusteridentity"
    }

    fn kind(&self) -> GroupVersionKind {
        VSphereClusterIdentity::gvk()
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<Action> {
        let Some(identity) = self
            .ctx
            .store
            .get_opt::<VSphereClusterIdentity>("", &key.name)?
        else {
            debug!("{} no longer exists", key);
            return Ok(Action::await_change());
        };

        if !identity.is_deleting() && !identity.has_finalizer(IDENTITY_FINALIZER) {
            let mut updated = identity.clone();
            updated.add_finalizer(IDENTITY_FINALIZER);
            self.ctx.store.patch_diff(&identity, &updated)?;
            return Ok(Action::await_change());
        }

        let mut identity = PatchHelper::new(self.ctx.store.clone(), identity);
        let outcome = if identity.is_deleting() {
            self.reconcile_delete(&mut identity)
        } else {
            self.reconcile_normal(&mut identity)
        };
        identity
            .status
            .conditions
            .set_summary(&[conditions::CREDENTIALS_AVAILABLE]);
        identity.finish(outcome)
    }

    fn map_event(&self, event: &ResourceEvent) -> Vec<ResourceKey> {
        if event.gvk == self.kind() {
            return vec![event.resource_key.clone()];
        }
        if event.gvk != Secret::gvk()
            || event.resource_key.namespace != self.ctx.config.controller_namespace
        {
            return Vec::new();
        }
        match self
            .ctx
            .store
            .list::<VSphereClusterIdentity>(&ListParams::default())
        {
            Ok(identities) => identities
                .iter()
                .filter(|i| i.spec.secret_name == event.resource_key.name)
                .map(|i| VSphereClusterIdentity::key_for("", i.name()))
                .collect(),
            Err(e) => {
                debug!(
                    "Failed to list identities for {}: {}",
                    event.resource_key, e
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{meta, Fixture, NAMESPACE};
    use crate::ControllerConfig;
    use cirrus_core::k8s_openapi::ByteString;
    use cirrus_core::{IdentityRef, VSphereClusterIdentitySpec};
    use std::collections::BTreeMap;

    fn identity(fixture: &Fixture, name: &str, secret: &str) -> VSphereClusterIdentity {
        let identity = VSphereClusterIdentity {
            metadata: meta("", name),
            spec: VSphereClusterIdentitySpec {
                secret_name: secret.to_string(),
                allowed_namespaces: vec![NAMESPACE.to_string()],
            },
            ..Default::default()
        };
        fixture.store().create(identity).unwrap()
    }

    async fn reconcile_identity(fixture: &Fixture, name: &str) -> Result<Action> {
        let reconciler = IdentityReconciler::new(fixture.ctx.clone());
        reconciler
            .reconcile(&VSphereClusterIdentity::key_for("", name))
            .await
    }

    #[test]
    fn test_credentials_from_data_bytes() {
        let secret = Secret {
            metadata: meta(NAMESPACE, "creds"),
            data: Some(BTreeMap::from([
                ("username".to_string(), ByteString(b"admin".to_vec())),
                ("password".to_string(), ByteString(b"pw".to_vec())),
            ])),
            ..Default::default()
        };
        assert_eq!(
            credentials_from_secret(&secret).unwrap(),
            Credentials::new("admin", "pw")
        );

        let empty = Secret {
            metadata: meta(NAMESPACE, "empty"),
            ..Default::default()
        };
        assert!(credentials_from_secret(&empty).is_err());
    }

    #[tokio::test]
    async fn test_cluster_secret_identity() {
        let fixture = Fixture::new(ControllerConfig::default());
        let (_, mut cluster) = fixture.create_cluster("c1");
        fixture.create_secret(NAMESPACE, "c1-creds", "cluster-user", "pw");
        cluster.spec.identity_ref = Some(IdentityRef {
            kind: IdentityKind::Secret,
            name: "c1-creds".to_string(),
        });

        let creds = fixture
            .ctx
            .credentials
            .get_credentials(&cluster)
            .await
            .unwrap();
        assert_eq!(creds.username, "cluster-user");
    }

    #[tokio::test]
    async fn test_no_identity_uses_default() {
        let fixture = Fixture::new(ControllerConfig::default());
        let (_, cluster) = fixture.create_cluster("c1");

        let creds = fixture
            .ctx
            .credentials
            .get_credentials(&cluster)
            .await
            .unwrap();
        assert_eq!(creds.username, "admin");
    }

    #[tokio::test]
    async fn test_cluster_identity_requires_ready_and_namespace() {
        let fixture = Fixture::new(ControllerConfig::default());
        let (_, mut cluster) = fixture.create_cluster("c1");
        fixture.create_secret("capv-system", "shared", "shared-user", "pw");
        identity(&fixture, "shared", "shared");
        cluster.spec.identity_ref = Some(IdentityRef {
            kind: IdentityKind::VSphereClusterIdentity,
            name: "shared".to_string(),
        });

        // Not ready yet
        assert!(fixture
            .ctx
            .credentials
            .get_credentials(&cluster)
            .await
            .is_err());

        reconcile_identity(&fixture, "shared").await.unwrap();
        reconcile_identity(&fixture, "shared").await.unwrap();
        let creds = fixture
            .ctx
            .credentials
            .get_credentials(&cluster)
            .await
            .unwrap();
        assert_eq!(creds.username, "shared-user");

        cluster.metadata.namespace = Some("other".to_string());
        assert!(fixture
            .ctx
            .credentials
            .get_credentials(&cluster)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_credentials_for_server_prefers_cluster() {
        let fixture = Fixture::new(ControllerConfig::default());
        let (_, cluster) = fixture.create_cluster("c1");
        fixture.create_secret(NAMESPACE, "c1-creds", "cluster-user", "pw");
        let mut updated = cluster.clone();
        updated.spec.identity_ref = Some(IdentityRef {
            kind: IdentityKind::Secret,
            name: "c1-creds".to_string(),
        });
        fixture.store().patch_diff(&cluster, &updated).unwrap();

        let creds = fixture
            .ctx
            .credentials
            .credentials_for_server("vcenter.local")
            .await
            .unwrap();
        assert_eq!(creds.username, "cluster-user");

        let creds = fixture
            .ctx
            .credentials
            .credentials_for_server("other.local")
            .await
            .unwrap();
        assert_eq!(creds.username, "admin");
    }

    #[tokio::test]
    async fn test_identity_owns_secret() {
        let fixture = Fixture::new(ControllerConfig::default());
        fixture.create_secret("capv-system", "shared", "user", "pw");
        let created = identity(&fixture, "shared", "shared");

        // First pass only adds the finalizer
        reconcile_identity(&fixture, "shared").await.unwrap();
        reconcile_identity(&fixture, "shared").await.unwrap();

        let stored: VSphereClusterIdentity = fixture.store().get("", "shared").unwrap();
        assert!(stored.status.ready);
        assert!(stored.status.conditions.is_true(conditions::READY));

        let secret: Secret = fixture.store().get("capv-system", "shared").unwrap();
        assert!(secret.is_owned_by(created.uid().unwrap()));
        assert!(secret.has_finalizer(IDENTITY_FINALIZER));
    }

    #[tokio::test]
    async fn test_secret_owned_by_other_identity_is_terminal() {
        let fixture = Fixture::new(ControllerConfig::default());
        fixture.create_secret("capv-system", "shared", "user", "pw");
        identity(&fixture, "first", "shared");
        identity(&fixture, "second", "shared");

        reconcile_identity(&fixture, "first").await.unwrap();
        reconcile_identity(&fixture, "first").await.unwrap();
        reconcile_identity(&fixture, "second").await.unwrap();
        let err = reconcile_identity(&fixture, "second").await.unwrap_err();
        assert!(err.is_terminal());

        let stored: VSphereClusterIdentity = fixture.store().get("", "second").unwrap();
        assert!(!stored.status.ready);
    }

    #[tokio::test]
    async fn test_delete_releases_secret() {
        let fixture = Fixture::new(ControllerConfig::default());
        fixture.create_secret("capv-system", "shared", "user", "pw");
        identity(&fixture, "shared", "shared");
        reconcile_identity(&fixture, "shared").await.unwrap();
        reconcile_identity(&fixture, "shared").await.unwrap();

        fixture
            .store()
            .delete::<VSphereClusterIdentity>("", "shared")
            .unwrap();
        reconcile_identity(&fixture, "shared").await.unwrap();

        assert!(fixture
            .store()
            .get_opt::<VSphereClusterIdentity>("", "shared")
            .unwrap()
            .is_none());
        assert!(fixture
            .store()
            .get_opt::<Secret>("capv-system", "shared")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_secret_events_map_to_identities() {
        let fixture = Fixture::new(ControllerConfig::default());
        identity(&fixture, "shared", "shared");
        let reconciler = IdentityReconciler::new(fixture.ctx.clone());

        let secret = fixture.create_secret("capv-system", "shared", "user", "pw");
        let event = ResourceEvent::added(
            Secret::key_for("capv-system", "shared"),
            serde_json::to_value(&secret).unwrap(),
            "1".to_string(),
        );
        assert_eq!(
            reconciler.map_event(&event),
            vec![VSphereClusterIdentity::key_for("", "shared")]
        );

        let elsewhere = ResourceEvent::added(
            Secret::key_for(NAMESPACE, "shared"),
            serde_json::to_value(&secret).unwrap(),
            "1".to_string(),
        );
        assert!(reconciler.map_event(&elsewhere).is_empty());
    }
}
