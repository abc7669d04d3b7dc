//! VSphereCluster reconciler.

use crate::cluster_modules::ClusterModuleReconciler;
use crate::context::Context;
use crate::error::{ReconcileError, Result};
use crate::patch::PatchHelper;
use crate::poller::PollerRegistry;
use crate::reconciler::{Action, Reconciler};
use async_trait::async_trait;
use cirrus_core::conditions::{self, reasons};
use cirrus_core::selector;
use cirrus_core::well_known::{
    CLUSTER_FINALIZER, CLUSTER_NAME_LABEL, LEGACY_IDENTITY_FINALIZER, SECRET_IDENTITY_FINALIZER,
};
use cirrus_core::{
    Cluster, ConditionSeverity, FailureDomainSpec, GroupVersionKind, IdentityKind,
    KubeadmControlPlane, MachineDeployment, Resource, ResourceEvent, ResourceKey, Secret,
    VSphereCluster, VSphereClusterIdentity, VSphereDeploymentZone, VSphereVM,
    CONTROL_PLANE_INITIALIZED,
};
use cirrus_platform::{Session, SessionParams};
use cirrus_storage::ListParams;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Oldest vCenter major version cluster modules are supported on
const MIN_MODULE_VERSION: u32 = 7;

pub struct ClusterReconciler {
    ctx: Arc<Context>,
    /// Present only when anti-affinity is enabled
    modules: Option<ClusterModuleReconciler>,
    pollers: PollerRegistry,
    /// Synthetic reconcile requests from the pollers
    trigger: mpsc::UnboundedSender<ResourceKey>,
}

/// Major component of a version string such as "8.0.2"
fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}

impl ClusterReconciler {
    pub fn new(ctx: Arc<Context>, trigger: mpsc::UnboundedSender<ResourceKey>) -> Self {
        let modules = ctx
            .config
            .enable_anti_affinity
            .then(|| ClusterModuleReconciler::new(ctx.clone()));
        Self {
            ctx,
            modules,
            pollers: PollerRegistry::new(),
            trigger,
        }
    }

    pub fn pollers(&self) -> &PollerRegistry {
        &self.pollers
    }

    /// Owner Cluster named by the first Cluster owner reference
    fn owner_cluster(&self, vsphere: &VSphereCluster) -> Result<Option<Cluster>> {
        match vsphere.owner_of_kind(Cluster::KIND) {
            Some(owner) => Ok(self
                .ctx
                .store
                .get_opt::<Cluster>(vsphere.namespace(), &owner.name)?),
            None => Ok(None),
        }
    }

    /// Recompute the failure-domain map from the selected deployment zones.
    /// Returns a requeue while some zone has not reported yet.
    fn reconcile_failure_domains(&self, vsphere: &mut VSphereCluster) -> Result<Option<Action>> {
        let Some(selector) = vsphere.spec.failure_domain_selector.clone() else {
            vsphere
                .status
                .conditions
                .remove(conditions::FAILURE_DOMAINS_AVAILABLE);
            vsphere.status.failure_domains.clear();
            return Ok(None);
        };

        let mut zones = Vec::new();
        for zone in self
            .ctx
            .store
            .list::<VSphereDeploymentZone>(&ListParams::default())?
        {
            if zone.spec.server == vsphere.spec.server
                && selector::matches(&selector, zone.metadata.labels.as_ref())?
            {
                zones.push(zone);
            }
        }

        let mut failure_domains = BTreeMap::new();
        let mut unreported = Vec::new();
        let mut not_ready = Vec::new();
        for zone in &zones {
            match zone.status.ready {
                None => unreported.push(zone.name().to_string()),
                Some(false) => not_ready.push(zone.name().to_string()),
                Some(true) => {
                    failure_domains.insert(
                        zone.name().to_string(),
                        FailureDomainSpec {
                            control_plane: zone.is_control_plane(),
                        },
                    );
                }
            }
        }
        vsphere.status.failure_domains = failure_domains;

        if !unreported.is_empty() {
            info!(
                "VSphereCluster {}/{} is waiting for deployment zones {}",
                vsphere.namespace(),
                vsphere.name(),
                unreported.join(", ")
            );
            vsphere.status.conditions.mark_false(
                conditions::FAILURE_DOMAINS_AVAILABLE,
                reasons::WAITING_FOR_FAILURE_DOMAIN_STATUS,
                ConditionSeverity::Info,
                format!("waiting for {}", unreported.join(", ")),
            );
            return Ok(Some(Action::requeue(self.ctx.config.requeue_after)));
        }

        if not_ready.is_empty() {
            vsphere
                .status
                .conditions
                .mark_true(conditions::FAILURE_DOMAINS_AVAILABLE);
        } else {
            vsphere.status.conditions.mark_false(
                conditions::FAILURE_DOMAINS_AVAILABLE,
                reasons::FAILURE_DOMAINS_SKIPPED,
                ConditionSeverity::Warning,
                format!("deployment zones not ready: {}", not_ready.join(", ")),
            );
        }
        Ok(None)
    }

    /// Claim the identity secret for this cluster, or check the referenced
    /// cluster identity may be used. A violation is recorded on
    /// `VCenterAvailable` before it is returned.
    fn reconcile_identity(&self, vsphere: &mut VSphereCluster) -> Result<()> {
        let result = self.check_identity(vsphere);
        if let Err(ReconcileError::Invariant { reason, message }) = &result {
            vsphere.status.ready = false;
            vsphere.status.conditions.mark_false(
                conditions::VCENTER_AVAILABLE,
                reason,
                ConditionSeverity::Error,
                message.clone(),
            );
        }
        result
    }

    fn check_identity(&self, vsphere: &VSphereCluster) -> Result<()> {
        let Some(identity_ref) = &vsphere.spec.identity_ref else {
            return Ok(());
        };
        let namespace = vsphere.namespace();

        match identity_ref.kind {
            IdentityKind::Secret => {
                let secret: Secret = self.ctx.store.get(namespace, &identity_ref.name)?;
                let uid = vsphere.uid().unwrap_or_default();
                if let Some(other) = secret.owner_references().iter().find(|o| o.uid != uid) {
                    return Err(ReconcileError::invariant(
                        reasons::SECRET_ALREADY_IN_USE,
                        format!(
                            "secret {}/{} is already owned by {} {}",
                            namespace,
                            secret.name(),
                            other.kind,
                            other.name
                        ),
                    ));
                }

                let mut claimed = secret.clone();
                claimed.set_owner_reference(vsphere.owner_reference(false)?);
                claimed.add_finalizer(SECRET_IDENTITY_FINALIZER);
                if claimed != secret {
                    self.ctx.store.patch_diff(&secret, &claimed)?;
                    debug!(
                        "Secret {}/{} bound to VSphereCluster {}",
                        namespace,
                        secret.name(),
                        vsphere.name()
                    );
                }
                Ok(())
            }
            IdentityKind::VSphereClusterIdentity => {
                let identity: VSphereClusterIdentity =
                    self.ctx.store.get("", &identity_ref.name)?;
                if !identity.allows_namespace(namespace) {
                    return Err(ReconcileError::invariant(
                        reasons::IDENTITY_NOT_ALLOWED,
                        format!(
                            "VSphereClusterIdentity {} may not be used from namespace {}",
                            identity.name(),
                            namespace
                        ),
                    ));
                }
                if !identity.status.ready {
                    return Err(ReconcileError::invariant(
                        reasons::IDENTITY_NOT_READY,
                        format!("VSphereClusterIdentity {} is not ready", identity.name()),
                    ));
                }
                Ok(())
            }
        }
    }

    async fn connect(&self, vsphere: &mut VSphereCluster) -> Result<Arc<dyn Session>> {
        let session = match self.ctx.credentials.get_credentials(vsphere).await {
            Ok(credentials) => {
                let params = SessionParams::new(vsphere.spec.server.clone(), credentials)
                    .with_thumbprint(vsphere.spec.thumbprint.clone());
                self.ctx.session(&params).await
            }
            Err(e) => Err(e.into()),
        };
        match session {
            Ok(session) => {
                vsphere
                    .status
                    .conditions
                    .mark_true(conditions::VCENTER_AVAILABLE);
                Ok(session)
            }
            Err(e) => {
                vsphere.status.conditions.mark_false(
                    conditions::VCENTER_AVAILABLE,
                    reasons::VCENTER_UNREACHABLE,
                    ConditionSeverity::Error,
                    e.to_string(),
                );
                Err(e)
            }
        }
    }

    /// Record the platform version. Returns whether cluster modules can be
    /// used with it.
    async fn check_version(&self, vsphere: &mut VSphereCluster, session: &dyn Session) -> bool {
        let version = match session.version().await {
            Ok(version) => version,
            Err(e) => {
                warn!(
                    "Failed to read vCenter version for {}/{}: {}",
                    vsphere.namespace(),
                    vsphere.name(),
                    e
                );
                vsphere.status.conditions.mark_false(
                    conditions::CLUSTER_MODULES_AVAILABLE,
                    reasons::MISSING_VCENTER_VERSION,
                    ConditionSeverity::Warning,
                    e.to_string(),
                );
                return false;
            }
        };
        vsphere.status.vcenter_version = Some(version.clone());

        match major_version(&version) {
            Some(major) if major >= MIN_MODULE_VERSION => true,
            _ => {
                vsphere.status.conditions.mark_false(
                    conditions::CLUSTER_MODULES_AVAILABLE,
                    reasons::VCENTER_VERSION_INCOMPATIBLE,
                    ConditionSeverity::Warning,
                    format!(
                        "vCenter {} does not support cluster modules (requires {} or later)",
                        version, MIN_MODULE_VERSION
                    ),
                );
                false
            }
        }
    }

    async fn reconcile_normal(
        &self,
        vsphere: &mut VSphereCluster,
        cluster: &Cluster,
    ) -> Result<Action> {
        if let Some(requeue) = self.reconcile_failure_domains(vsphere)? {
            return Ok(requeue);
        }

        self.reconcile_identity(vsphere)?;

        let session = self.connect(vsphere).await?;

        let modules_supported = self.check_version(vsphere, session.as_ref()).await;
        if let (Some(modules), true) = (&self.modules, modules_supported) {
            modules
                .reconcile(vsphere, cluster.name(), session.as_ref())
                .await?;
        }

        if !vsphere.status.ready {
            info!(
                "VSphereCluster {}/{} is ready",
                vsphere.namespace(),
                vsphere.name()
            );
        }
        vsphere.status.ready = true;

        if vsphere.spec.control_plane_endpoint.is_zero() {
            debug!(
                "VSphereCluster {}/{} has no control plane endpoint yet",
                vsphere.namespace(),
                vsphere.name()
            );
            return Ok(Action::await_change());
        }
        if cluster.is_deleting()
            || cluster
                .status
                .conditions
                .is_true(CONTROL_PLANE_INITIALIZED)
        {
            return Ok(Action::await_change());
        }

        self.spawn_poller(vsphere, cluster);
        Ok(Action::await_change())
    }

    /// Start the control-plane poller of a cluster unless one is running
    fn spawn_poller(&self, vsphere: &VSphereCluster, cluster: &Cluster) {
        let Some(uid) = vsphere.uid() else {
            return;
        };
        let Some(guard) = self.pollers.try_acquire(uid) else {
            debug!(
                "Poller for {}/{} already running",
                vsphere.namespace(),
                vsphere.name()
            );
            return;
        };

        let ctx = self.ctx.clone();
        let trigger = self.trigger.clone();
        let key = VSphereCluster::key_for(vsphere.namespace(), vsphere.name());
        let endpoint = vsphere.spec.control_plane_endpoint.clone();
        let namespace = cluster.namespace().to_string();
        let cluster_name = cluster.name().to_string();
        let interval = ctx.config.poll_interval;
        let deadline = Instant::now() + ctx.config.poll_timeout;

        info!(
            "Waiting for the API server of {} at {}:{}",
            key, endpoint.host, endpoint.port
        );
        tokio::spawn(async move {
            let _guard = guard;

            while !ctx.platform.remote.is_api_server_online(&endpoint).await {
                if Instant::now() >= deadline {
                    warn!("Gave up waiting for the API server of {}", key);
                    return;
                }
                tokio::time::sleep(interval).await;
            }
            info!("API server of {} is online", key);
            if trigger.send(key.clone()).is_err() {
                return;
            }

            loop {
                match ctx.store.get_opt::<Cluster>(&namespace, &cluster_name) {
                    Ok(Some(cluster))
                        if cluster.status.conditions.is_true(CONTROL_PLANE_INITIALIZED) =>
                    {
                        info!("Control plane of {} is initialized", key);
                        return;
                    }
                    Ok(Some(cluster)) if cluster.is_deleting() => return,
                    Ok(None) => return,
                    Ok(Some(_)) => {}
                    Err(e) => debug!("Failed to read cluster of {}: {}", key, e),
                }
                if Instant::now() >= deadline {
                    warn!("Gave up waiting for the control plane of {}", key);
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    async fn reconcile_delete(&self, vsphere: &mut VSphereCluster) -> Result<Action> {
        let namespace = vsphere.namespace().to_string();
        let uid = vsphere.uid().unwrap_or_default().to_string();
        let cluster_name = vsphere
            .label(CLUSTER_NAME_LABEL)
            .or_else(|| {
                vsphere
                    .owner_of_kind(Cluster::KIND)
                    .map(|o| o.name.as_str())
            })
            .unwrap_or_default()
            .to_string();

        let params = ListParams::in_namespace(namespace.clone())
            .with_label(CLUSTER_NAME_LABEL, cluster_name);
        let vms = self.ctx.store.list::<VSphereVM>(&params)?;
        let mut errors = Vec::new();
        for vm in vms.iter().filter(|vm| !vm.is_deleting()) {
            let refs = vm.owner_references();
            if refs.len() == 1 && refs[0].uid == uid {
                info!("Deleting orphaned VSphereVM {}/{}", namespace, vm.name());
                match self.ctx.store.delete::<VSphereVM>(&namespace, vm.name()) {
                    Err(e) if !e.is_not_found() => errors.push(ReconcileError::from(e)),
                    _ => {}
                }
            }
        }
        if !errors.is_empty() {
            return Err(ReconcileError::aggregate(errors));
        }

        let remaining = vms
            .iter()
            .filter(|vm| {
                self.ctx
                    .store
                    .get_opt::<VSphereVM>(&namespace, vm.name())
                    .map(|found| found.is_some())
                    .unwrap_or(true)
            })
            .count();
        if remaining > 0 {
            info!(
                "VSphereCluster {}/{} is waiting for {} VMs to be deleted",
                namespace,
                vsphere.name(),
                remaining
            );
            return Ok(Action::requeue(self.ctx.config.requeue_after));
        }

        if let Some(modules) = &self.modules {
            if !vsphere.spec.cluster_modules.is_empty() {
                let session = self.connect(vsphere).await?;
                modules.reconcile_delete(vsphere, session.as_ref()).await?;
            }
        }

        self.release_identity_secret(vsphere)?;

        vsphere.remove_finalizer(CLUSTER_FINALIZER);
        info!("VSphereCluster {}/{} deleted", namespace, vsphere.name());
        Ok(Action::await_change())
    }

    fn release_identity_secret(&self, vsphere: &VSphereCluster) -> Result<()> {
        let Some(identity_ref) = vsphere
            .spec
            .identity_ref
            .as_ref()
            .filter(|r| r.kind == IdentityKind::Secret)
        else {
            return Ok(());
        };
        let namespace = vsphere.namespace();
        let Some(secret) = self
            .ctx
            .store
            .get_opt::<Secret>(namespace, &identity_ref.name)?
        else {
            return Ok(());
        };

        let mut released = secret.clone();
        released.remove_finalizer(SECRET_IDENTITY_FINALIZER);
        released.remove_finalizer(LEGACY_IDENTITY_FINALIZER);
        let was_owner = vsphere
            .uid()
            .is_some_and(|uid| released.remove_owner_reference(uid));
        if released != secret {
            self.ctx.store.patch_diff(&secret, &released)?;
        }

        if was_owner && released.owner_references().is_empty() {
            info!("Deleting identity secret {}/{}", namespace, secret.name());
            match self.ctx.store.delete::<Secret>(namespace, secret.name()) {
                Err(e) if !e.is_not_found() => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    /// VSphereCluster behind a Cluster's infrastructure reference
    fn infra_key(&self, namespace: &str, cluster_name: &str) -> Option<ResourceKey> {
        let cluster = self
            .ctx
            .store
            .get_opt::<Cluster>(namespace, cluster_name)
            .ok()
            .flatten()?;
        infra_ref_key(namespace, cluster.spec.infrastructure_ref.as_ref())
    }

    fn clusters_for_server(&self, server: &str) -> Vec<ResourceKey> {
        match self
            .ctx
            .store
            .list::<VSphereCluster>(&ListParams::default())
        {
            Ok(clusters) => clusters
                .iter()
                .filter(|c| c.spec.server == server && c.spec.failure_domain_selector.is_some())
                .map(|c| VSphereCluster::key_for(c.namespace(), c.name()))
                .collect(),
            Err(e) => {
                debug!("Failed to list VSphereClusters: {}", e);
                Vec::new()
            }
        }
    }
}

fn infra_ref_key(namespace: &str, infra: Option<&cirrus_core::ObjectRef>) -> Option<ResourceKey> {
    infra
        .filter(|r| r.kind == VSphereCluster::KIND)
        .map(|r| VSphereCluster::key_for(namespace, &r.name))
}

#[async_trait]
impl Reconciler for ClusterReconciler {
    fn name(&self) -> &'static str {
        "vspherecluster"
    }

    fn kind(&self) -> GroupVersionKind {
        VSphereCluster::gvk()
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<Action> {
        let Some(vsphere) = self
            .ctx
            .store
            .get_opt::<VSphereCluster>(&key.namespace, &key.name)?
        else {
            debug!("{} no longer exists", key);
            return Ok(Action::await_change());
        };

        let cluster = self.owner_cluster(&vsphere)?;
        if let Some(cluster) = &cluster {
            if cluster.spec.paused {
                info!("Cluster {} is paused, skipping {}", cluster.name(), key);
                return Ok(Action::await_change());
            }
        }

        if vsphere.is_deleting() {
            let mut vsphere = PatchHelper::new(self.ctx.store.clone(), vsphere);
            let outcome = self.reconcile_delete(&mut vsphere).await;
            vsphere.status.conditions.set_summary(&[
                conditions::VCENTER_AVAILABLE,
                conditions::FAILURE_DOMAINS_AVAILABLE,
                conditions::CLUSTER_MODULES_AVAILABLE,
            ]);
            return vsphere.finish(outcome);
        }

        let Some(cluster) = cluster else {
            info!("{} has no owner Cluster yet", key);
            return Ok(Action::await_change());
        };

        if !vsphere.has_finalizer(CLUSTER_FINALIZER) {
            let mut updated = vsphere.clone();
            updated.add_finalizer(CLUSTER_FINALIZER);
            self.ctx.store.patch_diff(&vsphere, &updated)?;
            return Ok(Action::await_change());
        }

        let mut vsphere = PatchHelper::new(self.ctx.store.clone(), vsphere);
        let outcome = self.reconcile_normal(&mut vsphere, &cluster).await;
        vsphere.status.conditions.set_summary(&[
            conditions::VCENTER_AVAILABLE,
            conditions::FAILURE_DOMAINS_AVAILABLE,
            conditions::CLUSTER_MODULES_AVAILABLE,
        ]);
        vsphere.finish(outcome)
    }

    fn map_event(&self, event: &ResourceEvent) -> Vec<ResourceKey> {
        let namespace = event.resource_key.namespace.as_str();
        if event.gvk == self.kind() {
            vec![event.resource_key.clone()]
        } else if event.gvk == Cluster::gvk() {
            let infra = event
                .object
                .pointer("/spec/infrastructureRef")
                .and_then(|v| serde_json::from_value::<cirrus_core::ObjectRef>(v.clone()).ok());
            infra_ref_key(namespace, infra.as_ref())
                .into_iter()
                .collect()
        } else if event.gvk == KubeadmControlPlane::gvk()
            || event.gvk == MachineDeployment::gvk()
            || event.gvk == VSphereVM::gvk()
        {
            event
                .label(CLUSTER_NAME_LABEL)
                .and_then(|name| self.infra_key(namespace, name))
                .into_iter()
                .collect()
        } else if event.gvk == VSphereDeploymentZone::gvk() {
            event
                .object
                .pointer("/spec/server")
                .and_then(|v| v.as_str())
                .map(|server| self.clusters_for_server(server))
                .unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}
