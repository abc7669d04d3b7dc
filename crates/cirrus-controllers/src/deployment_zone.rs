//! VSphereDeploymentZone reconciler.
//!
//! A zone is validated against the platform in a fixed order: session,
//! placement constraint, region and zone tags, topology. The first failed
//! step marks its condition false and ends the pass. Lookups that come back
//! not-found are terminal until the zone or its failure domain changes; other
//! platform failures are retried with backoff.

use crate::context::Context;
use crate::error::{ReconcileError, Result};
use crate::patch::PatchHelper;
use crate::reconciler::{Action, Reconciler};
use async_trait::async_trait;
use cirrus_core::conditions::{self, reasons};
use cirrus_core::well_known::DEPLOYMENT_ZONE_FINALIZER;
use cirrus_core::{
    ConditionSeverity, FailureDomain, FailureDomainType, GroupVersionKind, Machine, Resource,
    ResourceEvent, ResourceKey, Topology, VSphereDeploymentZone, VSphereFailureDomain,
};
use cirrus_platform::{ManagedObject, PlatformError, Session, SessionParams};
use cirrus_storage::ListParams;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ZoneReconciler {
    ctx: Arc<Context>,
}

/// Record a failed validation step on the zone and turn it into the pass error
fn reject(
    zone: &mut VSphereDeploymentZone,
    condition: &str,
    reason: &str,
    error: ReconcileError,
) -> ReconcileError {
    zone.status.ready = Some(false);
    zone.status.conditions.mark_false(
        condition,
        reason,
        ConditionSeverity::Error,
        error.to_string(),
    );
    error
}

/// Missing inventory objects need a spec change; anything else is retried
fn classify(reason: &str, error: PlatformError) -> ReconcileError {
    if error.is_not_found() {
        ReconcileError::invariant(reason, error.to_string())
    } else {
        error.into()
    }
}

impl ZoneReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn connect(
        &self,
        zone: &mut VSphereDeploymentZone,
        topology: &Topology,
    ) -> Result<Arc<dyn Session>> {
        let session = match self
            .ctx
            .credentials
            .credentials_for_server(&zone.spec.server)
            .await
        {
            Ok(credentials) => {
                let params = SessionParams::new(zone.spec.server.clone(), credentials)
                    .with_datacenter(topology.datacenter.clone());
                self.ctx.session(&params).await
            }
            Err(e) => Err(e.into()),
        };
        match session {
            Ok(session) => {
                zone.status
                    .conditions
                    .mark_true(conditions::VCENTER_AVAILABLE);
                Ok(session)
            }
            Err(e) => Err(reject(
                zone,
                conditions::VCENTER_AVAILABLE,
                reasons::VCENTER_UNREACHABLE,
                e,
            )),
        }
    }

    async fn validate_placement(
        &self,
        zone: &mut VSphereDeploymentZone,
        session: &dyn Session,
        datacenter: &str,
    ) -> Result<Option<ManagedObject>> {
        let finder = session.finder();
        let constraint = zone.spec.placement_constraint.clone();

        let mut pool = None;
        if let Some(path) = constraint.resource_pool.as_deref() {
            match finder.resource_pool(datacenter, path).await {
                Ok(found) => pool = Some(found),
                Err(e) => {
                    return Err(reject(
                        zone,
                        conditions::PLACEMENT_CONSTRAINT_MET,
                        reasons::RESOURCE_POOL_NOT_FOUND,
                        classify(reasons::RESOURCE_POOL_NOT_FOUND, e),
                    ))
                }
            }
        }
        if let Some(path) = constraint.folder.as_deref() {
            if let Err(e) = finder.folder(datacenter, path).await {
                return Err(reject(
                    zone,
                    conditions::PLACEMENT_CONSTRAINT_MET,
                    reasons::FOLDER_NOT_FOUND,
                    classify(reasons::FOLDER_NOT_FOUND, e),
                ));
            }
        }

        zone.status
            .conditions
            .mark_true(conditions::PLACEMENT_CONSTRAINT_MET);
        Ok(pool)
    }

    /// Platform objects a region or zone tag belongs on
    async fn scope_objects(
        &self,
        session: &dyn Session,
        scope: &FailureDomain,
        topology: &Topology,
    ) -> Result<Vec<ManagedObject>> {
        let finder = session.finder();
        match scope.type_ {
            FailureDomainType::Datacenter => {
                Ok(vec![finder.datacenter(&topology.datacenter).await?])
            }
            FailureDomainType::ComputeCluster => {
                let Some(name) = topology.compute_cluster.as_deref() else {
                    return Err(ReconcileError::invariant(
                        "ComputeClusterNotSet",
                        format!(
                            "{} is scoped to a compute cluster but none is set",
                            scope.name
                        ),
                    ));
                };
                Ok(vec![finder.compute_cluster(&topology.datacenter, name).await?])
            }
            FailureDomainType::HostGroup => {
                let (Some(name), Some(hosts)) =
                    (topology.compute_cluster.as_deref(), topology.hosts.as_ref())
                else {
                    return Err(ReconcileError::invariant(
                        "HostGroupNotSet",
                        format!(
                            "{} is scoped to a host group but the topology names none",
                            scope.name
                        ),
                    ));
                };
                let cluster = finder.compute_cluster(&topology.datacenter, name).await?;
                Ok(finder
                    .hosts_in_group(&cluster, &hosts.host_group_name)
                    .await?)
            }
        }
    }

    /// Create and attach the scope's tag, or verify every object carries it
    async fn validate_scope(
        &self,
        session: &dyn Session,
        scope: &FailureDomain,
        topology: &Topology,
    ) -> Result<()> {
        let objects = self.scope_objects(session, scope, topology).await?;
        let tags = session.tags();

        if scope.auto_configure() {
            let category = tags
                .create_category(&scope.tag_category, &[scope.type_.associable_type()])
                .await?;
            let tag = tags.create_tag(&scope.name, &category).await?;
            for object in &objects {
                if !tags.has_tag(&tag, object).await? {
                    tags.attach_tag(&tag, object).await?;
                    debug!(
                        "Tagged {} with {}/{}",
                        object, scope.tag_category, scope.name
                    );
                }
            }
            return Ok(());
        }

        let tag = tags
            .get_tag_for_category(&scope.name, &scope.tag_category)
            .await
            .map_err(|e| classify("TagNotFound", e))?;
        for object in &objects {
            if !tags.has_tag(&tag, object).await? {
                return Err(ReconcileError::invariant(
                    "TagNotAttached",
                    format!(
                        "{} {} is missing tag {}/{}",
                        object.kind, object.name, scope.tag_category, scope.name
                    ),
                ));
            }
        }
        Ok(())
    }

    async fn validate_topology(
        &self,
        zone: &mut VSphereDeploymentZone,
        session: &dyn Session,
        topology: &Topology,
        pool: Option<&ManagedObject>,
    ) -> Result<()> {
        let finder = session.finder();
        let datacenter = topology.datacenter.as_str();
        let validated = conditions::FAILURE_DOMAIN_VALIDATED;

        let mut compute_cluster = None;
        if let Some(name) = topology.compute_cluster.as_deref() {
            let cluster = match finder.compute_cluster(datacenter, name).await {
                Ok(cluster) => cluster,
                Err(e) => {
                    return Err(reject(
                        zone,
                        validated,
                        reasons::COMPUTE_CLUSTER_NOT_FOUND,
                        classify(reasons::COMPUTE_CLUSTER_NOT_FOUND, e),
                    ))
                }
            };
            if let Some(pool) = pool {
                let owner = finder.resource_pool_owner(pool).await?;
                if owner.moref != cluster.moref {
                    let message = format!(
                        "resource pool {} belongs to {} {}, not compute cluster {}",
                        pool.name, owner.kind, owner.name, cluster.name
                    );
                    return Err(reject(
                        zone,
                        validated,
                        reasons::RESOURCE_POOL_NOT_OWNED,
                        ReconcileError::invariant(reasons::RESOURCE_POOL_NOT_OWNED, message),
                    ));
                }
            }
            compute_cluster = Some(cluster);
        }

        if let Some(datastore) = topology.datastore.as_deref() {
            if let Err(e) = finder.datastore(datacenter, datastore).await {
                return Err(reject(
                    zone,
                    validated,
                    reasons::DATASTORE_NOT_FOUND,
                    classify(reasons::DATASTORE_NOT_FOUND, e),
                ));
            }
        }

        for network in &topology.networks {
            if let Err(e) = finder.network(datacenter, network).await {
                return Err(reject(
                    zone,
                    validated,
                    reasons::NETWORK_NOT_FOUND,
                    classify(reasons::NETWORK_NOT_FOUND, e),
                ));
            }
        }

        if let Some(hosts) = topology.hosts.as_ref().filter(|h| h.is_defined()) {
            let Some(cluster) = compute_cluster else {
                return Err(reject(
                    zone,
                    validated,
                    reasons::HOSTS_MISCONFIGURED,
                    ReconcileError::invariant(
                        reasons::HOSTS_MISCONFIGURED,
                        "host placement requires a compute cluster",
                    ),
                ));
            };
            let rule = finder
                .vm_host_rule(&cluster, &hosts.vm_group_name, &hosts.host_group_name)
                .await?;
            match rule {
                None => {
                    let message = format!(
                        "no VM-host rule binds VM group {} to host group {} on {}",
                        hosts.vm_group_name, hosts.host_group_name, cluster.name
                    );
                    return Err(reject(
                        zone,
                        validated,
                        reasons::HOSTS_MISCONFIGURED,
                        ReconcileError::invariant(reasons::HOSTS_MISCONFIGURED, message),
                    ));
                }
                Some(rule) if !rule.enabled => {
                    warn!(
                        "VM-host rule {} for zone {} is disabled",
                        rule.name,
                        zone.name()
                    );
                    zone.status.conditions.mark_false(
                        validated,
                        reasons::HOSTS_AFFINITY_MISCONFIGURED,
                        ConditionSeverity::Warning,
                        format!("VM-host rule {} is disabled", rule.name),
                    );
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        zone.status.conditions.mark_true(validated);
        Ok(())
    }

    async fn reconcile_normal(&self, zone: &mut VSphereDeploymentZone) -> Result<Action> {
        let Some(failure_domain) = self
            .ctx
            .store
            .get_opt::<VSphereFailureDomain>("", &zone.spec.failure_domain)?
        else {
            let message = format!("failure domain {} does not exist", zone.spec.failure_domain);
            return Err(reject(
                zone,
                conditions::FAILURE_DOMAIN_VALIDATED,
                reasons::FAILURE_DOMAIN_NOT_FOUND,
                ReconcileError::invariant(reasons::FAILURE_DOMAIN_NOT_FOUND, message),
            ));
        };
        let topology = failure_domain.spec.topology.clone();

        let session = self.connect(zone, &topology).await?;
        let pool = self
            .validate_placement(zone, session.as_ref(), &topology.datacenter)
            .await?;

        for (scope, reason) in [
            (&failure_domain.spec.region, reasons::REGION_MISCONFIGURED),
            (&failure_domain.spec.zone, reasons::ZONE_MISCONFIGURED),
        ] {
            if let Err(e) = self
                .validate_scope(session.as_ref(), scope, &topology)
                .await
            {
                return Err(reject(zone, conditions::FAILURE_DOMAIN_VALIDATED, reason, e));
            }
        }

        self.validate_topology(zone, session.as_ref(), &topology, pool.as_ref())
            .await?;

        let mut owned = failure_domain.clone();
        if owned.set_owner_reference(zone.owner_reference(false)?) {
            self.ctx.store.patch_diff(&failure_domain, &owned)?;
        }

        if zone.status.ready != Some(true) {
            info!("Deployment zone {} is ready", zone.name());
        }
        zone.status.ready = Some(true);
        Ok(Action::await_change())
    }

    async fn reconcile_delete(&self, zone: &mut VSphereDeploymentZone) -> Result<Action> {
        let in_use: Vec<String> = self
            .ctx
            .store
            .list::<Machine>(&ListParams::default())?
            .iter()
            .filter(|m| !m.is_deleting())
            .filter(|m| m.spec.failure_domain.as_deref() == Some(zone.name()))
            .map(|m| format!("{}/{}", m.namespace(), m.name()))
            .collect();
        if !in_use.is_empty() {
            warn!(
                "Deployment zone {} is used by {} machines, refusing deletion",
                zone.name(),
                in_use.len()
            );
            let message = format!("referenced by machines {}", in_use.join(", "));
            zone.status.ready = Some(false);
            zone.status.conditions.mark_false(
                conditions::PLACEMENT_CONSTRAINT_MET,
                reasons::DEPLOYMENT_ZONE_IN_USE,
                ConditionSeverity::Error,
                message.clone(),
            );
            return Err(ReconcileError::in_use(
                format!("VSphereDeploymentZone {}", zone.name()),
                message,
            ));
        }

        if let (Some(uid), Some(failure_domain)) = (
            zone.uid(),
            self.ctx
                .store
                .get_opt::<VSphereFailureDomain>("", &zone.spec.failure_domain)?,
        ) {
            let mut released = failure_domain.clone();
            released.remove_owner_reference(uid);
            if released.owner_references().is_empty() {
                info!(
                    "Deleting failure domain {} with its last zone",
                    failure_domain.name()
                );
                match self
                    .ctx
                    .store
                    .delete::<VSphereFailureDomain>("", failure_domain.name())
                {
                    Err(e) if !e.is_not_found() => return Err(e.into()),
                    _ => {}
                }
            } else if released != failure_domain {
                self.ctx.store.patch_diff(&failure_domain, &released)?;
            }
        }

        zone.remove_finalizer(DEPLOYMENT_ZONE_FINALIZER);
        info!("Deployment zone {} deleted", zone.name());
        Ok(Action::await_change())
    }

    fn zones_for_failure_domain(&self, failure_domain: &str) -> Vec<ResourceKey> {
        match self
            .ctx
            .store
            .list::<VSphereDeploymentZone>(&ListParams::default())
        {
            Ok(zones) => zones
                .iter()
                .filter(|z| z.spec.failure_domain == failure_domain)
                .map(|z| VSphereDeploymentZone::key_for("", z.name()))
                .collect(),
            Err(e) => {
                debug!("Failed to list deployment zones: {}", e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Reconciler for ZoneReconciler {
    fn name(&self) -> &'static str {
        "vspheredeploymentzone"
    }

    fn kind(&self) -> GroupVersionKind {
        VSphereDeploymentZone::gvk()
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<Action> {
        let Some(zone) = self
            .ctx
            .store
            .get_opt::<VSphereDeploymentZone>("", &key.name)?
        else {
            debug!("{} no longer exists", key);
            return Ok(Action::await_change());
        };

        if !zone.is_deleting() && !zone.has_finalizer(DEPLOYMENT_ZONE_FINALIZER) {
            let mut updated = zone.clone();
            updated.add_finalizer(DEPLOYMENT_ZONE_FINALIZER);
            self.ctx.store.patch_diff(&zone, &updated)?;
            return Ok(Action::await_change());
        }

        let mut zone = PatchHelper::new(self.ctx.store.clone(), zone);
        let outcome = if zone.is_deleting() {
            self.reconcile_delete(&mut zone).await
        } else {
            self.reconcile_normal(&mut zone).await
        };
        zone.status.conditions.set_summary(&[
            conditions::VCENTER_AVAILABLE,
            conditions::PLACEMENT_CONSTRAINT_MET,
            conditions::FAILURE_DOMAIN_VALIDATED,
        ]);
        zone.finish(outcome)
    }

    fn map_event(&self, event: &ResourceEvent) -> Vec<ResourceKey> {
        if event.gvk == self.kind() {
            vec![event.resource_key.clone()]
        } else if event.gvk == VSphereFailureDomain::gvk() {
            self.zones_for_failure_domain(&event.resource_key.name)
        } else if event.gvk == Machine::gvk() {
            // A machine leaving a zone may unblock its deletion
            event
                .object
                .pointer("/spec/failureDomain")
                .and_then(|v| v.as_str())
                .filter(|name| !name.is_empty())
                .map(|name| vec![VSphereDeploymentZone::key_for("", name)])
                .unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{meta, Fixture, NAMESPACE, SERVER};
    use crate::ControllerConfig;
    use cirrus_core::{FailureDomainHosts, PlacementConstraint, VSphereFailureDomainSpec};
    use cirrus_platform::{MockComputeCluster, MockInventory, MockVmHostRule};
    use std::collections::BTreeMap;

    fn scope(name: &str, type_: FailureDomainType, category: &str, auto: bool) -> FailureDomain {
        FailureDomain {
            name: name.to_string(),
            type_,
            tag_category: category.to_string(),
            auto_configure: Some(auto),
        }
    }

    fn create_failure_domain(fixture: &Fixture, name: &str, auto: bool) -> VSphereFailureDomain {
        let fd = VSphereFailureDomain {
            metadata: meta("", name),
            spec: VSphereFailureDomainSpec {
                region: scope("us-east", FailureDomainType::Datacenter, "k8s-region", auto),
                zone: scope(
                    "zone-a",
                    FailureDomainType::ComputeCluster,
                    "k8s-zone",
                    auto,
                ),
                topology: Topology {
                    datacenter: "dc0".to_string(),
                    compute_cluster: Some("cluster0".to_string()),
                    hosts: None,
                    networks: vec!["vm-network".to_string()],
                    datastore: Some("ds0".to_string()),
                },
            },
        };
        fixture.store().create(fd).unwrap()
    }

    fn create_zone(fixture: &Fixture, name: &str, failure_domain: &str) -> VSphereDeploymentZone {
        let mut zone = VSphereDeploymentZone {
            metadata: meta("", name),
            ..Default::default()
        };
        zone.spec.server = SERVER.to_string();
        zone.spec.failure_domain = failure_domain.to_string();
        zone.spec.placement_constraint = PlacementConstraint {
            resource_pool: Some("pool0".to_string()),
            folder: Some("vms".to_string()),
        };
        fixture.store().create(zone).unwrap()
    }

    async fn reconcile(fixture: &Fixture, name: &str) -> Result<Action> {
        ZoneReconciler::new(fixture.ctx.clone())
            .reconcile(&VSphereDeploymentZone::key_for("", name))
            .await
    }

    /// Finalizer pass plus one validation pass
    async fn reconcile_twice(fixture: &Fixture, name: &str) -> Result<Action> {
        reconcile(fixture, name).await.unwrap();
        reconcile(fixture, name).await
    }

    fn stored(fixture: &Fixture, name: &str) -> VSphereDeploymentZone {
        fixture.store().get("", name).unwrap()
    }

    #[tokio::test]
    async fn test_first_pass_only_adds_finalizer() {
        let fixture = Fixture::new(ControllerConfig::default());
        create_failure_domain(&fixture, "fd-a", true);
        create_zone(&fixture, "zone-a", "fd-a");

        reconcile(&fixture, "zone-a").await.unwrap();

        let zone = stored(&fixture, "zone-a");
        assert!(zone.has_finalizer(DEPLOYMENT_ZONE_FINALIZER));
        assert_eq!(zone.status.ready, None);
        assert_eq!(fixture.mock.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_configure_tags_and_becomes_ready() {
        let fixture = Fixture::new(ControllerConfig::default());
        create_failure_domain(&fixture, "fd-a", true);
        create_zone(&fixture, "zone-a", "fd-a");

        reconcile_twice(&fixture, "zone-a").await.unwrap();

        let zone = stored(&fixture, "zone-a");
        assert_eq!(zone.status.ready, Some(true));
        assert!(zone.status.conditions.is_true(conditions::READY));
        assert_eq!(
            fixture.mock.tagged_objects("k8s-region", "us-east"),
            vec!["dc0"]
        );
        assert_eq!(
            fixture.mock.tagged_objects("k8s-zone", "zone-a"),
            vec!["cluster0"]
        );

        let fd: VSphereFailureDomain = fixture.store().get("", "fd-a").unwrap();
        assert!(fd.is_owned_by(zone.uid().unwrap()));

        // Idempotent
        reconcile(&fixture, "zone-a").await.unwrap();
        assert_eq!(fixture.mock.category_count(), 2);
        let fd: VSphereFailureDomain = fixture.store().get("", "fd-a").unwrap();
        assert_eq!(fd.owner_references().len(), 1);
    }

    #[tokio::test]
    async fn test_verify_mode_requires_existing_tags() {
        let fixture = Fixture::new(ControllerConfig::default());
        create_failure_domain(&fixture, "fd-a", false);
        create_zone(&fixture, "zone-a", "fd-a");

        let err = reconcile_twice(&fixture, "zone-a").await.unwrap_err();
        assert!(err.is_terminal());

        let zone = stored(&fixture, "zone-a");
        assert_eq!(zone.status.ready, Some(false));
        let condition = zone
            .status
            .conditions
            .get(conditions::FAILURE_DOMAIN_VALIDATED)
            .unwrap();
        assert_eq!(condition.reason, reasons::REGION_MISCONFIGURED);
        assert_eq!(fixture.mock.category_count(), 0);
    }

    #[tokio::test]
    async fn test_verify_mode_accepts_tagged_objects() {
        let fixture = Fixture::new(ControllerConfig::default());
        // A first zone tags the objects, a second one only verifies them
        create_failure_domain(&fixture, "fd-auto", true);
        create_zone(&fixture, "zone-auto", "fd-auto");
        reconcile_twice(&fixture, "zone-auto").await.unwrap();

        create_failure_domain(&fixture, "fd-check", false);
        create_zone(&fixture, "zone-check", "fd-check");
        reconcile_twice(&fixture, "zone-check").await.unwrap();

        assert_eq!(stored(&fixture, "zone-check").status.ready, Some(true));
    }

    #[tokio::test]
    async fn test_missing_resource_pool() {
        let fixture = Fixture::new(ControllerConfig::default());
        create_failure_domain(&fixture, "fd-a", true);
        let mut zone = create_zone(&fixture, "zone-a", "fd-a");
        let before = zone.clone();
        zone.spec.placement_constraint.resource_pool = Some("missing".to_string());
        fixture.store().patch_diff(&before, &zone).unwrap();

        let err = reconcile_twice(&fixture, "zone-a").await.unwrap_err();
        assert!(err.is_terminal());

        let zone = stored(&fixture, "zone-a");
        let condition = zone
            .status
            .conditions
            .get(conditions::PLACEMENT_CONSTRAINT_MET)
            .unwrap();
        assert_eq!(condition.reason, reasons::RESOURCE_POOL_NOT_FOUND);
        assert_eq!(zone.status.ready, Some(false));
    }

    #[tokio::test]
    async fn test_resource_pool_not_owned_by_compute_cluster() {
        let inventory = MockInventory {
            standalone_resource_pools: vec!["standalone".to_string()],
            ..Default::default()
        };
        let fixture = Fixture::with_inventory(inventory, ControllerConfig::default());
        create_failure_domain(&fixture, "fd-a", true);
        let mut zone = create_zone(&fixture, "zone-a", "fd-a");
        let before = zone.clone();
        zone.spec.placement_constraint.resource_pool = Some("standalone".to_string());
        fixture.store().patch_diff(&before, &zone).unwrap();

        let err = reconcile_twice(&fixture, "zone-a").await.unwrap_err();
        assert!(err.is_terminal());
        let condition = stored(&fixture, "zone-a")
            .status
            .conditions
            .get(conditions::FAILURE_DOMAIN_VALIDATED)
            .cloned()
            .unwrap();
        assert_eq!(condition.reason, reasons::RESOURCE_POOL_NOT_OWNED);
    }

    fn host_inventory(rule_enabled: Option<bool>) -> MockInventory {
        let cluster = MockComputeCluster {
            host_groups: BTreeMap::from([("hosts-a".to_string(), vec!["esx-0".to_string()])]),
            vm_host_rules: rule_enabled
                .map(|enabled| MockVmHostRule {
                    name: "rule-a".to_string(),
                    vm_group: "vms-a".to_string(),
                    host_group: "hosts-a".to_string(),
                    enabled,
                })
                .into_iter()
                .collect(),
            ..Default::default()
        };
        MockInventory {
            compute_clusters: vec![cluster],
            ..Default::default()
        }
    }

    fn with_hosts(fixture: &Fixture, name: &str) {
        let fd: VSphereFailureDomain = fixture.store().get("", name).unwrap();
        let mut updated = fd.clone();
        updated.spec.topology.hosts = Some(FailureDomainHosts {
            vm_group_name: "vms-a".to_string(),
            host_group_name: "hosts-a".to_string(),
        });
        updated.spec.zone = scope("zone-a", FailureDomainType::HostGroup, "k8s-zone", true);
        fixture.store().patch_diff(&fd, &updated).unwrap();
    }

    #[tokio::test]
    async fn test_host_group_zone_tags_hosts() {
        let fixture =
            Fixture::with_inventory(host_inventory(Some(true)), ControllerConfig::default());
        create_failure_domain(&fixture, "fd-a", true);
        with_hosts(&fixture, "fd-a");
        create_zone(&fixture, "zone-a", "fd-a");

        reconcile_twice(&fixture, "zone-a").await.unwrap();

        assert_eq!(stored(&fixture, "zone-a").status.ready, Some(true));
        assert_eq!(
            fixture.mock.tagged_objects("k8s-zone", "zone-a"),
            vec!["esx-0"]
        );
    }

    #[tokio::test]
    async fn test_disabled_affinity_rule_is_a_warning() {
        let fixture =
            Fixture::with_inventory(host_inventory(Some(false)), ControllerConfig::default());
        create_failure_domain(&fixture, "fd-a", true);
        with_hosts(&fixture, "fd-a");
        create_zone(&fixture, "zone-a", "fd-a");

        reconcile_twice(&fixture, "zone-a").await.unwrap();

        let zone = stored(&fixture, "zone-a");
        assert_eq!(zone.status.ready, Some(true));
        let condition = zone
            .status
            .conditions
            .get(conditions::FAILURE_DOMAIN_VALIDATED)
            .unwrap();
        assert_eq!(condition.reason, reasons::HOSTS_AFFINITY_MISCONFIGURED);
        assert_eq!(condition.severity, ConditionSeverity::Warning);
    }

    #[tokio::test]
    async fn test_missing_affinity_rule_is_fatal() {
        let fixture = Fixture::with_inventory(host_inventory(None), ControllerConfig::default());
        create_failure_domain(&fixture, "fd-a", true);
        with_hosts(&fixture, "fd-a");
        create_zone(&fixture, "zone-a", "fd-a");

        let err = reconcile_twice(&fixture, "zone-a").await.unwrap_err();
        assert!(err.is_terminal());
        let zone = stored(&fixture, "zone-a");
        assert_eq!(zone.status.ready, Some(false));
        assert_eq!(
            zone.status
                .conditions
                .get(conditions::FAILURE_DOMAIN_VALIDATED)
                .unwrap()
                .reason,
            reasons::HOSTS_MISCONFIGURED
        );
    }

    #[tokio::test]
    async fn test_missing_failure_domain() {
        let fixture = Fixture::new(ControllerConfig::default());
        create_zone(&fixture, "zone-a", "fd-missing");

        let err = reconcile_twice(&fixture, "zone-a").await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(
            stored(&fixture, "zone-a")
                .status
                .conditions
                .get(conditions::FAILURE_DOMAIN_VALIDATED)
                .unwrap()
                .reason,
            reasons::FAILURE_DOMAIN_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let fixture = Fixture::new(ControllerConfig::default());
        fixture.mock.set_server_reachable(SERVER, false);
        create_failure_domain(&fixture, "fd-a", true);
        create_zone(&fixture, "zone-a", "fd-a");

        let err = reconcile_twice(&fixture, "zone-a").await.unwrap_err();
        assert!(!err.is_terminal());
        assert!(stored(&fixture, "zone-a")
            .status
            .conditions
            .is_false(conditions::VCENTER_AVAILABLE));
    }

    fn create_machine(fixture: &Fixture, name: &str, zone: &str) -> Machine {
        let mut machine = Machine {
            metadata: meta(NAMESPACE, name),
            ..Default::default()
        };
        machine.spec.cluster_name = "c1".to_string();
        machine.spec.failure_domain = Some(zone.to_string());
        fixture.store().create(machine).unwrap()
    }

    #[tokio::test]
    async fn test_delete_refused_while_machines_use_zone() {
        let fixture = Fixture::new(ControllerConfig::default());
        create_failure_domain(&fixture, "fd-a", true);
        create_zone(&fixture, "zone-a", "fd-a");
        reconcile_twice(&fixture, "zone-a").await.unwrap();
        create_machine(&fixture, "m-0", "zone-a");

        fixture
            .store()
            .delete::<VSphereDeploymentZone>("", "zone-a")
            .unwrap();
        let err = reconcile(&fixture, "zone-a").await.unwrap_err();
        assert!(matches!(err, ReconcileError::InUse { .. }));
        let zone = stored(&fixture, "zone-a");
        assert!(zone.has_finalizer(DEPLOYMENT_ZONE_FINALIZER));
        assert_eq!(zone.status.ready, Some(false));
        let condition = zone
            .status
            .conditions
            .get(conditions::PLACEMENT_CONSTRAINT_MET)
            .unwrap();
        assert!(condition.is_false());
        assert_eq!(condition.reason, reasons::DEPLOYMENT_ZONE_IN_USE);
        assert!(zone.status.conditions.is_false(conditions::READY));

        fixture.store().delete::<Machine>(NAMESPACE, "m-0").unwrap();
        reconcile(&fixture, "zone-a").await.unwrap();

        assert!(fixture
            .store()
            .get_opt::<VSphereDeploymentZone>("", "zone-a")
            .unwrap()
            .is_none());
        // The zone was the only owner of its failure domain
        assert!(fixture
            .store()
            .get_opt::<VSphereFailureDomain>("", "fd-a")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_shared_failure_domain_survives() {
        let fixture = Fixture::new(ControllerConfig::default());
        create_failure_domain(&fixture, "fd-a", true);
        create_zone(&fixture, "zone-a", "fd-a");
        create_zone(&fixture, "zone-b", "fd-a");
        reconcile_twice(&fixture, "zone-a").await.unwrap();
        reconcile_twice(&fixture, "zone-b").await.unwrap();

        fixture
            .store()
            .delete::<VSphereDeploymentZone>("", "zone-a")
            .unwrap();
        reconcile(&fixture, "zone-a").await.unwrap();

        let fd: VSphereFailureDomain = fixture.store().get("", "fd-a").unwrap();
        let zone_b = stored(&fixture, "zone-b");
        assert_eq!(fd.owner_references().len(), 1);
        assert!(fd.is_owned_by(zone_b.uid().unwrap()));
    }

    #[test]
    fn test_failure_domain_events_map_to_zones() {
        let fixture = Fixture::new(ControllerConfig::default());
        let fd = create_failure_domain(&fixture, "fd-a", true);
        create_zone(&fixture, "zone-a", "fd-a");
        create_zone(&fixture, "zone-b", "fd-a");
        create_zone(&fixture, "zone-c", "fd-other");
        let reconciler = ZoneReconciler::new(fixture.ctx.clone());

        let event = ResourceEvent::modified(
            VSphereFailureDomain::key_for("", "fd-a"),
            serde_json::to_value(&fd).unwrap(),
            "2".to_string(),
        );
        let keys = reconciler.map_event(&event);
        assert_eq!(
            keys,
            vec![
                VSphereDeploymentZone::key_for("", "zone-a"),
                VSphereDeploymentZone::key_for("", "zone-b"),
            ]
        );

        let machine = create_machine(&fixture, "m-0", "zone-c");
        let event = ResourceEvent::deleted(
            Machine::key_for(NAMESPACE, "m-0"),
            serde_json::to_value(&machine).unwrap(),
            "3".to_string(),
        );
        assert_eq!(
            reconciler.map_event(&event),
            vec![VSphereDeploymentZone::key_for("", "zone-c")]
        );
    }
}
