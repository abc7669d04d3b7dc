//! Anti-affinity cluster modules of a VSphereCluster.
//!
//! Every live control plane and machine deployment of a cluster gets one
//! platform module. The persisted list on the VSphereCluster is the record of
//! which module belongs to which target; it is rebuilt on every pass from
//! what still exists, then completed with modules for new targets.

use crate::context::Context;
use crate::error::{ReconcileError, Result};
use cirrus_core::conditions::{self, reasons};
use cirrus_core::well_known::{CLUSTER_NAME_LABEL, CONTROL_PLANE_MODULE_PREFIX};
use cirrus_core::{
    ClusterModule, ConditionSeverity, KubeadmControlPlane, MachineDeployment, Resource,
    VSphereCluster,
};
use cirrus_platform::{ModuleTarget, PlatformError, Session, VSPHERE_MACHINE_TEMPLATE_KIND};
use cirrus_storage::ListParams;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key identifying a module's target within one cluster
fn module_key(control_plane: bool, target_name: &str) -> String {
    if control_plane {
        format!("{}{}", CONTROL_PLANE_MODULE_PREFIX, target_name)
    } else {
        target_name.to_string()
    }
}

fn template_kind(kind: &str) -> String {
    if kind.is_empty() {
        VSPHERE_MACHINE_TEMPLATE_KIND.to_string()
    } else {
        kind.to_string()
    }
}

pub struct ClusterModuleReconciler {
    ctx: Arc<Context>,
}

impl ClusterModuleReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Live targets of a cluster keyed by module key
    fn targets(
        &self,
        vsphere: &VSphereCluster,
        cluster_name: &str,
    ) -> Result<BTreeMap<String, ModuleTarget>> {
        let namespace = vsphere.namespace();
        let params =
            ListParams::in_namespace(namespace).with_label(CLUSTER_NAME_LABEL, cluster_name);
        let mut targets = BTreeMap::new();

        let control_planes = self.ctx.store.list::<KubeadmControlPlane>(&params)?;
        if let Some(kcp) = control_planes.iter().find(|k| !k.is_deleting()) {
            targets.insert(
                module_key(true, kcp.name()),
                ModuleTarget {
                    namespace: namespace.to_string(),
                    name: kcp.name().to_string(),
                    control_plane: true,
                    template_kind: template_kind(&kcp.spec.infrastructure_template_kind),
                },
            );
        }

        for md in self
            .ctx
            .store
            .list::<MachineDeployment>(&params)?
            .iter()
            .filter(|md| !md.is_deleting())
        {
            targets.insert(
                module_key(false, md.name()),
                ModuleTarget {
                    namespace: namespace.to_string(),
                    name: md.name().to_string(),
                    control_plane: false,
                    template_kind: template_kind(&md.spec.infrastructure_template_kind),
                },
            );
        }

        Ok(targets)
    }

    /// Bring the platform modules and the persisted list in line with the
    /// cluster's current targets
    pub async fn reconcile(
        &self,
        vsphere: &mut VSphereCluster,
        cluster_name: &str,
        session: &dyn Session,
    ) -> Result<()> {
        let modules = &self.ctx.platform.modules;
        let targets = self.targets(vsphere, cluster_name)?;

        let mut kept: Vec<ClusterModule> = Vec::new();
        // Keys already backed by a module that still exists
        let mut covered: BTreeSet<String> = BTreeSet::new();
        let mut errors: Vec<PlatformError> = Vec::new();

        for module in std::mem::take(&mut vsphere.spec.cluster_modules) {
            let key = module_key(module.control_plane, &module.target_object_name);

            if covered.contains(&key) {
                if !kept.iter().any(|m| m.module_uuid == module.module_uuid) {
                    info!(
                        "Releasing duplicate cluster module {} for {}",
                        module.module_uuid, key
                    );
                    if let Err(e) = modules.remove(session, &module.module_uuid).await {
                        warn!(
                            "Failed to remove duplicate module {}: {}",
                            module.module_uuid, e
                        );
                    }
                }
                continue;
            }

            let Some(target) = targets.get(&key) else {
                info!(
                    "Target {} of cluster module {} is gone, removing the module",
                    key, module.module_uuid
                );
                if let Err(e) = modules.remove(session, &module.module_uuid).await {
                    warn!("Failed to remove module {}: {}", module.module_uuid, e);
                }
                continue;
            };

            match modules
                .does_exist(session, target, &module.module_uuid)
                .await
            {
                Ok(true) => {
                    covered.insert(key);
                    kept.push(module);
                }
                Ok(false) => {
                    info!(
                        "Cluster module {} for {} no longer exists, recreating",
                        module.module_uuid, target
                    );
                }
                Err(e) => {
                    // Keep the record; its existence is unknown
                    errors.push(e);
                    covered.insert(key);
                    kept.push(module);
                }
            }
        }

        for (key, target) in &targets {
            if covered.contains(key) {
                continue;
            }
            match modules.create(session, target).await {
                Ok(uuid) if uuid.is_empty() => {
                    debug!("Cluster module creation skipped for {}", target);
                }
                Ok(uuid) => {
                    info!("Created cluster module {} for {}", uuid, target);
                    kept.push(ClusterModule {
                        control_plane: target.control_plane,
                        target_object_name: target.name.clone(),
                        module_uuid: uuid,
                    });
                }
                Err(e) => errors.push(e),
            }
        }

        vsphere.spec.cluster_modules = kept;

        if errors.is_empty() {
            if vsphere.spec.cluster_modules.is_empty() {
                vsphere
                    .status
                    .conditions
                    .remove(conditions::CLUSTER_MODULES_AVAILABLE);
            } else {
                vsphere
                    .status
                    .conditions
                    .mark_true(conditions::CLUSTER_MODULES_AVAILABLE);
            }
            return Ok(());
        }

        let only_incompatible = errors.iter().all(PlatformError::is_incompatible_owner);
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        vsphere.status.conditions.mark_false(
            conditions::CLUSTER_MODULES_AVAILABLE,
            reasons::CLUSTER_MODULE_SETUP_FAILED,
            ConditionSeverity::Warning,
            message,
        );

        if only_incompatible {
            warn!(
                "Cluster modules unavailable for {}/{}: incompatible resource pool owner",
                vsphere.namespace(),
                vsphere.name()
            );
            return Ok(());
        }
        Err(ReconcileError::aggregate(
            errors.into_iter().map(ReconcileError::from).collect(),
        ))
    }

    /// Remove every module of a cluster being deleted
    pub async fn reconcile_delete(
        &self,
        vsphere: &mut VSphereCluster,
        session: &dyn Session,
    ) -> Result<()> {
        let mut errors = Vec::new();
        let mut remaining = Vec::new();
        for module in std::mem::take(&mut vsphere.spec.cluster_modules) {
            match self
                .ctx
                .platform
                .modules
                .remove(session, &module.module_uuid)
                .await
            {
                Ok(()) => info!("Removed cluster module {}", module.module_uuid),
                Err(e) => {
                    errors.push(ReconcileError::from(e));
                    remaining.push(module);
                }
            }
        }
        vsphere.spec.cluster_modules = remaining;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::aggregate(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{meta, Fixture, NAMESPACE, SERVER};
    use crate::ControllerConfig;
    use cirrus_platform::{Credentials, SessionParams};

    async fn session(fixture: &Fixture) -> Arc<dyn Session> {
        fixture
            .ctx
            .session(&SessionParams::new(SERVER, Credentials::new("admin", "secret")))
            .await
            .unwrap()
    }

    fn create_kcp(fixture: &Fixture, name: &str) -> KubeadmControlPlane {
        let mut kcp = KubeadmControlPlane {
            metadata: meta(NAMESPACE, name),
            ..Default::default()
        };
        kcp.set_label(CLUSTER_NAME_LABEL, "c1");
        kcp.spec.infrastructure_template_kind = VSPHERE_MACHINE_TEMPLATE_KIND.to_string();
        fixture.store().create(kcp).unwrap()
    }

    fn create_md(fixture: &Fixture, name: &str, template_kind: &str) -> MachineDeployment {
        let mut md = MachineDeployment {
            metadata: meta(NAMESPACE, name),
            ..Default::default()
        };
        md.set_label(CLUSTER_NAME_LABEL, "c1");
        md.spec.cluster_name = "c1".to_string();
        md.spec.infrastructure_template_kind = template_kind.to_string();
        fixture.store().create(md).unwrap()
    }

    fn fixture() -> Fixture {
        Fixture::new(ControllerConfig {
            enable_anti_affinity: true,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_modules_created_per_target() {
        let fixture = fixture();
        let (_, mut vsphere) = fixture.create_cluster("c1");
        create_kcp(&fixture, "c1-cp");
        create_md(&fixture, "c1-md-0", VSPHERE_MACHINE_TEMPLATE_KIND);
        let session = session(&fixture).await;

        let reconciler = ClusterModuleReconciler::new(fixture.ctx.clone());
        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();

        assert_eq!(vsphere.spec.cluster_modules.len(), 2);
        let control_plane = vsphere
            .spec
            .cluster_modules
            .iter()
            .find(|m| m.control_plane)
            .unwrap();
        assert_eq!(control_plane.target_object_name, "c1-cp");
        assert_eq!(fixture.mock.modules().len(), 2);
        assert!(vsphere
            .status
            .conditions
            .is_true(conditions::CLUSTER_MODULES_AVAILABLE));

        // Stable on the next pass
        let before = vsphere.spec.cluster_modules.clone();
        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();
        assert_eq!(vsphere.spec.cluster_modules, before);
        assert_eq!(fixture.mock.modules().len(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_template_is_skipped() {
        let fixture = fixture();
        let (_, mut vsphere) = fixture.create_cluster("c1");
        create_md(&fixture, "c1-md-0", "SomeOtherTemplate");
        let session = session(&fixture).await;

        ClusterModuleReconciler::new(fixture.ctx.clone())
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();

        assert!(vsphere.spec.cluster_modules.is_empty());
        assert!(vsphere
            .status
            .conditions
            .get(conditions::CLUSTER_MODULES_AVAILABLE)
            .is_none());
    }

    #[tokio::test]
    async fn test_vanished_module_is_recreated() {
        let fixture = fixture();
        let (_, mut vsphere) = fixture.create_cluster("c1");
        create_md(&fixture, "c1-md-0", VSPHERE_MACHINE_TEMPLATE_KIND);
        let session = session(&fixture).await;
        let reconciler = ClusterModuleReconciler::new(fixture.ctx.clone());

        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();
        let old = vsphere.spec.cluster_modules[0].module_uuid.clone();
        fixture.mock.drop_module(&old);

        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();
        assert_eq!(vsphere.spec.cluster_modules.len(), 1);
        assert_ne!(vsphere.spec.cluster_modules[0].module_uuid, old);
    }

    #[tokio::test]
    async fn test_removed_target_releases_module() {
        let fixture = fixture();
        let (_, mut vsphere) = fixture.create_cluster("c1");
        create_md(&fixture, "c1-md-0", VSPHERE_MACHINE_TEMPLATE_KIND);
        create_md(&fixture, "c1-md-1", VSPHERE_MACHINE_TEMPLATE_KIND);
        let session = session(&fixture).await;
        let reconciler = ClusterModuleReconciler::new(fixture.ctx.clone());
        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();
        assert_eq!(fixture.mock.modules().len(), 2);

        fixture
            .store()
            .delete::<MachineDeployment>(NAMESPACE, "c1-md-1")
            .unwrap();
        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();

        assert_eq!(vsphere.spec.cluster_modules.len(), 1);
        assert_eq!(
            vsphere.spec.cluster_modules[0].target_object_name,
            "c1-md-0"
        );
        assert_eq!(fixture.mock.modules().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_entries_are_collapsed() {
        let fixture = fixture();
        let (_, mut vsphere) = fixture.create_cluster("c1");
        create_md(&fixture, "c1-md-0", VSPHERE_MACHINE_TEMPLATE_KIND);
        let session = session(&fixture).await;
        let reconciler = ClusterModuleReconciler::new(fixture.ctx.clone());
        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();

        let target = ModuleTarget {
            namespace: NAMESPACE.to_string(),
            name: "c1-md-0".to_string(),
            control_plane: false,
            template_kind: VSPHERE_MACHINE_TEMPLATE_KIND.to_string(),
        };
        let extra = fixture
            .ctx
            .platform
            .modules
            .create(session.as_ref(), &target)
            .await
            .unwrap();
        vsphere.spec.cluster_modules.push(ClusterModule {
            control_plane: false,
            target_object_name: "c1-md-0".to_string(),
            module_uuid: extra.clone(),
        });

        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();
        assert_eq!(vsphere.spec.cluster_modules.len(), 1);
        assert!(!fixture.mock.modules().contains(&extra));
    }

    #[tokio::test]
    async fn test_duplicate_keeps_the_entry_that_exists() {
        let fixture = fixture();
        let (_, mut vsphere) = fixture.create_cluster("c1");
        create_md(&fixture, "c1-md-0", VSPHERE_MACHINE_TEMPLATE_KIND);
        let session = session(&fixture).await;
        let reconciler = ClusterModuleReconciler::new(fixture.ctx.clone());
        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();
        let live = vsphere.spec.cluster_modules[0].clone();

        // A stale record for the same target listed ahead of the live one
        vsphere.spec.cluster_modules.insert(
            0,
            ClusterModule {
                control_plane: false,
                target_object_name: "c1-md-0".to_string(),
                module_uuid: "stale-module".to_string(),
            },
        );

        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();
        assert_eq!(vsphere.spec.cluster_modules, vec![live.clone()]);
        assert_eq!(fixture.mock.modules(), vec![live.module_uuid]);
    }

    #[tokio::test]
    async fn test_incompatible_owner_is_a_warning() {
        let fixture = fixture();
        let (_, mut vsphere) = fixture.create_cluster("c1");
        create_md(&fixture, "c1-md-0", VSPHERE_MACHINE_TEMPLATE_KIND);
        fixture.mock.mark_incompatible("c1-md-0");
        let session = session(&fixture).await;

        ClusterModuleReconciler::new(fixture.ctx.clone())
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();

        let condition = vsphere
            .status
            .conditions
            .get(conditions::CLUSTER_MODULES_AVAILABLE)
            .unwrap();
        assert!(condition.is_false());
        assert_eq!(condition.severity, ConditionSeverity::Warning);
        assert_eq!(condition.reason, reasons::CLUSTER_MODULE_SETUP_FAILED);
    }

    #[tokio::test]
    async fn test_existence_check_failure_is_an_error() {
        let fixture = fixture();
        let (_, mut vsphere) = fixture.create_cluster("c1");
        create_md(&fixture, "c1-md-0", VSPHERE_MACHINE_TEMPLATE_KIND);
        let session = session(&fixture).await;
        let reconciler = ClusterModuleReconciler::new(fixture.ctx.clone());
        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();

        fixture.mock.fail_module_checks(true);
        let result = reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await;

        assert!(result.is_err());
        // The record survives an unknown existence state
        assert_eq!(vsphere.spec.cluster_modules.len(), 1);
        assert!(vsphere
            .status
            .conditions
            .is_false(conditions::CLUSTER_MODULES_AVAILABLE));
    }

    #[tokio::test]
    async fn test_delete_removes_all_modules() {
        let fixture = fixture();
        let (_, mut vsphere) = fixture.create_cluster("c1");
        create_kcp(&fixture, "c1-cp");
        create_md(&fixture, "c1-md-0", VSPHERE_MACHINE_TEMPLATE_KIND);
        let session = session(&fixture).await;
        let reconciler = ClusterModuleReconciler::new(fixture.ctx.clone());
        reconciler
            .reconcile(&mut vsphere, "c1", session.as_ref())
            .await
            .unwrap();

        reconciler
            .reconcile_delete(&mut vsphere, session.as_ref())
            .await
            .unwrap();
        assert!(vsphere.spec.cluster_modules.is_empty());
        assert!(fixture.mock.modules().is_empty());
    }
}
