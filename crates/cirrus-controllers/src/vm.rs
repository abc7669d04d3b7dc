//! VSphereVM reconciler.

use crate::context::Context;
use crate::error::{ReconcileError, Result};
use crate::ipam;
use crate::patch::PatchHelper;
use crate::reconciler::{Action, Reconciler};
use async_trait::async_trait;
use cirrus_core::conditions::{self, reasons};
use cirrus_core::well_known::{CLUSTER_NAME_LABEL, VM_FINALIZER};
use cirrus_core::{
    Cluster, ConditionSeverity, GroupVersionKind, IPAddressClaim, Resource, ResourceEvent,
    ResourceKey, VSphereVM, VirtualMachineState,
};
use cirrus_platform::{Session, SessionParams};
use cirrus_storage::ListParams;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct VmReconciler {
    ctx: Arc<Context>,
}

impl VmReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Open (or reuse) a session with the credentials of the VM's cluster
    async fn session_for(&self, vm: &VSphereVM) -> Result<Arc<dyn Session>> {
        let infra = match self.ctx.cluster_for(vm)? {
            Some(cluster) => self.ctx.infra_cluster_for(&cluster)?,
            None => None,
        };
        let credentials = match infra {
            Some(infra) => self.ctx.credentials.get_credentials(&infra).await?,
            None => {
                self.ctx
                    .credentials
                    .credentials_for_server(&vm.spec.server)
                    .await?
            }
        };
        let params = SessionParams::new(vm.spec.server.clone(), credentials)
            .with_datacenter(vm.spec.datacenter.clone())
            .with_thumbprint(vm.spec.thumbprint.clone());
        self.ctx.session(&params).await
    }

    async fn connect(&self, vm: &mut VSphereVM) -> Result<Arc<dyn Session>> {
        match self.session_for(vm).await {
            Ok(session) => {
                vm.status
                    .conditions
                    .mark_true(conditions::VCENTER_AVAILABLE);
                Ok(session)
            }
            Err(e) => {
                vm.status.conditions.mark_false(
                    conditions::VCENTER_AVAILABLE,
                    reasons::VCENTER_UNREACHABLE,
                    ConditionSeverity::Error,
                    e.to_string(),
                );
                Err(e)
            }
        }
    }

    async fn reconcile_normal(&self, vm: &mut VSphereVM) -> Result<Action> {
        if vm.has_failed() {
            info!(
                "VM {}/{} has failed ({}), not reconciling",
                vm.namespace(),
                vm.name(),
                vm.status.failure_reason.as_deref().unwrap_or("unknown")
            );
            return Ok(Action::await_change());
        }

        if vm
            .spec
            .network
            .devices
            .iter()
            .any(|d| !d.has_static_ip_config())
        {
            info!(
                "VM {}/{} is waiting for static IP configuration",
                vm.namespace(),
                vm.name()
            );
            vm.status.conditions.mark_false(
                conditions::VM_PROVISIONED,
                reasons::WAITING_FOR_STATIC_IP_ALLOCATION,
                ConditionSeverity::Info,
                "",
            );
            return Ok(Action::await_change());
        }

        let bound = ipam::reconcile_claims(&self.ctx.store, vm)?;
        if vm
            .status
            .conditions
            .get(conditions::IP_ADDRESS_CLAIMED)
            .is_some_and(|c| !c.is_true())
        {
            debug!(
                "VM {}/{} is waiting for its IP address claims",
                vm.namespace(),
                vm.name()
            );
            return Ok(Action::await_change());
        }

        let session = self.connect(vm).await?;

        let outcome = match self
            .ctx
            .platform
            .vms
            .reconcile_vm(session.as_ref(), vm, &bound)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                vm.status.conditions.mark_false(
                    conditions::VM_PROVISIONED,
                    reasons::PROVISIONING_FAILED,
                    ConditionSeverity::Warning,
                    e.to_string(),
                );
                return Err(e.into());
            }
        };

        vm.status.state = Some(outcome.state);
        if outcome.state != VirtualMachineState::Ready {
            vm.status.ready = false;
            vm.status.conditions.mark_false(
                conditions::VM_PROVISIONED,
                reasons::PROVISIONING,
                ConditionSeverity::Info,
                outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| outcome.state.to_string()),
            );
            debug!(
                "VM {}/{} is {}, waiting",
                vm.namespace(),
                vm.name(),
                outcome.state
            );
            return Ok(Action::await_change());
        }

        let Some(bios_uuid) = outcome.bios_uuid.clone().filter(|u| !u.is_empty()) else {
            let message = format!(
                "VM {}/{} is ready but the platform reported no BIOS UUID",
                vm.namespace(),
                vm.name()
            );
            vm.status.ready = false;
            vm.status.conditions.mark_false(
                conditions::VM_PROVISIONED,
                reasons::MISSING_BIOS_UUID,
                ConditionSeverity::Error,
                message.clone(),
            );
            return Err(ReconcileError::invariant(reasons::MISSING_BIOS_UUID, message));
        };
        match &vm.spec.bios_uuid {
            None => vm.spec.bios_uuid = Some(bios_uuid),
            Some(existing) if *existing != bios_uuid => warn!(
                "VM {}/{} reports BIOS UUID {} but {} is recorded; keeping the recorded one",
                vm.namespace(),
                vm.name(),
                bios_uuid,
                existing
            ),
            Some(_) => {}
        }
        if vm.status.vm_ref.is_none() {
            vm.status.vm_ref = outcome.vm_ref.clone();
        }

        vm.status.network = outcome.network.clone();
        vm.status.addresses = outcome.addresses();
        if vm.status.addresses.is_empty() {
            info!(
                "VM {}/{} is waiting for an IP address",
                vm.namespace(),
                vm.name()
            );
            vm.status.conditions.mark_false(
                conditions::VM_PROVISIONED,
                reasons::WAITING_FOR_IP_ALLOCATION,
                ConditionSeverity::Info,
                "",
            );
            return Ok(Action::requeue(self.ctx.config.requeue_after));
        }

        vm.status.conditions.mark_true(conditions::VM_PROVISIONED);
        vm.status.ready = true;
        info!("VM {}/{} is ready", vm.namespace(), vm.name());
        Ok(Action::await_change())
    }

    async fn reconcile_delete(&self, vm: &mut VSphereVM) -> Result<Action> {
        vm.status.conditions.mark_false(
            conditions::VM_PROVISIONED,
            reasons::DELETING,
            ConditionSeverity::Info,
            "",
        );

        let session = self.connect(vm).await?;
        match self
            .ctx
            .platform
            .vms
            .destroy_vm(session.as_ref(), vm)
            .await
        {
            Ok(outcome) => {
                vm.status.state = Some(outcome.state);
                if outcome.requeue || outcome.state != VirtualMachineState::NotFound {
                    debug!(
                        "VM {}/{} is still being destroyed ({})",
                        vm.namespace(),
                        vm.name(),
                        outcome.state
                    );
                    return Ok(Action::requeue(self.ctx.config.requeue_after));
                }
            }
            Err(e) if e.is_not_found() => {
                vm.status.state = Some(VirtualMachineState::NotFound);
            }
            Err(e) => {
                vm.status.conditions.mark_false(
                    conditions::VM_PROVISIONED,
                    reasons::DELETION_FAILED,
                    ConditionSeverity::Warning,
                    e.to_string(),
                );
                return Err(e.into());
            }
        }

        self.delete_node(vm).await;
        ipam::release_claims(&self.ctx.store, vm)?;

        vm.remove_finalizer(VM_FINALIZER);
        info!("VM {}/{} deleted", vm.namespace(), vm.name());
        Ok(Action::await_change())
    }

    /// Remove the workload cluster Node named after the VM. Failures are logged only.
    async fn delete_node(&self, vm: &VSphereVM) {
        let cluster = match self.ctx.cluster_for(vm) {
            Ok(Some(cluster)) => cluster,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to look up cluster of VM {}: {}", vm.name(), e);
                return;
            }
        };
        if cluster.is_deleting() || cluster.spec.control_plane_endpoint.is_zero() {
            return;
        }
        if let Err(e) = self
            .ctx
            .platform
            .remote
            .delete_node(&cluster.spec.control_plane_endpoint, vm.name())
            .await
        {
            warn!("Failed to delete node {}: {}", vm.name(), e);
        }
    }
}

#[async_trait]
impl Reconciler for VmReconciler {
    fn name(&self) -> &'static str {
        "vspherevm"
    }

    fn kind(&self) -> GroupVersionKind {
        VSphereVM::gvk()
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<Action> {
        let Some(vm) = self
            .ctx
            .store
            .get_opt::<VSphereVM>(&key.namespace, &key.name)?
        else {
            debug!("{} no longer exists", key);
            return Ok(Action::await_change());
        };

        if !vm.is_deleting() && !vm.has_finalizer(VM_FINALIZER) {
            let mut updated = vm.clone();
            updated.add_finalizer(VM_FINALIZER);
            self.ctx.store.patch_diff(&vm, &updated)?;
            return Ok(Action::await_change());
        }

        if let Some(cluster) = self.ctx.cluster_for(&vm)? {
            if cluster.spec.paused {
                info!("Cluster {} is paused, skipping VM {}", cluster.name(), key);
                return Ok(Action::await_change());
            }
        }

        let mut vm = PatchHelper::new(self.ctx.store.clone(), vm);
        let outcome = if vm.is_deleting() {
            self.reconcile_delete(&mut vm).await
        } else {
            self.reconcile_normal(&mut vm).await
        };
        vm.status.conditions.set_summary(&[
            conditions::VCENTER_AVAILABLE,
            conditions::IP_ADDRESS_CLAIMED,
            conditions::VM_PROVISIONED,
        ]);
        vm.finish(outcome)
    }

    fn map_event(&self, event: &ResourceEvent) -> Vec<ResourceKey> {
        let namespace = &event.resource_key.namespace;
        if event.gvk == self.kind() {
            vec![event.resource_key.clone()]
        } else if event.gvk == IPAddressClaim::gvk() {
            event
                .owners()
                .into_iter()
                .filter(|(kind, _)| kind == VSphereVM::KIND)
                .map(|(_, name)| VSphereVM::key_for(namespace, &name))
                .collect()
        } else if event.gvk == Cluster::gvk() {
            // Unpausing a cluster resumes its VMs
            let params = ListParams::in_namespace(namespace.clone())
                .with_label(CLUSTER_NAME_LABEL, event.resource_key.name.clone());
            match self.ctx.store.list::<VSphereVM>(&params) {
                Ok(vms) => vms
                    .iter()
                    .map(|vm| VSphereVM::key_for(vm.namespace(), vm.name()))
                    .collect(),
                Err(e) => {
                    debug!("Failed to list VMs of {}: {}", event.resource_key, e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        }
    }
}
