//! IP address claims of a VM.
//!
//! One claim per (device, pool reference) is created or brought back in line
//! with the VM: owner reference, protection finalizer, cluster label and pool.
//! The `IPAddressClaimed` condition on the VM summarizes them. Claims that
//! report a `Ready` condition are aggregated directly; as soon as one claim
//! lacks it, the whole pass falls back to counting fulfilled claims.

use crate::error::{ReconcileError, Result};
use cirrus_core::conditions::{self, reasons};
use cirrus_core::well_known::{CLUSTER_NAME_LABEL, IP_CLAIM_FINALIZER};
use cirrus_core::{
    Condition, ConditionSeverity, IPAddress, IPAddressClaim, OwnerReference, Resource,
    TypedLocalRef, VSphereVM,
};
use cirrus_platform::BoundAddress;
use cirrus_storage::{ListParams, ObjectStore};
use tracing::{debug, info};

/// Create or patch the claims of `vm` and return the addresses bound so far
pub fn reconcile_claims(store: &ObjectStore, vm: &mut VSphereVM) -> Result<Vec<BoundAddress>> {
    let requests: Vec<(usize, usize, TypedLocalRef)> = vm
        .spec
        .network
        .devices
        .iter()
        .enumerate()
        .flat_map(|(device_idx, device)| {
            device
                .addresses_from_pools
                .iter()
                .enumerate()
                .map(move |(pool_idx, pool)| (device_idx, pool_idx, pool.clone()))
        })
        .collect();

    if requests.is_empty() {
        vm.status.conditions.remove(conditions::IP_ADDRESS_CLAIMED);
        return Ok(Vec::new());
    }

    let owner = vm.owner_reference(true)?;
    let cluster_name = vm.label(CLUSTER_NAME_LABEL).map(str::to_string);

    let total = requests.len();
    let mut created = 0;
    let mut fulfilled = 0;
    let mut claims: Vec<(usize, IPAddressClaim)> = Vec::with_capacity(total);
    let mut errors = Vec::new();

    for (device_idx, pool_idx, pool_ref) in requests {
        let name = IPAddressClaim::name_for(vm.name(), device_idx, pool_idx);
        match create_or_patch_claim(
            store,
            vm.namespace(),
            &name,
            &owner,
            cluster_name.as_deref(),
            pool_ref,
        ) {
            Ok((claim, was_created)) => {
                if was_created {
                    created += 1;
                }
                if claim.is_fulfilled() {
                    fulfilled += 1;
                }
                claims.push((device_idx, claim));
            }
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        let err = ReconcileError::aggregate(errors);
        vm.status.conditions.mark_false(
            conditions::IP_ADDRESS_CLAIMED,
            reasons::IP_ADDRESS_CLAIM_ERROR,
            ConditionSeverity::Error,
            err.to_string(),
        );
        return Err(err);
    }

    let readiness: Vec<&Condition> = claims
        .iter()
        .filter_map(|(_, c)| c.status.conditions.get(conditions::READY))
        .collect();

    let aggregated = if readiness.len() == claims.len() {
        conditions::aggregate(conditions::IP_ADDRESS_CLAIMED, &readiness)
    } else {
        None
    };

    match aggregated {
        Some(condition) => vm.status.conditions.set(condition),
        None if fulfilled == total => vm
            .status
            .conditions
            .mark_true(conditions::IP_ADDRESS_CLAIMED),
        None if created > 0 => vm.status.conditions.mark_false(
            conditions::IP_ADDRESS_CLAIMED,
            reasons::IP_ADDRESS_CLAIMS_BEING_CREATED,
            ConditionSeverity::Info,
            format!("{}/{} claims being created", created, total),
        ),
        None => vm.status.conditions.mark_false(
            conditions::IP_ADDRESS_CLAIMED,
            reasons::WAITING_FOR_IP_ADDRESS,
            ConditionSeverity::Info,
            format!("{}/{} claims being processed", total - fulfilled, total),
        ),
    }

    bound_addresses(store, vm.namespace(), &claims)
}

fn create_or_patch_claim(
    store: &ObjectStore,
    namespace: &str,
    name: &str,
    owner: &OwnerReference,
    cluster_name: Option<&str>,
    pool_ref: TypedLocalRef,
) -> Result<(IPAddressClaim, bool)> {
    let existing = store.get_opt::<IPAddressClaim>(namespace, name)?;
    let mut desired = existing.clone().unwrap_or_else(|| {
        let mut claim = IPAddressClaim::default();
        claim.metadata.name = Some(name.to_string());
        claim.metadata.namespace = Some(namespace.to_string());
        claim
    });

    desired.set_owner_reference(owner.clone());
    desired.add_finalizer(IP_CLAIM_FINALIZER);
    if let Some(cluster) = cluster_name {
        desired.set_label(CLUSTER_NAME_LABEL, cluster);
    }
    desired.spec.pool_ref = pool_ref;

    match existing {
        None => {
            info!("Created IPAddressClaim {}/{}", namespace, name);
            Ok((store.create(desired)?, true))
        }
        Some(current) => {
            let claim = store.patch_diff(&current, &desired)?;
            debug!("Patched IPAddressClaim {}/{}", namespace, name);
            Ok((claim, false))
        }
    }
}

fn bound_addresses(
    store: &ObjectStore,
    namespace: &str,
    claims: &[(usize, IPAddressClaim)],
) -> Result<Vec<BoundAddress>> {
    let mut bound = Vec::new();
    for (device_index, claim) in claims {
        let Some(address_ref) = claim
            .status
            .address_ref
            .as_ref()
            .filter(|r| !r.name.is_empty())
        else {
            continue;
        };
        match store.get_opt::<IPAddress>(namespace, &address_ref.name)? {
            Some(address) => bound.push(BoundAddress {
                device_index: *device_index,
                address: address.cidr(),
                gateway: address.spec.gateway.clone(),
            }),
            None => debug!(
                "IPAddress {}/{} of claim {} not found yet",
                namespace,
                address_ref.name,
                claim.name()
            ),
        }
    }
    Ok(bound)
}

/// Drop the protection finalizer from every claim owned by `vm` and delete them
pub fn release_claims(store: &ObjectStore, vm: &VSphereVM) -> Result<()> {
    let Some(uid) = vm.uid() else {
        return Ok(());
    };
    let claims =
        store.list::<IPAddressClaim>(&ListParams::in_namespace(vm.namespace()).owned_by(uid))?;

    for claim in claims {
        let mut released = claim.clone();
        if released.remove_finalizer(IP_CLAIM_FINALIZER) {
            store.patch_diff(&claim, &released)?;
        }
        match store.delete::<IPAddressClaim>(claim.namespace(), claim.name()) {
            Ok(()) => info!(
                "Deleted IPAddressClaim {}/{}",
                claim.namespace(),
                claim.name()
            ),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
