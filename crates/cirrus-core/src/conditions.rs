//! Named status conditions and their aggregation.
//!
//! Conditions are stored per object in an ordered map keyed by condition type.
//! On the wire they keep the familiar list shape. A summary condition (`Ready`)
//! is recomputed from the individual ones at the end of every reconcile pass by
//! the pure [`summarize`] function.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Summary condition type
pub const READY: &str = "Ready";
/// A session to the platform endpoint could be established
pub const VCENTER_AVAILABLE: &str = "VCenterAvailable";
/// Every IP address claim of a VM is bound
pub const IP_ADDRESS_CLAIMED: &str = "IPAddressClaimed";
/// The VM exists on the platform and reported its addresses
pub const VM_PROVISIONED: &str = "VMProvisioned";
/// Anti-affinity groupings are in place
pub const CLUSTER_MODULES_AVAILABLE: &str = "ClusterModulesAvailable";
/// The failure domain map of a cluster was computed
pub const FAILURE_DOMAINS_AVAILABLE: &str = "FailureDomainsAvailable";
/// Resource pool and folder of a deployment zone exist
pub const PLACEMENT_CONSTRAINT_MET: &str = "PlacementConstraintMet";
/// Tags and topology of the referenced failure domain are valid
pub const FAILURE_DOMAIN_VALIDATED: &str = "VSphereFailureDomainValidated";
/// The secret behind an identity exists and carries usable credentials
pub const CREDENTIALS_AVAILABLE: &str = "CredentialsAvailable";

/// Condition reasons shared across reconcilers
pub mod reasons {
    pub const VCENTER_UNREACHABLE: &str = "VCenterUnreachable";
    pub const DELETING: &str = "Deleting";
    pub const DELETION_FAILED: &str = "DeletionFailed";

    pub const WAITING_FOR_STATIC_IP_ALLOCATION: &str = "WaitingForStaticIPAllocation";
    pub const WAITING_FOR_IP_ALLOCATION: &str = "WaitingForIPAllocation";
    pub const PROVISIONING: &str = "Provisioning";
    pub const PROVISIONING_FAILED: &str = "ProvisioningFailed";
    pub const NOT_FOUND: &str = "NotFound";
    pub const MISSING_BIOS_UUID: &str = "MissingBiosUUID";

    pub const IP_ADDRESS_CLAIMS_BEING_CREATED: &str = "IPAddressClaimsBeingCreated";
    pub const WAITING_FOR_IP_ADDRESS: &str = "WaitingForIPAddress";
    pub const IP_ADDRESS_CLAIM_ERROR: &str = "IPAddressClaimError";

    pub const CLUSTER_MODULE_SETUP_FAILED: &str = "ClusterModuleSetupFailed";
    pub const MISSING_VCENTER_VERSION: &str = "MissingVCenterVersion";
    pub const VCENTER_VERSION_INCOMPATIBLE: &str = "VCenterVersionIncompatible";

    pub const WAITING_FOR_FAILURE_DOMAIN_STATUS: &str = "WaitingForFailureDomainStatus";
    pub const FAILURE_DOMAINS_SKIPPED: &str = "FailureDomainsSkipped";

    pub const RESOURCE_POOL_NOT_FOUND: &str = "ResourcePoolNotFound";
    pub const FOLDER_NOT_FOUND: &str = "FolderNotFound";
    pub const FAILURE_DOMAIN_NOT_FOUND: &str = "VSphereFailureDomainNotFound";
    pub const REGION_MISCONFIGURED: &str = "RegionMisconfigured";
    pub const ZONE_MISCONFIGURED: &str = "ZoneMisconfigured";
    pub const COMPUTE_CLUSTER_NOT_FOUND: &str = "ComputeClusterNotFound";
    pub const RESOURCE_POOL_NOT_OWNED: &str = "ResourcePoolNotOwnedByComputeCluster";
    pub const DATASTORE_NOT_FOUND: &str = "DatastoreNotFound";
    pub const NETWORK_NOT_FOUND: &str = "NetworkNotFound";
    pub const HOSTS_MISCONFIGURED: &str = "HostsMisconfigured";
    pub const HOSTS_AFFINITY_MISCONFIGURED: &str = "HostsAffinityMisconfigured";
    pub const DEPLOYMENT_ZONE_IN_USE: &str = "DeploymentZoneInUse";

    pub const SECRET_NOT_AVAILABLE: &str = "SecretNotAvailable";
    pub const SECRET_ALREADY_IN_USE: &str = "SecretAlreadyInUse";
    pub const IDENTITY_NOT_ALLOWED: &str = "IdentityNotAllowed";
    pub const IDENTITY_NOT_READY: &str = "IdentityNotReady";
}

/// Tri-state status of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How bad a `False` condition is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConditionSeverity {
    #[default]
    #[serde(rename = "")]
    None,
    Info,
    Warning,
    Error,
}

impl ConditionSeverity {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// A single named status predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "ConditionSeverity::is_none")]
    pub severity: ConditionSeverity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn true_condition(type_: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::True,
            severity: ConditionSeverity::None,
            reason: String::new(),
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn false_condition(
        type_: impl Into<String>,
        reason: impl Into<String>,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::False,
            severity,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn unknown_condition(
        type_: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::Unknown,
            severity: ConditionSeverity::None,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False
    }

    /// Same observable state, ignoring the transition time
    fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }

    /// Merge priority: false conditions by decreasing severity, then true, then unknown
    fn merge_priority(&self) -> u8 {
        match (self.status, self.severity) {
            (ConditionStatus::False, ConditionSeverity::Error) => 0,
            (ConditionStatus::False, ConditionSeverity::Warning) => 1,
            (ConditionStatus::False, ConditionSeverity::Info) => 2,
            (ConditionStatus::False, ConditionSeverity::None) => 3,
            (ConditionStatus::True, _) => 4,
            (ConditionStatus::Unknown, _) => 5,
        }
    }
}

/// Ordered set of conditions keyed by type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions(BTreeMap<String, Condition>);

impl From<Vec<Condition>> for Conditions {
    fn from(list: Vec<Condition>) -> Self {
        Self(list.into_iter().map(|c| (c.type_.clone(), c)).collect())
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(conditions: Conditions) -> Self {
        conditions.0.into_values().collect()
    }
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.get(type_)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.values()
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).is_some_and(Condition::is_true)
    }

    pub fn is_false(&self, type_: &str) -> bool {
        self.get(type_).is_some_and(Condition::is_false)
    }

    /// Insert or replace a condition. The previous transition time survives
    /// when nothing observable changed.
    pub fn set(&mut self, mut condition: Condition) {
        if let Some(existing) = self.0.get(&condition.type_) {
            if existing.same_state(&condition) {
                condition.last_transition_time = existing.last_transition_time;
            }
        }
        self.0.insert(condition.type_.clone(), condition);
    }

    pub fn mark_true(&mut self, type_: &str) {
        self.set(Condition::true_condition(type_));
    }

    pub fn mark_false(
        &mut self,
        type_: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) {
        self.set(Condition::false_condition(type_, reason, severity, message));
    }

    pub fn mark_unknown(&mut self, type_: &str, reason: &str, message: impl Into<String>) {
        self.set(Condition::unknown_condition(type_, reason, message));
    }

    pub fn remove(&mut self, type_: &str) -> Option<Condition> {
        self.0.remove(type_)
    }

    /// Recompute the `Ready` summary from the given condition types
    pub fn set_summary(&mut self, types: &[&str]) {
        match summarize(self, types) {
            Some(summary) => self.set(summary),
            None => {
                self.remove(READY);
            }
        }
    }
}

/// Compute the `Ready` summary of `types` within `conditions`.
///
/// Missing conditions are ignored; `None` means none of the listed conditions
/// is present and the summary should be cleared.
pub fn summarize(conditions: &Conditions, types: &[&str]) -> Option<Condition> {
    let selected: Vec<&Condition> = types
        .iter()
        .filter(|t| **t != READY)
        .filter_map(|t| conditions.get(t))
        .collect();
    merge(READY, &selected, false)
}

/// Aggregate the `Ready` conditions of several source objects into one
/// condition of `type_`, with an "N of M completed" step counter while not
/// every source is ready.
pub fn aggregate(type_: &str, sources: &[&Condition]) -> Option<Condition> {
    merge(type_, sources, true)
}

fn merge(type_: &str, sources: &[&Condition], step_counter: bool) -> Option<Condition> {
    let top = sources.iter().min_by_key(|c| c.merge_priority())?;

    if top.is_true() {
        return Some(Condition::true_condition(type_));
    }

    let message = if step_counter {
        let completed = sources.iter().filter(|c| c.is_true()).count();
        format!("{} of {} completed", completed, sources.len())
    } else {
        top.message.clone()
    };

    Some(match top.status {
        ConditionStatus::False => {
            Condition::false_condition(type_, top.reason.clone(), top.severity, message)
        }
        _ => Condition::unknown_condition(type_, top.reason.clone(), message),
    })
}
