//! Label keys and finalizer names shared between reconcilers.

/// Label carrying the name of the owning cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label marking a machine as part of the control plane
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

pub const CLUSTER_FINALIZER: &str = "vspherecluster.infrastructure.cluster.x-k8s.io";
pub const VM_FINALIZER: &str = "vspherevm.infrastructure.cluster.x-k8s.io";
pub const DEPLOYMENT_ZONE_FINALIZER: &str = "vspheredeploymentzone.infrastructure.cluster.x-k8s.io";

/// Keeps an IP address claim around until its VM is gone
pub const IP_CLAIM_FINALIZER: &str =
    "vspherevm.infrastructure.cluster.x-k8s.io/ip-claim-protection";

/// Set on identity secrets bound to a cluster
pub const SECRET_IDENTITY_FINALIZER: &str = "vspherecluster/infrastructure.cluster.x-k8s.io";

/// Earlier spelling of the identity secret finalizer, still released on delete
pub const LEGACY_IDENTITY_FINALIZER: &str = "identity/infrastructure.cluster.x-k8s.io";

/// Prefix distinguishing the control-plane cluster module key from worker groups
pub const CONTROL_PLANE_MODULE_PREFIX: &str = "control-plane/";

/// Held by a cluster-scoped identity and its secret until the identity is deleted
pub const IDENTITY_FINALIZER: &str = "vsphereclusteridentity.infrastructure.cluster.x-k8s.io";
