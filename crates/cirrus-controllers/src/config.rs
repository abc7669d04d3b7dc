use std::time::Duration;

/// Settings shared by every reconciler and the runner
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Create cluster modules (anti-affinity groups) for machine groups
    pub enable_anti_affinity: bool,
    /// Namespace holding the secrets of cluster-scoped identities
    pub controller_namespace: String,
    /// Concurrent reconciles per kind
    pub workers: usize,
    /// Delay for the fixed "check again later" requeues
    pub requeue_after: Duration,
    /// Every object of a kind is re-enqueued this often
    pub resync_period: Duration,
    /// Interval of the control-plane readiness poller
    pub poll_interval: Duration,
    /// The poller gives up after this long
    pub poll_timeout: Duration,
    /// First retry delay after a failed reconcile
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enable_anti_affinity: false,
            controller_namespace: "capv-system".to_string(),
            workers: 4,
            requeue_after: Duration::from_secs(10),
            resync_period: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(15 * 60),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}
