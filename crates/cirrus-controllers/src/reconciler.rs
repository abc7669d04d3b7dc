use crate::error::Result;
use async_trait::async_trait;
use cirrus_core::{GroupVersionKind, ResourceEvent, ResourceKey};
use std::time::Duration;

/// What the runner should do with a key after a successful pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `delay` even if nothing changes
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// Wait for the next watch event or resync
    pub fn await_change() -> Self {
        Self::default()
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// One kind's reconcile logic, driven by a [`crate::Controller`]
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Kind whose keys this reconciler receives
    fn kind(&self) -> GroupVersionKind;

    async fn reconcile(&self, key: &ResourceKey) -> Result<Action>;

    /// Keys of this reconciler's kind affected by a store event.
    ///
    /// The default maps events of the reconciled kind to their own key.
    fn map_event(&self, event: &ResourceEvent) -> Vec<ResourceKey> {
        if event.gvk == self.kind() {
            vec![event.resource_key.clone()]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action() {
        assert_eq!(Action::await_change().requeue_after(), None);
        assert_eq!(
            Action::requeue(Duration::from_secs(10)).requeue_after(),
            Some(Duration::from_secs(10))
        );
    }
}
