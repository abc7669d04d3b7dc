use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Tracks which clusters have a control-plane poller running
#[derive(Debug, Clone, Default)]
pub struct PollerRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the poller slot for a cluster uid. Returns `None` while another
    /// poller for the same uid is alive.
    pub fn try_acquire(&self, uid: &str) -> Option<PollerGuard> {
        if !self.active.lock().insert(uid.to_string()) {
            return None;
        }
        Some(PollerGuard {
            active: self.active.clone(),
            uid: uid.to_string(),
        })
    }

    pub fn is_active(&self, uid: &str) -> bool {
        self.active.lock().contains(uid)
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

/// Holds a poller slot; dropping it frees the slot
#[derive(Debug)]
pub struct PollerGuard {
    active: Arc<Mutex<HashSet<String>>>,
    uid: String,
}

impl PollerGuard {
    pub fn uid(&self) -> &str {
        &self.uid
    }
}

impl Drop for PollerGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.uid);
    }
}
