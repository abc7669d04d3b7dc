//! Snapshot-and-patch wrapper around an object under reconciliation.
//!
//! [`PatchHelper`] remembers the object as loaded and hands out the working
//! copy through `Deref`/`DerefMut`. [`PatchHelper::finish`] writes the
//! difference back and folds a failed write into the reconcile result. If the
//! helper is dropped without `finish` (an early return through `?`, a panic,
//! or a cancelled future) the difference is still written from `Drop`.

use crate::error::{ReconcileError, Result};
use crate::reconciler::Action;
use cirrus_core::Resource;
use cirrus_storage::ObjectStore;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, error};

pub struct PatchHelper<T: Resource> {
    store: Arc<ObjectStore>,
    before: T,
    current: T,
    saved: bool,
}

impl<T: Resource> PatchHelper<T> {
    pub fn new(store: Arc<ObjectStore>, object: T) -> Self {
        Self {
            store,
            before: object.clone(),
            current: object,
            saved: false,
        }
    }

    /// Persist the changes and merge the outcome of the write into `outcome`
    pub fn finish(mut self, outcome: Result<Action>) -> Result<Action> {
        self.saved = true;
        match self.persist() {
            Ok(()) => outcome,
            Err(patch_err) => match outcome {
                Ok(_) => Err(patch_err),
                Err(err) => Err(ReconcileError::aggregate(vec![err, patch_err])),
            },
        }
    }

    fn persist(&mut self) -> Result<()> {
        let key = T::key_for(self.current.namespace(), self.current.name());
        match self.store.patch_diff(&self.before, &self.current) {
            Ok(stored) => {
                self.before = stored.clone();
                self.current = stored;
                Ok(())
            }
            // Removed once its last finalizer went away
            Err(e) if e.is_not_found() => {
                debug!("{} is gone, nothing to patch", key);
                Ok(())
            }
            Err(e) => Err(ReconcileError::patch(key.to_string(), e)),
        }
    }
}

impl<T: Resource> Deref for PatchHelper<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.current
    }
}

impl<T: Resource> DerefMut for PatchHelper<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.current
    }
}

impl<T: Resource> Drop for PatchHelper<T> {
    fn drop(&mut self) {
        if self.saved {
            return;
        }
        if let Err(e) = self.persist() {
            error!("Failed to save {} on early exit: {}", T::KIND, e);
        }
    }
}
