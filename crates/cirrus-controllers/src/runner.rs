//! Drives one reconciler from store events, triggers and periodic resyncs.

use crate::config::ControllerConfig;
use crate::queue::{Completion, WorkQueue};
use crate::reconciler::Reconciler;
use cirrus_core::ResourceKey;
use cirrus_storage::ObjectStore;
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work queue and worker pool around one [`Reconciler`]
pub struct Controller {
    reconciler: Arc<dyn Reconciler>,
    store: Arc<ObjectStore>,
    config: ControllerConfig,
    triggers: Option<mpsc::UnboundedReceiver<ResourceKey>>,
}

impl Controller {
    pub fn new(
        reconciler: Arc<dyn Reconciler>,
        store: Arc<ObjectStore>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler,
            store,
            config,
            triggers: None,
        }
    }

    /// Also reconcile keys sent on this channel
    pub fn with_triggers(mut self, triggers: mpsc::UnboundedReceiver<ResourceKey>) -> Self {
        self.triggers = Some(triggers);
        self
    }

    /// Run until the token is cancelled, then wait for in-flight passes
    pub async fn run(mut self, token: CancellationToken) {
        let name = self.reconciler.name();
        let workers = self.config.workers.max(1);
        info!(
            "Starting {} controller (workers: {}, resync: {:?})",
            name, workers, self.config.resync_period
        );

        let mut events = self.store.subscribe();
        let mut triggers = self.triggers.take();
        let mut queue = WorkQueue::new(self.config.base_backoff, self.config.max_backoff);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<(ResourceKey, Completion)> = JoinSet::new();
        // The first tick fires immediately and loads every existing object
        let mut resync = tokio::time::interval(self.config.resync_period);

        loop {
            while queue.has_ready() {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let Some(key) = queue.pop() else {
                    break;
                };
                let reconciler = self.reconciler.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let completion = reconcile_key(reconciler.as_ref(), &key).await;
                    (key, completion)
                });
            }
            let deadline = queue.next_deadline();

            tokio::select! {
                _ = token.cancelled() => {
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        for key in self.reconciler.map_event(&event) {
                            queue.add(key);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("{} controller missed {} events, resyncing", name, missed);
                        self.enqueue_all(&mut queue);
                    }
                    Err(RecvError::Closed) => {
                        warn!("Event stream closed, stopping {} controller", name);
                        break;
                    }
                },
                key = next_trigger(&mut triggers) => {
                    debug!("{} controller triggered for {}", name, key);
                    queue.add(key);
                }
                _ = resync.tick() => {
                    self.enqueue_all(&mut queue);
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok((key, completion)) => queue.done(key, completion, Instant::now()),
                    Err(e) => error!("{} worker task failed: {}", name, e),
                },
                _ = sleep_until(deadline) => {}
            }

            queue.promote_due(Instant::now());
        }

        info!(
            "Stopping {} controller, waiting for {} in-flight reconciles",
            name,
            tasks.len()
        );
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("{} worker task failed: {}", name, e);
            }
        }
    }

    /// Queue every stored object of the reconciled kind
    fn enqueue_all(&self, queue: &mut WorkQueue) {
        let gvk = self.reconciler.kind();
        let values = match self.store.list_values(&gvk, None, &BTreeMap::new(), None) {
            Ok(values) => values,
            Err(e) => {
                error!("Failed to list {} for resync: {}", gvk.kind, e);
                return;
            }
        };
        debug!("Resyncing {} {} objects", values.len(), gvk.kind);
        for value in values {
            let metadata = value.get("metadata");
            let field = |name: &str| {
                metadata
                    .and_then(|m| m.get(name))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let name = field("name");
            if name.is_empty() {
                continue;
            }
            queue.add(ResourceKey::new(gvk.clone(), field("namespace"), name));
        }
    }
}

/// One reconcile pass, mapped to what the queue should do next
async fn reconcile_key(reconciler: &dyn Reconciler, key: &ResourceKey) -> Completion {
    let started = Instant::now();
    let result = AssertUnwindSafe(reconciler.reconcile(key))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(action)) => {
            debug!("Reconciled {} in {:?}", key, started.elapsed());
            Completion::Done {
                requeue_after: action.requeue_after(),
            }
        }
        Ok(Err(e)) if e.is_terminal() => {
            warn!("Reconcile of {} needs attention: {}", key, e);
            Completion::Terminal
        }
        Ok(Err(e)) => {
            error!("Reconcile of {} failed: {}", key, e);
            Completion::Failed
        }
        Err(_) => {
            error!("Reconcile of {} panicked", key);
            Completion::Failed
        }
    }
}

async fn next_trigger(triggers: &mut Option<mpsc::UnboundedReceiver<ResourceKey>>) -> ResourceKey {
    if let Some(rx) = triggers.as_mut() {
        if let Some(key) = rx.recv().await {
            return key;
        }
        *triggers = None;
    }
    std::future::pending().await
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
