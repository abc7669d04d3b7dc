use crate::cluster::ClusterReconciler;
use crate::context::Context;
use crate::deployment_zone::ZoneReconciler;
use crate::identity::IdentityReconciler;
use crate::runner::Controller;
use crate::vm::VmReconciler;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs one [`Controller`] per reconciled kind against a shared [`Context`]
pub struct Manager {
    controllers: Vec<Controller>,
}

impl Manager {
    pub fn new(ctx: Arc<Context>) -> Self {
        let store = ctx.store.clone();
        let config = ctx.config.clone();
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();

        let controllers = vec![
            Controller::new(
                Arc::new(IdentityReconciler::new(ctx.clone())),
                store.clone(),
                config.clone(),
            ),
            Controller::new(
                Arc::new(VmReconciler::new(ctx.clone())),
                store.clone(),
                config.clone(),
            ),
            Controller::new(
                Arc::new(ZoneReconciler::new(ctx.clone())),
                store.clone(),
                config.clone(),
            ),
            Controller::new(
                Arc::new(ClusterReconciler::new(ctx, trigger_tx)),
                store,
                config,
            )
            .with_triggers(trigger_rx),
        ];

        Self { controllers }
    }

    /// Run every controller until the token is cancelled
    pub async fn run(self, token: CancellationToken) {
        info!("Starting {} controllers", self.controllers.len());
        join_all(
            self.controllers
                .into_iter()
                .map(|controller| controller.run(token.clone())),
        )
        .await;
        info!("All controllers stopped");
    }
}
