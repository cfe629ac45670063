use std::sync::Arc;

use uuid::Uuid;

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::engine::lifecycle::{LifecycleController, SyncContext};
use crate::observability::metrics::Metrics;

pub struct AppState {
    pub controller: LifecycleController,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(backend: Arc<dyn Backend>, courier_id: Uuid, sync: SyncConfig) -> Self {
        let metrics = Metrics::new();
        let ctx = SyncContext::new(backend, courier_id, sync, metrics.clone());

        Self {
            controller: LifecycleController::new(ctx),
            metrics,
        }
    }
}
