use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::Warehouse;
use crate::metrics::AppMetrics;
use crate::state::SharedState;

/// Shared application context passed to HTTP handlers and pollers.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub warehouse: Arc<dyn Warehouse>,
    pub metrics: AppMetrics,
    pub state: SharedState,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        warehouse: Arc<dyn Warehouse>,
        metrics: AppMetrics,
        state: SharedState,
    ) -> Self {
        Self {
            config: Arc::new(config),
            warehouse,
            metrics,
            state,
        }
    }

    pub fn account(&self) -> &str {
        &self.config.warehouse.account
    }
}
