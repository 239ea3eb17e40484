//! Application state

use std::sync::Arc;

use registry_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: BillingService) -> Self {
        Self {
            pool,
            config,
            billing: Arc::new(billing),
        }
    }

    /// Where provider-hosted pages send the user back to
    pub fn organization_billing_url(&self, org_id: uuid::Uuid) -> String {
        format!(
            "{}/organizations/{}/billing",
            self.config.app_base_url, org_id
        )
    }
}
