//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use orderflow_fulfillment::FulfillmentService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub fulfillment: Arc<FulfillmentService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let fulfillment = FulfillmentService::from_env(pool.clone())?;
        tracing::info!("Fulfillment service initialized");

        Ok(Self {
            pool,
            config,
            fulfillment: Arc::new(fulfillment),
        })
    }
}
