//! Stripe client wrapper and configuration
//!
//! Constructed once at process start and injected into every component, so
//! the processor boundary stays swappable with fakes in tests.

use crate::error::{FulfillmentError, FulfillmentResult};

/// Processor configuration, environment-provided.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// API secret key (`sk_...`).
    pub secret_key: String,
    /// Webhook signing secret (`whsec_...`).
    pub webhook_secret: String,
    /// Price id that identifies annual subscriptions for tier resolution.
    pub annual_price_id: String,
    /// Amounts at or above this classify as annual plans.
    pub annual_amount_threshold_cents: i64,
}

impl StripeConfig {
    pub fn from_env() -> FulfillmentResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| FulfillmentError::Internal("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| FulfillmentError::Internal("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let annual_price_id = std::env::var("STRIPE_ANNUAL_PRICE_ID").unwrap_or_default();
        let annual_amount_threshold_cents = std::env::var("ANNUAL_AMOUNT_THRESHOLD_CENTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15_000);

        Ok(Self {
            secret_key,
            webhook_secret,
            annual_price_id,
            annual_amount_threshold_cents,
        })
    }
}

/// Shared Stripe API client.
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> FulfillmentResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
