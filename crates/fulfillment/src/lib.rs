// Fulfillment crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // FulfillmentError carries context strings
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! OrderFlow Fulfillment Module
//!
//! Turns verified payment-processor events into the records and side effects
//! an order implies.
//!
//! ## Features
//!
//! - **Webhook Gate**: HMAC-verified ingestion of processor events
//! - **Idempotency Ledger**: Natural-key inserts so replays are no-ops
//! - **Referral Commissions**: First-payment commissions with tiered rates
//! - **Download Grants**: Tokenized, expiring access to digital products
//! - **Dropship Dispatch**: Physical orders forwarded to Printify
//! - **Membership Seats**: One seat grant per membership checkout
//! - **Audit Trail**: Append-only per-order action log
//! - **Replay**: Failed and stuck events reprocessed by the worker

pub mod audit;
pub mod client;
pub mod commission;
pub mod directory;
pub mod dispatch;
pub mod downloads;
pub mod dropship;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod membership;
pub mod notify;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Audit
pub use audit::{ActionLogBuilder, ActionLogEntry, ActionLogger, ActionStatus, ActionType};

// Client
pub use client::{StripeClient, StripeConfig};

// Commission
pub use commission::{commission_amount_cents, tier_for, CommissionResolver};

// Directory
pub use directory::{Directory, PgDirectory};

// Dispatch
pub use dispatch::{partition_items, FulfillmentDispatcher, ItemPartition, ADAPTER_TIMEOUT};

// Downloads
pub use downloads::{
    DownloadGrantIssuer, IssuedGrant, GRANT_MAX_USES, GRANT_VALID_DAYS, TOKEN_BYTES,
};

// Dropship
pub use dropship::{
    DropshipProvider, FulfillmentItem, FulfillmentRequest, PrintifyConfig, PrintifyProvider,
};

// Error
pub use error::{FulfillmentError, FulfillmentResult};

// Gateway
pub use gateway::{CheckoutSnapshot, LineItem, ProcessorGateway, ShippingAddress, StripeGateway};

// Ledger
pub use ledger::{
    EffectLedger, IdempotencyLedger, LedgerOutcome, NewCommission, NewDownloadGrant,
    NewFulfillmentOrder,
};

// Membership
pub use membership::MembershipService;

// Notify
pub use notify::NotificationService;

// Webhooks
pub use webhooks::{
    spawn_detached, verify_and_parse, EventKind, EventOutcome, PaymentEvent, ReplaySummary,
    WebhookHandler, SIGNATURE_TOLERANCE_SECS,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main fulfillment service that combines all event-processing functionality.
pub struct FulfillmentService {
    pub webhooks: Arc<WebhookHandler>,
}

impl FulfillmentService {
    /// Create a new fulfillment service from environment variables.
    pub fn from_env(pool: PgPool) -> FulfillmentResult<Self> {
        let stripe = StripeClient::from_env()?;
        let printify = PrintifyProvider::new(PrintifyConfig::from_env()?);
        Ok(Self::assemble(stripe, Arc::new(printify), pool))
    }

    /// Create a new fulfillment service with explicit config.
    pub fn new(
        config: StripeConfig,
        provider: Arc<dyn DropshipProvider>,
        pool: PgPool,
    ) -> Self {
        Self::assemble(StripeClient::new(config), provider, pool)
    }

    fn assemble(stripe: StripeClient, provider: Arc<dyn DropshipProvider>, pool: PgPool) -> Self {
        let webhook_secret = stripe.config().webhook_secret.clone();
        let annual_threshold = stripe.config().annual_amount_threshold_cents;
        let gateway: Arc<dyn ProcessorGateway> = Arc::new(StripeGateway::new(stripe));
        let notify = NotificationService::from_env();

        let commission = CommissionResolver::new(
            pool.clone(),
            gateway.clone(),
            notify.clone(),
            annual_threshold,
        );
        let dispatcher = FulfillmentDispatcher::new(pool.clone(), provider, notify.clone());
        let membership = MembershipService::new(pool.clone(), notify);

        Self {
            webhooks: Arc::new(WebhookHandler::new(
                webhook_secret,
                pool,
                gateway,
                commission,
                dispatcher,
                membership,
            )),
        }
    }
}
