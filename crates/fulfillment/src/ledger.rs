//! Idempotency ledger
//!
//! Every side effect the orchestrator produces is recorded under a natural
//! key with `INSERT ... ON CONFLICT DO NOTHING RETURNING id`. The returned
//! row tells us whether this delivery of the event created the effect or a
//! previous delivery already did, which is what makes replays safe.
//!
//! The operations live behind [`EffectLedger`] so the resolvers can be
//! exercised against an in-memory fake; [`IdempotencyLedger`] is the
//! Postgres implementation used in production.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use orderflow_shared::types::{CommissionTier, PlanType};

use crate::error::FulfillmentResult;

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// This delivery created the effect.
    Created(Uuid),
    /// A previous delivery already recorded it; do not repeat the effect.
    AlreadyRecorded,
}

impl LedgerOutcome {
    /// Map the `RETURNING id` row of an `ON CONFLICT DO NOTHING` insert.
    pub fn from_returned(id: Option<Uuid>) -> Self {
        match id {
            Some(id) => Self::Created(id),
            None => Self::AlreadyRecorded,
        }
    }

    pub fn created(&self) -> Option<Uuid> {
        match self {
            Self::Created(id) => Some(*id),
            Self::AlreadyRecorded => None,
        }
    }
}

/// A commission to record for a referrer's first subscription payment.
#[derive(Debug, Clone)]
pub struct NewCommission {
    pub referrer_id: Uuid,
    pub referred_user_id: Uuid,
    pub subscription_id: String,
    pub plan_type: PlanType,
    pub subscription_amount_cents: i64,
    pub commission_amount_cents: i64,
    pub rate_tier: CommissionTier,
}

/// A download grant to record for one (order, product) pair.
#[derive(Debug, Clone)]
pub struct NewDownloadGrant {
    pub order_id: String,
    pub user_id: Option<Uuid>,
    pub product_id: String,
    pub token: String,
    pub file_ids: Vec<Uuid>,
    pub expires_at: OffsetDateTime,
    pub max_uses: i32,
}

/// A physical fulfillment order to record for a checkout session.
#[derive(Debug, Clone)]
pub struct NewFulfillmentOrder {
    pub checkout_session_id: String,
    pub user_id: Option<Uuid>,
    pub shipping_address: serde_json::Value,
    pub line_items: serde_json::Value,
}

/// Idempotent side-effect records, keyed by the natural key of each effect.
#[async_trait]
pub trait EffectLedger: Send + Sync {
    /// At most one commission per referred user; this is the central
    /// correctness property of the payment path.
    async fn insert_commission(&self, commission: &NewCommission)
        -> FulfillmentResult<LedgerOutcome>;

    /// At most one grant per (order, product) pair.
    async fn insert_download_grant(
        &self,
        grant: &NewDownloadGrant,
    ) -> FulfillmentResult<LedgerOutcome>;

    /// At most one provider order row per checkout session.
    async fn insert_fulfillment_order(
        &self,
        order: &NewFulfillmentOrder,
    ) -> FulfillmentResult<LedgerOutcome>;

    /// The recorded order for this checkout if it never reached the
    /// provider, making it eligible for re-dispatch on replay.
    async fn undispatched_fulfillment_order(
        &self,
        checkout_session_id: &str,
    ) -> FulfillmentResult<Option<Uuid>>;

    /// Mark a fulfillment order as accepted by the provider.
    async fn set_external_order_id(
        &self,
        fulfillment_order_id: Uuid,
        external_order_id: &str,
    ) -> FulfillmentResult<()>;

    /// Mark a fulfillment order as failed at the provider.
    async fn mark_fulfillment_failed(&self, fulfillment_order_id: Uuid) -> FulfillmentResult<()>;

    /// At most one seat grant per checkout session.
    async fn insert_seat_grant(
        &self,
        checkout_session_id: &str,
        email: &str,
        user_id: Option<Uuid>,
    ) -> FulfillmentResult<LedgerOutcome>;

    /// At most one usage row per (discount code, checkout session); the
    /// code's usage counter only moves when the row is new.
    async fn record_discount_usage(
        &self,
        discount_code_id: Uuid,
        checkout_session_id: &str,
    ) -> FulfillmentResult<LedgerOutcome>;
}

/// Postgres-backed ledger.
#[derive(Clone)]
pub struct IdempotencyLedger {
    pool: PgPool,
}

impl IdempotencyLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EffectLedger for IdempotencyLedger {
    async fn insert_commission(
        &self,
        commission: &NewCommission,
    ) -> FulfillmentResult<LedgerOutcome> {
        let id = sqlx::query_scalar(
            "INSERT INTO commissions
                 (referrer_id, referred_user_id, subscription_id, plan_type,
                  subscription_amount_cents, commission_amount_cents, rate_tier, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
             ON CONFLICT (referred_user_id) DO NOTHING
             RETURNING id",
        )
        .bind(commission.referrer_id)
        .bind(commission.referred_user_id)
        .bind(&commission.subscription_id)
        .bind(commission.plan_type.as_str())
        .bind(commission.subscription_amount_cents)
        .bind(commission.commission_amount_cents)
        .bind(commission.rate_tier.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(LedgerOutcome::from_returned(id))
    }

    async fn insert_download_grant(
        &self,
        grant: &NewDownloadGrant,
    ) -> FulfillmentResult<LedgerOutcome> {
        let id = sqlx::query_scalar(
            "INSERT INTO download_grants
                 (order_id, user_id, product_id, token, file_ids, expires_at, max_uses)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (order_id, product_id) DO NOTHING
             RETURNING id",
        )
        .bind(&grant.order_id)
        .bind(grant.user_id)
        .bind(&grant.product_id)
        .bind(&grant.token)
        .bind(&grant.file_ids)
        .bind(grant.expires_at)
        .bind(grant.max_uses)
        .fetch_optional(&self.pool)
        .await?;
        Ok(LedgerOutcome::from_returned(id))
    }

    async fn insert_fulfillment_order(
        &self,
        order: &NewFulfillmentOrder,
    ) -> FulfillmentResult<LedgerOutcome> {
        let id = sqlx::query_scalar(
            "INSERT INTO printify_orders
                 (checkout_session_id, user_id, shipping_address, line_items, status)
             VALUES ($1, $2, $3, $4, 'submitted')
             ON CONFLICT (checkout_session_id) DO NOTHING
             RETURNING id",
        )
        .bind(&order.checkout_session_id)
        .bind(order.user_id)
        .bind(&order.shipping_address)
        .bind(&order.line_items)
        .fetch_optional(&self.pool)
        .await?;
        Ok(LedgerOutcome::from_returned(id))
    }

    async fn undispatched_fulfillment_order(
        &self,
        checkout_session_id: &str,
    ) -> FulfillmentResult<Option<Uuid>> {
        let id = sqlx::query_scalar(
            "SELECT id FROM printify_orders
             WHERE checkout_session_id = $1 AND printify_order_id IS NULL",
        )
        .bind(checkout_session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn set_external_order_id(
        &self,
        fulfillment_order_id: Uuid,
        external_order_id: &str,
    ) -> FulfillmentResult<()> {
        sqlx::query(
            "UPDATE printify_orders
             SET printify_order_id = $2, status = 'dispatched', updated_at = NOW()
             WHERE id = $1",
        )
        .bind(fulfillment_order_id)
        .bind(external_order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_fulfillment_failed(
        &self,
        fulfillment_order_id: Uuid,
    ) -> FulfillmentResult<()> {
        sqlx::query(
            "UPDATE printify_orders SET status = 'failed', updated_at = NOW() WHERE id = $1",
        )
        .bind(fulfillment_order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_seat_grant(
        &self,
        checkout_session_id: &str,
        email: &str,
        user_id: Option<Uuid>,
    ) -> FulfillmentResult<LedgerOutcome> {
        let id = sqlx::query_scalar(
            "INSERT INTO seat_grants (checkout_session_id, email, user_id)
             VALUES ($1, $2, $3)
             ON CONFLICT (checkout_session_id) DO NOTHING
             RETURNING id",
        )
        .bind(checkout_session_id)
        .bind(email)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(LedgerOutcome::from_returned(id))
    }

    async fn record_discount_usage(
        &self,
        discount_code_id: Uuid,
        checkout_session_id: &str,
    ) -> FulfillmentResult<LedgerOutcome> {
        let id = sqlx::query_scalar(
            "INSERT INTO discount_usage (discount_code_id, checkout_session_id)
             VALUES ($1, $2)
             ON CONFLICT (discount_code_id, checkout_session_id) DO NOTHING
             RETURNING id",
        )
        .bind(discount_code_id)
        .bind(checkout_session_id)
        .fetch_optional(&self.pool)
        .await?;
        let outcome = LedgerOutcome::from_returned(id);

        if outcome.created().is_some() {
            sqlx::query("UPDATE discount_codes SET usage_count = usage_count + 1 WHERE id = $1")
                .bind(discount_code_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(outcome)
    }
}
