//! Referral commission resolution
//!
//! Turns a subscription's first payment into at most one commission for the
//! referrer. Tier resolution consults mutable external state (founder
//! allowlist, processor subscription status), so its failures fall back to
//! the default rate rather than blocking creation: commission correctness
//! matters more than rate-tier precision, and the fallback reason lands in
//! the audit trail.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use orderflow_shared::{CommissionTier, PlanType};

use crate::audit::{ActionLogBuilder, ActionLogger, ActionType};
use crate::directory::{Directory, PgDirectory};
use crate::error::FulfillmentResult;
use crate::gateway::ProcessorGateway;
use crate::ledger::{EffectLedger, IdempotencyLedger, LedgerOutcome, NewCommission};
use crate::notify::NotificationService;
use crate::webhooks::InvoicePayload;

/// Tier precedence, highest first. Pure so the precedence table is testable
/// without lookups.
pub fn tier_for(is_founder: bool, has_active_annual: bool) -> CommissionTier {
    if is_founder {
        CommissionTier::Founder
    } else if has_active_annual {
        CommissionTier::Annual
    } else {
        CommissionTier::Default
    }
}

/// `floor(amount * rate)` in integer minor units. No floating point.
pub fn commission_amount_cents(subscription_amount_cents: i64, tier: CommissionTier) -> i64 {
    subscription_amount_cents * tier.rate_percent() / 100
}

pub struct CommissionResolver {
    directory: Arc<dyn Directory>,
    gateway: Arc<dyn ProcessorGateway>,
    ledger: Arc<dyn EffectLedger>,
    audit: ActionLogger,
    notify: NotificationService,
    annual_threshold_cents: i64,
}

impl CommissionResolver {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn ProcessorGateway>,
        notify: NotificationService,
        annual_threshold_cents: i64,
    ) -> Self {
        Self::with_parts(
            Arc::new(PgDirectory::new(pool.clone())),
            Arc::new(IdempotencyLedger::new(pool.clone())),
            ActionLogger::new(pool),
            gateway,
            notify,
            annual_threshold_cents,
        )
    }

    pub fn with_parts(
        directory: Arc<dyn Directory>,
        ledger: Arc<dyn EffectLedger>,
        audit: ActionLogger,
        gateway: Arc<dyn ProcessorGateway>,
        notify: NotificationService,
        annual_threshold_cents: i64,
    ) -> Self {
        Self {
            directory,
            gateway,
            ledger,
            audit,
            notify,
            annual_threshold_cents,
        }
    }

    /// Handle the first payment of a subscription. Unresolvable records are
    /// logged and skipped; nothing here errors the overall event except a
    /// database failure, which is replayable.
    pub async fn process_first_payment(&self, invoice: &InvoicePayload) -> FulfillmentResult<()> {
        let email = match invoice.customer_email.as_deref() {
            Some(email) => email,
            None => {
                tracing::info!("Invoice has no customer email, skipping commission");
                return Ok(());
            }
        };
        let subscription_id = invoice.subscription.clone().unwrap_or_default();
        let amount_cents = invoice.amount_paid.unwrap_or(0);

        let user_id = match self.directory.user_id_by_email(email).await? {
            Some(id) => id,
            None => {
                tracing::info!(email = email, "No user for paying customer, skipping commission");
                return Ok(());
            }
        };

        let referrer_id = match self.directory.active_referrer_for(user_id).await? {
            Some(id) => id,
            None => {
                tracing::debug!(user_id = %user_id, "User was not referred, no commission");
                return Ok(());
            }
        };

        if referrer_id == user_id {
            self.audit
                .log(
                    ActionLogBuilder::new(&subscription_id, ActionType::CommissionSkipped)
                        .metadata(serde_json::json!({
                            "reason": "self_referral",
                            "user_id": user_id,
                        })),
                )
                .await;
            tracing::warn!(user_id = %user_id, "Self-referral detected, skipping commission");
            return Ok(());
        }

        let plan_type = PlanType::classify(amount_cents, self.annual_threshold_cents);
        let (tier, fallback_reason) = self.resolve_referrer_tier(referrer_id).await;

        let commission = NewCommission {
            referrer_id,
            referred_user_id: user_id,
            subscription_id: subscription_id.clone(),
            plan_type,
            subscription_amount_cents: amount_cents,
            commission_amount_cents: commission_amount_cents(amount_cents, tier),
            rate_tier: tier,
        };

        match self.ledger.insert_commission(&commission).await? {
            LedgerOutcome::Created(commission_id) => {
                self.audit
                    .log(
                        ActionLogBuilder::new(&subscription_id, ActionType::CommissionCreated)
                            .metadata(serde_json::json!({
                                "commission_id": commission_id,
                                "referrer_id": referrer_id,
                                "rate_tier": tier.as_str(),
                                "plan_type": plan_type.as_str(),
                                "commission_amount_cents": commission.commission_amount_cents,
                                "tier_fallback_reason": fallback_reason,
                            })),
                    )
                    .await;

                tracing::info!(
                    commission_id = %commission_id,
                    referrer_id = %referrer_id,
                    rate_tier = tier.as_str(),
                    amount_cents = commission.commission_amount_cents,
                    "Commission created"
                );

                if let Err(e) = self
                    .notify
                    .send_commission_earned(referrer_id, commission.commission_amount_cents)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to send commission notification");
                }
            }
            LedgerOutcome::AlreadyRecorded => {
                tracing::info!(
                    referred_user_id = %user_id,
                    "Commission already recorded for referred user, no-op"
                );
            }
        }

        Ok(())
    }

    /// Resolve the referrer's tier, highest precedence first. No lookup
    /// failure aborts creation: every failure path falls back to the
    /// default rate, with the reason returned for the audit trail.
    async fn resolve_referrer_tier(&self, referrer_id: Uuid) -> (CommissionTier, Option<String>) {
        let referrer_email = match self.directory.user_email_by_id(referrer_id).await {
            Ok(Some(email)) => email,
            Ok(None) => {
                return (
                    CommissionTier::Default,
                    Some(format!("referrer {referrer_id} has no user record")),
                );
            }
            Err(e) => {
                tracing::warn!(
                    referrer_id = %referrer_id,
                    error = %e,
                    "Referrer lookup failed, falling back to default rate"
                );
                return (CommissionTier::Default, Some(e.to_string()));
            }
        };

        match self.directory.founder_access_type(&referrer_email).await {
            Ok(Some(access_type)) if access_type == "founder" => {
                return (CommissionTier::Founder, None);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    referrer_id = %referrer_id,
                    error = %e,
                    "Founder allowlist lookup failed, falling back to default rate"
                );
                return (CommissionTier::Default, Some(e.to_string()));
            }
        }

        match self
            .gateway
            .has_active_annual_subscription(&referrer_email)
            .await
        {
            Ok(true) => (CommissionTier::Annual, None),
            Ok(false) => (CommissionTier::Default, None),
            Err(e) if e.is_not_found() => {
                // No processor customer record at all: an ordinary referrer.
                (CommissionTier::Default, None)
            }
            Err(e) => {
                tracing::warn!(
                    referrer_id = %referrer_id,
                    error = %e,
                    "Subscription status lookup failed, falling back to default rate"
                );
                (CommissionTier::Default, Some(e.to_string()))
            }
        }
    }
}
