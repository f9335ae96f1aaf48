//! Fulfillment dispatch
//!
//! Partitions a checkout's line items by fulfillment kind and runs each
//! kind's handler independently. The branches are siblings, not a pipeline:
//! there is no ordering dependency between physical dispatch and digital
//! grant issuance, a failure in one never prevents the other from running,
//! and each writes its own audit entries. Notifications and discount
//! recording happen after both branches regardless of their outcomes.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use orderflow_shared::FulfillmentKind;

use crate::audit::{ActionLogBuilder, ActionLogger, ActionType};
use crate::directory::{Directory, PgDirectory};
use crate::downloads::{DownloadGrantIssuer, IssuedGrant};
use crate::dropship::{DropshipProvider, FulfillmentItem, FulfillmentRequest};
use crate::error::{FulfillmentError, FulfillmentResult};
use crate::gateway::{CheckoutSnapshot, LineItem};
use crate::ledger::{EffectLedger, IdempotencyLedger, LedgerOutcome, NewFulfillmentOrder};
use crate::notify::NotificationService;

/// Bound on each adapter call so one slow downstream dependency cannot
/// indefinitely delay audit logging for its branch.
pub const ADAPTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Line items split by how they must be delivered.
#[derive(Debug, Default)]
pub struct ItemPartition {
    pub physical: Vec<LineItem>,
    pub digital: Vec<LineItem>,
    pub seats: Vec<LineItem>,
    pub untagged: Vec<LineItem>,
}

/// Split line items by fulfillment kind, resolved once at ingestion.
pub fn partition_items(items: &[LineItem]) -> ItemPartition {
    let mut partition = ItemPartition::default();
    for item in items {
        match item.kind {
            Some(FulfillmentKind::Physical) => partition.physical.push(item.clone()),
            Some(FulfillmentKind::Digital) => partition.digital.push(item.clone()),
            Some(FulfillmentKind::MembershipSeat) => partition.seats.push(item.clone()),
            None => partition.untagged.push(item.clone()),
        }
    }
    partition
}

pub struct FulfillmentDispatcher {
    directory: Arc<dyn Directory>,
    ledger: Arc<dyn EffectLedger>,
    audit: ActionLogger,
    downloads: DownloadGrantIssuer,
    provider: Arc<dyn DropshipProvider>,
    notify: NotificationService,
}

impl FulfillmentDispatcher {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn DropshipProvider>,
        notify: NotificationService,
    ) -> Self {
        Self::with_parts(
            Arc::new(PgDirectory::new(pool.clone())),
            Arc::new(IdempotencyLedger::new(pool.clone())),
            ActionLogger::new(pool.clone()),
            DownloadGrantIssuer::new(pool),
            provider,
            notify,
        )
    }

    pub fn with_parts(
        directory: Arc<dyn Directory>,
        ledger: Arc<dyn EffectLedger>,
        audit: ActionLogger,
        downloads: DownloadGrantIssuer,
        provider: Arc<dyn DropshipProvider>,
        notify: NotificationService,
    ) -> Self {
        Self {
            directory,
            ledger,
            audit,
            downloads,
            provider,
            notify,
        }
    }

    /// Process a completed checkout. Every branch is individually caught
    /// and audited; nothing here propagates back to the event dispatcher.
    pub async fn dispatch(&self, snapshot: &CheckoutSnapshot) {
        let order_id = snapshot.id.as_str();
        let partition = partition_items(&snapshot.line_items);

        for item in &partition.untagged {
            self.audit
                .log(
                    ActionLogBuilder::new(order_id, ActionType::FulfillmentFailed)
                        .error("product has no recognizable fulfillment kind")
                        .metadata(serde_json::json!({ "product_id": item.product_id })),
                )
                .await;
        }
        if !partition.seats.is_empty() {
            // Seat products belong on membership-tagged checkouts, which are
            // routed before the dispatcher. Reaching here is a catalog issue.
            tracing::warn!(
                order_id = order_id,
                count = partition.seats.len(),
                "Seat line items on a non-membership checkout"
            );
        }

        let user_id = self.resolve_user(snapshot).await;

        let (_, grants) = tokio::join!(
            self.run_physical_branch(snapshot, user_id, &partition.physical),
            self.run_digital_branch(snapshot, user_id, &partition.digital),
        );

        self.post_dispatch(snapshot, &grants).await;
    }

    /// Resolve the purchaser's internal user id from the checkout email.
    /// Guest checkouts resolve to `None`; that only degrades record linkage,
    /// never fulfillment itself.
    async fn resolve_user(&self, snapshot: &CheckoutSnapshot) -> Option<Uuid> {
        let email = snapshot.customer_email.as_deref()?;
        match self.directory.user_id_by_email(email).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(order_id = %snapshot.id, error = %e, "User lookup failed");
                None
            }
        }
    }

    async fn run_physical_branch(
        &self,
        snapshot: &CheckoutSnapshot,
        user_id: Option<Uuid>,
        items: &[LineItem],
    ) {
        if items.is_empty() {
            return;
        }

        if let Err(e) = self.dispatch_physical(snapshot, user_id, items).await {
            self.audit
                .log(
                    ActionLogBuilder::new(&snapshot.id, ActionType::FulfillmentFailed)
                        .error(&e)
                        .metadata(serde_json::json!({ "item_count": items.len() })),
                )
                .await;
            tracing::error!(order_id = %snapshot.id, error = %e, "Physical fulfillment branch failed");
        }
    }

    async fn dispatch_physical(
        &self,
        snapshot: &CheckoutSnapshot,
        user_id: Option<Uuid>,
        items: &[LineItem],
    ) -> FulfillmentResult<()> {
        let address = snapshot.shipping.clone().ok_or_else(|| {
            FulfillmentError::Configuration(
                "physical items present but checkout has no shipping address".to_string(),
            )
        })?;

        let order = NewFulfillmentOrder {
            checkout_session_id: snapshot.id.clone(),
            user_id,
            shipping_address: serde_json::to_value(&address)
                .map_err(|e| FulfillmentError::Internal(e.to_string()))?,
            line_items: serde_json::to_value(
                items
                    .iter()
                    .map(|i| {
                        serde_json::json!({
                            "product_id": i.product_id,
                            "quantity": i.quantity,
                            "amount_cents": i.amount_cents,
                        })
                    })
                    .collect::<Vec<_>>(),
            )
            .map_err(|e| FulfillmentError::Internal(e.to_string()))?,
        };

        let fulfillment_order_id = match self.ledger.insert_fulfillment_order(&order).await? {
            LedgerOutcome::Created(id) => id,
            LedgerOutcome::AlreadyRecorded => {
                // The row exists from an earlier delivery. If it carries an
                // external order id the provider already accepted it and the
                // replay is a no-op; otherwise that delivery died before or
                // at the provider call, so this one retries it.
                match self
                    .ledger
                    .undispatched_fulfillment_order(&snapshot.id)
                    .await?
                {
                    Some(id) => {
                        tracing::info!(
                            order_id = %snapshot.id,
                            fulfillment_order_id = %id,
                            "Re-dispatching fulfillment order that never reached the provider"
                        );
                        id
                    }
                    None => {
                        tracing::info!(
                            order_id = %snapshot.id,
                            "Fulfillment order already dispatched to provider, no-op"
                        );
                        return Ok(());
                    }
                }
            }
        };

        let request = FulfillmentRequest {
            reference: snapshot.id.clone(),
            items: items
                .iter()
                .map(|i| FulfillmentItem {
                    product_id: i.product_id.clone(),
                    quantity: i.quantity,
                })
                .collect(),
            address,
        };

        let result = tokio::time::timeout(ADAPTER_TIMEOUT, self.provider.create_order(&request))
            .await
            .map_err(|_| FulfillmentError::Timeout("dropship provider"))
            .and_then(|inner| inner);

        match result {
            Ok(external_order_id) => {
                self.ledger
                    .set_external_order_id(fulfillment_order_id, &external_order_id)
                    .await?;
                self.audit
                    .log(
                        ActionLogBuilder::new(&snapshot.id, ActionType::FulfillmentDispatched)
                            .metadata(serde_json::json!({
                                "fulfillment_order_id": fulfillment_order_id,
                                "external_order_id": external_order_id,
                                "item_count": items.len(),
                            })),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                // No inline retry: the event stays replayable and the order
                // row stays in 'failed' for operator review.
                self.ledger
                    .mark_fulfillment_failed(fulfillment_order_id)
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_digital_branch(
        &self,
        snapshot: &CheckoutSnapshot,
        user_id: Option<Uuid>,
        items: &[LineItem],
    ) -> Vec<IssuedGrant> {
        let mut grants = Vec::new();
        for item in items {
            match self.downloads.issue(&snapshot.id, user_id, item).await {
                Ok(Some(grant)) => grants.push(grant),
                Ok(None) => {}
                Err(e) => {
                    self.audit
                        .log(
                            ActionLogBuilder::new(&snapshot.id, ActionType::FulfillmentFailed)
                                .error(&e)
                                .metadata(serde_json::json!({ "product_id": item.product_id })),
                        )
                        .await;
                    tracing::error!(
                        order_id = %snapshot.id,
                        product_id = %item.product_id,
                        error = %e,
                        "Download grant issuance failed"
                    );
                }
            }
        }
        grants
    }

    /// Notifications and discount recording, each independently caught so a
    /// failure here never touches fulfillment state that already succeeded.
    async fn post_dispatch(&self, snapshot: &CheckoutSnapshot, grants: &[IssuedGrant]) {
        if let Some(email) = snapshot.customer_email.as_deref() {
            match self
                .notify
                .send_order_confirmation(email, &snapshot.id, grants)
                .await
            {
                Ok(()) => {
                    self.audit
                        .log(
                            ActionLogBuilder::new(&snapshot.id, ActionType::NotificationSent)
                                .metadata(serde_json::json!({ "kind": "order_confirmation" })),
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(order_id = %snapshot.id, error = %e, "Order confirmation failed");
                }
            }
        }

        let summary = format!(
            "{} line item(s), {} download grant(s), total ${:.2}",
            snapshot.line_items.len(),
            grants.len(),
            snapshot.amount_total_cents as f64 / 100.0
        );
        if let Err(e) = self
            .notify
            .send_admin_order_alert(&snapshot.id, &summary)
            .await
        {
            tracing::warn!(order_id = %snapshot.id, error = %e, "Admin order alert failed");
        }

        if let Some(code_id) = snapshot.discount_code_id() {
            match code_id.parse::<Uuid>() {
                Ok(discount_code_id) => {
                    match self
                        .ledger
                        .record_discount_usage(discount_code_id, &snapshot.id)
                        .await
                    {
                        Ok(outcome) if outcome.created().is_some() => {
                            self.audit
                                .log(
                                    ActionLogBuilder::new(
                                        &snapshot.id,
                                        ActionType::DiscountUsageRecorded,
                                    )
                                    .metadata(serde_json::json!({
                                        "discount_code_id": discount_code_id,
                                    })),
                                )
                                .await;
                        }
                        Ok(_) => {
                            tracing::info!(
                                order_id = %snapshot.id,
                                "Discount usage already recorded for checkout, no-op"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                order_id = %snapshot.id,
                                error = %e,
                                "Failed to record discount usage"
                            );
                        }
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        order_id = %snapshot.id,
                        discount_code_id = code_id,
                        "Checkout metadata carries an unparseable discount code id"
                    );
                }
            }
        }
    }
}
