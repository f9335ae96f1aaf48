//! Membership seat grants
//!
//! Checkouts tagged as membership purchases bypass per-item fulfillment
//! entirely: the whole session becomes one seat grant keyed by the checkout
//! session id, so a replayed event can never mint a second seat.

use std::sync::Arc;

use sqlx::PgPool;

use crate::audit::{ActionLogBuilder, ActionLogger, ActionType};
use crate::directory::{Directory, PgDirectory};
use crate::error::FulfillmentResult;
use crate::gateway::CheckoutSnapshot;
use crate::ledger::{EffectLedger, IdempotencyLedger, LedgerOutcome};
use crate::notify::NotificationService;

pub struct MembershipService {
    directory: Arc<dyn Directory>,
    ledger: Arc<dyn EffectLedger>,
    audit: ActionLogger,
    notify: NotificationService,
}

impl MembershipService {
    pub fn new(pool: PgPool, notify: NotificationService) -> Self {
        Self::with_parts(
            Arc::new(PgDirectory::new(pool.clone())),
            Arc::new(IdempotencyLedger::new(pool.clone())),
            ActionLogger::new(pool),
            notify,
        )
    }

    pub fn with_parts(
        directory: Arc<dyn Directory>,
        ledger: Arc<dyn EffectLedger>,
        audit: ActionLogger,
        notify: NotificationService,
    ) -> Self {
        Self {
            directory,
            ledger,
            audit,
            notify,
        }
    }

    pub async fn handle_purchase(&self, snapshot: &CheckoutSnapshot) -> FulfillmentResult<()> {
        let email = match snapshot.customer_email.as_deref() {
            Some(email) => email,
            None => {
                // Replaying the event cannot conjure an email, so erroring
                // here would just park it in the replay queue forever. Audit
                // the skip and settle the event.
                self.audit
                    .log(
                        ActionLogBuilder::new(&snapshot.id, ActionType::SeatGrantSkipped)
                            .metadata(serde_json::json!({ "reason": "missing_customer_email" })),
                    )
                    .await;
                tracing::warn!(
                    order_id = %snapshot.id,
                    "Membership checkout has no customer email, skipping seat grant"
                );
                return Ok(());
            }
        };

        // The grant stands on the email alone; an account created later can
        // be linked by a backfill.
        let user_id = self.directory.user_id_by_email(email).await?;

        match self
            .ledger
            .insert_seat_grant(&snapshot.id, email, user_id)
            .await?
        {
            LedgerOutcome::Created(grant_id) => {
                self.audit
                    .log(
                        ActionLogBuilder::new(&snapshot.id, ActionType::SeatGranted).metadata(
                            serde_json::json!({
                                "seat_grant_id": grant_id,
                                "user_resolved": user_id.is_some(),
                            }),
                        ),
                    )
                    .await;
                tracing::info!(
                    order_id = %snapshot.id,
                    seat_grant_id = %grant_id,
                    "Membership seat granted"
                );

                if let Err(e) = self.notify.send_membership_welcome(email).await {
                    tracing::warn!(
                        order_id = %snapshot.id,
                        error = %e,
                        "Failed to send membership welcome"
                    );
                }
            }
            LedgerOutcome::AlreadyRecorded => {
                tracing::info!(
                    order_id = %snapshot.id,
                    "Seat already granted for checkout, no-op"
                );
            }
        }

        Ok(())
    }
}
