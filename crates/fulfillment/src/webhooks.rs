//! Stripe webhook handling
//!
//! The signature gate and the event dispatcher. Verification runs over the
//! exact raw request bytes (re-serializing the body can change byte layout
//! and invalidate the signature) and must pass before any database or
//! external-API work begins. Once verified, the event is recorded, handed to
//! a detached task, and the caller answers 200 immediately; every terminal
//! outcome of the detached task lands in the stored event row, never in the
//! HTTP response.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::audit::{ActionLogBuilder, ActionLogger, ActionType};
use crate::commission::CommissionResolver;
use crate::dispatch::FulfillmentDispatcher;
use crate::error::{FulfillmentError, FulfillmentResult};
use crate::gateway::ProcessorGateway;
use crate::membership::MembershipService;

type HmacSha256 = Hmac<Sha256>;

/// Signed payloads older than this are rejected as replays.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Events stuck in `processing` longer than this are eligible for re-claim.
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// A verified inbound event. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl PaymentEvent {
    pub fn event_kind(&self) -> EventKind {
        EventKind::parse(&self.kind)
    }
}

/// The event kinds this orchestrator acts on. New kinds appear over the
/// product's lifetime and must never error the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    InvoicePaid,
    CheckoutSessionCompleted,
    Unknown,
}

impl EventKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "invoice.paid" => Self::InvoicePaid,
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            _ => Self::Unknown,
        }
    }
}

/// The fields of an invoice object the commission path needs.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoicePayload {
    pub billing_reason: Option<String>,
    pub customer_email: Option<String>,
    pub amount_paid: Option<i64>,
    pub subscription: Option<String>,
}

impl InvoicePayload {
    /// Only the first payment of a subscription generates a commission;
    /// renewals carry a different billing reason.
    pub fn is_first_subscription_payment(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_create")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SessionStub {
    id: String,
}

/// Terminal outcome of processing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Handled,
    Ignored(&'static str),
}

/// Summary of one scheduled replay pass.
#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Webhook handler: signature gate plus event dispatcher.
pub struct WebhookHandler {
    webhook_secret: String,
    pool: PgPool,
    audit: ActionLogger,
    commission: CommissionResolver,
    dispatcher: FulfillmentDispatcher,
    membership: MembershipService,
    gateway: Arc<dyn ProcessorGateway>,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: String,
        pool: PgPool,
        gateway: Arc<dyn ProcessorGateway>,
        commission: CommissionResolver,
        dispatcher: FulfillmentDispatcher,
        membership: MembershipService,
    ) -> Self {
        let audit = ActionLogger::new(pool.clone());
        Self {
            webhook_secret,
            pool,
            audit,
            commission,
            dispatcher,
            membership,
            gateway,
        }
    }

    /// Verify and parse an inbound event from the raw request bytes.
    ///
    /// The signature header has the form `t=<unix>,v1=<hex>`; the signed
    /// payload is `<t>.<raw body>` keyed with the webhook secret.
    pub fn verify_event(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> FulfillmentResult<PaymentEvent> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| FulfillmentError::SignatureInvalid)?
            .as_secs() as i64;
        verify_and_parse(&self.webhook_secret, payload, signature_header, now)
    }

    /// Persist the verified event before background work begins. Duplicate
    /// deliveries re-claim the same row; deduplication of effects is the
    /// ledger's job, so processing always proceeds.
    pub async fn record_event(&self, event: &PaymentEvent) -> FulfillmentResult<()> {
        let payload = serde_json::to_value(event)
            .map_err(|e| FulfillmentError::MalformedPayload(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO payment_events
                (stripe_event_id, event_kind, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            "#,
        )
        .bind(&event.id)
        .bind(&event.kind)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Process one event and write its terminal outcome to the stored row.
    /// This is the body of the detached task; it never propagates an error
    /// to a caller, because there is no caller left to receive one.
    pub async fn handle_event(&self, event: PaymentEvent) {
        let event_id = event.id.clone();
        let result = self.process(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(EventOutcome::Handled) => ("success", None),
            Ok(EventOutcome::Ignored(reason)) => {
                tracing::info!(event_id = %event_id, reason = reason, "Event ignored");
                ("ignored", Some(reason.to_string()))
            }
            Err(e) => {
                tracing::error!(event_id = %event_id, error = %e, "Event processing failed");
                ("error", Some(e.to_string()))
            }
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE payment_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                processing_result = processing_result,
                error = %e,
                "Failed to record event processing outcome"
            );
        }
    }

    /// Routing rule of the event dispatcher, evaluated in order.
    async fn process(&self, event: &PaymentEvent) -> FulfillmentResult<EventOutcome> {
        match event.event_kind() {
            EventKind::InvoicePaid => {
                let invoice: InvoicePayload = serde_json::from_value(event.data.object.clone())
                    .map_err(|e| FulfillmentError::MalformedPayload(e.to_string()))?;

                if !invoice.is_first_subscription_payment() {
                    return Ok(EventOutcome::Ignored("not a first subscription payment"));
                }

                self.commission.process_first_payment(&invoice).await?;
                Ok(EventOutcome::Handled)
            }
            EventKind::CheckoutSessionCompleted => {
                let stub: SessionStub = serde_json::from_value(event.data.object.clone())
                    .map_err(|e| FulfillmentError::MalformedPayload(e.to_string()))?;

                let snapshot = self.gateway.fetch_checkout(&stub.id).await?;

                if snapshot.is_membership_purchase() {
                    self.membership.handle_purchase(&snapshot).await?;
                } else {
                    self.dispatcher.dispatch(&snapshot).await;
                }
                Ok(EventOutcome::Handled)
            }
            EventKind::Unknown => {
                self.audit
                    .log(
                        ActionLogBuilder::new(&event.id, ActionType::EventIgnored)
                            .metadata(serde_json::json!({ "event_kind": event.kind })),
                    )
                    .await;
                Ok(EventOutcome::Ignored("unhandled event kind"))
            }
        }
    }

    /// Re-run events that ended in `error`, plus events stuck in
    /// `processing` past the timeout (a worker died mid-event). Inbound
    /// events remain in the processor's system too, so this is safe to run
    /// repeatedly: replayed effects resolve to no-ops at the ledger.
    pub async fn replay_pending(&self, limit: i64) -> FulfillmentResult<ReplaySummary> {
        let rows: Vec<(Uuid, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT id, payload
            FROM payment_events
            WHERE processing_result = 'error'
               OR (processing_result = 'processing'
                   AND processing_started_at < NOW() - ($1 || ' minutes')::INTERVAL)
            ORDER BY received_at ASC
            LIMIT $2
            "#,
        )
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ReplaySummary::default();

        for (row_id, payload) in rows {
            let event: PaymentEvent = match serde_json::from_value(payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(row_id = %row_id, error = %e, "Stored event payload unparseable, skipping");
                    continue;
                }
            };

            summary.replayed += 1;
            let event_id = event.id.clone();

            if let Err(e) = self.record_event(&event).await {
                tracing::error!(event_id = %event_id, error = %e, "Failed to re-claim event for replay");
                summary.failed += 1;
                continue;
            }

            self.handle_event(event).await;

            let result: Option<String> = sqlx::query_scalar(
                "SELECT processing_result FROM payment_events WHERE stripe_event_id = $1",
            )
            .bind(&event_id)
            .fetch_optional(&self.pool)
            .await?;

            match result.as_deref() {
                Some("error") => summary.failed += 1,
                _ => summary.succeeded += 1,
            }
        }

        Ok(summary)
    }

    /// Delete terminal event rows older than the retention window.
    pub async fn prune_events(&self, retention_days: i64) -> FulfillmentResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM payment_events
            WHERE processing_result IN ('success', 'ignored')
              AND received_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Spawn the detached persist-and-process task for a verified event. The
/// returned handle is informational; the HTTP response must not await it.
///
/// Persistence failure does not stop processing: the ledger already makes
/// every effect replay-safe, and a processor retry of the same delivery
/// will restore the missing event row.
pub fn spawn_detached(
    handler: Arc<WebhookHandler>,
    event: PaymentEvent,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = handler.record_event(&event).await {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to persist webhook event, processing anyway"
            );
        }
        handler.handle_event(event).await;
    })
}

/// Signature-gate core, with an injectable clock for tolerance tests.
pub fn verify_and_parse(
    secret: &str,
    payload: &[u8],
    signature_header: &str,
    now: i64,
) -> FulfillmentResult<PaymentEvent> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(FulfillmentError::SignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(FulfillmentError::SignatureInvalid)?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(FulfillmentError::SignatureInvalid);
    }

    let computed =
        compute_signature(secret, timestamp, payload).ok_or(FulfillmentError::SignatureInvalid)?;

    let matches: bool = computed.as_bytes().ct_eq(v1_signature.as_bytes()).into();
    if !matches {
        tracing::warn!("Webhook signature mismatch");
        return Err(FulfillmentError::SignatureInvalid);
    }

    let event: PaymentEvent = serde_json::from_slice(payload)
        .map_err(|e| FulfillmentError::MalformedPayload(e.to_string()))?;

    tracing::info!(
        event_id = %event.id,
        event_kind = %event.kind,
        "Webhook signature verified"
    );

    Ok(event)
}

/// HMAC-SHA256 over `"{timestamp}.{payload}"`, fed the raw bytes directly.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}
