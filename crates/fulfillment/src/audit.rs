//! Order action audit log
//!
//! Append-only record of every action the orchestrator attempts, successes
//! and failures alike. This is what makes partial failure diagnosable
//! without blocking the branches that succeeded: operators read this table,
//! the payment processor only ever sees a 200.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::FulfillmentResult;

/// Action types recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CommissionCreated,
    CommissionSkipped,
    DownloadGrantCreated,
    DownloadGrantSkipped,
    FulfillmentDispatched,
    FulfillmentFailed,
    SeatGranted,
    SeatGrantSkipped,
    DiscountUsageRecorded,
    NotificationSent,
    EventIgnored,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommissionCreated => "commission_created",
            Self::CommissionSkipped => "commission_skipped",
            Self::DownloadGrantCreated => "download_grant_created",
            Self::DownloadGrantSkipped => "download_grant_skipped",
            Self::FulfillmentDispatched => "fulfillment_dispatched",
            Self::FulfillmentFailed => "fulfillment_failed",
            Self::SeatGranted => "seat_granted",
            Self::SeatGrantSkipped => "seat_grant_skipped",
            Self::DiscountUsageRecorded => "discount_usage_recorded",
            Self::NotificationSent => "notification_sent",
            Self::EventIgnored => "event_ignored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Error,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// One attempted action, ready to append.
#[derive(Debug, Clone)]
pub struct ActionLogBuilder {
    order_id: String,
    action: ActionType,
    status: ActionStatus,
    error_message: Option<String>,
    metadata: Option<serde_json::Value>,
}

impl ActionLogBuilder {
    pub fn new(order_id: impl Into<String>, action: ActionType) -> Self {
        Self {
            order_id: order_id.into(),
            action,
            status: ActionStatus::Success,
            error_message: None,
            metadata: None,
        }
    }

    pub fn error(mut self, message: impl std::fmt::Display) -> Self {
        self.status = ActionStatus::Error;
        self.error_message = Some(message.to_string());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A persisted audit entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActionLogEntry {
    pub id: Uuid,
    pub order_id: String,
    pub action: String,
    pub status: String,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: OffsetDateTime,
}

/// Appends audit entries. A failure to write an audit row is itself only
/// warned about; the audit trail must never take down the action it records.
#[derive(Clone)]
pub struct ActionLogger {
    pool: PgPool,
}

impl ActionLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one entry, swallowing (but logging) write failures.
    pub async fn log(&self, entry: ActionLogBuilder) {
        if let Err(e) = self.append(&entry).await {
            tracing::warn!(
                order_id = %entry.order_id,
                action = entry.action.as_str(),
                error = %e,
                "Failed to write order action log entry"
            );
        }
    }

    async fn append(&self, entry: &ActionLogBuilder) -> FulfillmentResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_action_logs (order_id, action, status, error_message, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&entry.order_id)
        .bind(entry.action.as_str())
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch the trail for one order, oldest first. Operator-facing.
    pub async fn entries_for_order(
        &self,
        order_id: &str,
    ) -> FulfillmentResult<Vec<ActionLogEntry>> {
        let entries = sqlx::query_as(
            r#"
            SELECT id, order_id, action, status, error_message, metadata, created_at
            FROM order_action_logs
            WHERE order_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}
