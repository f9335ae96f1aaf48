//! Outbound notifications
//!
//! Best-effort by contract: a notification failure is logged and never
//! rolls back or blocks fulfillment state that already succeeded. When the
//! service is unconfigured every send becomes a logged no-op, which keeps
//! local development and tests quiet.

use std::time::Duration;

use uuid::Uuid;

use crate::downloads::IssuedGrant;
use crate::error::{FulfillmentError, FulfillmentResult};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct NotificationService {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
    admin_email: String,
    enabled: bool,
}

impl NotificationService {
    pub fn from_env() -> Self {
        let api_key = std::env::var("NOTIFY_API_KEY").unwrap_or_default();
        let admin_email = std::env::var("ADMIN_EMAIL").unwrap_or_default();
        let api_url = std::env::var("NOTIFY_API_URL")
            .unwrap_or_else(|_| "https://api.resend.com/emails".to_string());
        let enabled = !api_key.is_empty();

        if !enabled {
            tracing::warn!("Notification service not configured (missing NOTIFY_API_KEY)");
        }

        Self {
            http: reqwest::Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key,
            api_url,
            admin_email,
            enabled,
        }
    }

    /// A disabled service for tests and unconfigured deployments.
    pub fn disabled() -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: String::new(),
            api_url: String::new(),
            admin_email: String::new(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, to: &str, subject: &str, body: String) -> FulfillmentResult<()> {
        if !self.enabled {
            tracing::debug!(to = to, subject = subject, "Notification skipped (disabled)");
            return Ok(());
        }

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "to": to,
                "subject": subject,
                "text": body,
            }))
            .send()
            .await
            .map_err(|e| FulfillmentError::External(format!("notification send failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FulfillmentError::External(format!(
                "notification service returned {}",
                response.status()
            )));
        }

        Ok(())
    }

    /// Tell a referrer they earned a commission.
    pub async fn send_commission_earned(
        &self,
        referrer_id: Uuid,
        amount_cents: i64,
    ) -> FulfillmentResult<()> {
        // Referrer notifications route through the admin inbox; the payout
        // process owns direct referrer contact.
        self.send(
            &self.admin_email,
            "Referral commission earned",
            format!(
                "Referrer {} earned a commission of ${:.2}.",
                referrer_id,
                amount_cents as f64 / 100.0
            ),
        )
        .await
    }

    /// Customer order confirmation, listing any issued download grants.
    pub async fn send_order_confirmation(
        &self,
        email: &str,
        order_id: &str,
        grants: &[IssuedGrant],
    ) -> FulfillmentResult<()> {
        let mut body = format!("Thanks for your order {order_id}.\n");
        for grant in grants {
            body.push_str(&format!(
                "\nDownload {}: token {} (expires {})",
                grant.product_name,
                grant.token,
                grant.expires_at.date()
            ));
        }
        self.send(email, "Your order confirmation", body).await
    }

    /// Internal admin alert for a processed order.
    pub async fn send_admin_order_alert(
        &self,
        order_id: &str,
        summary: &str,
    ) -> FulfillmentResult<()> {
        self.send(
            &self.admin_email,
            "Order processed",
            format!("Order {order_id}: {summary}"),
        )
        .await
    }

    /// Welcome a new membership-seat holder.
    pub async fn send_membership_welcome(&self, email: &str) -> FulfillmentResult<()> {
        self.send(
            email,
            "Welcome to the membership",
            "Your lifetime membership seat is active.".to_string(),
        )
        .await
    }
}
