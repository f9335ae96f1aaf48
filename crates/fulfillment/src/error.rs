//! Fulfillment error taxonomy
//!
//! The propagation policy is asymmetric on purpose: only a signature failure
//! can fail the inbound request. Everything past the gate is caught per
//! branch, logged to the audit trail, and never surfaced to the payment
//! processor, which has already received its acknowledgment.

use thiserror::Error;

pub type FulfillmentResult<T> = Result<T, FulfillmentError>;

#[derive(Debug, Error)]
pub enum FulfillmentError {
    /// Bad or missing webhook signature. Terminal for the request.
    #[error("webhook signature invalid")]
    SignatureInvalid,

    /// The event envelope could not be parsed after verification.
    #[error("malformed event payload: {0}")]
    MalformedPayload(String),

    /// A collaborator record (user, referral, product) could not be
    /// resolved. Skips the specific effect, never the whole event.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Adapter or notification call failed; eligible for replay.
    #[error("external call failed: {0}")]
    External(String),

    /// A bounded external call did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Missing or inconsistent catalog metadata on a line item.
    #[error("catalog configuration issue: {0}")]
    Configuration(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FulfillmentError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Whether this error means a referenced record simply was not there.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
