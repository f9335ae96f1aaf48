//! Closed domain enums
//!
//! Fulfillment kind is resolved once from product metadata at ingestion so
//! downstream code matches exhaustively instead of re-checking metadata
//! strings at every call site.

use serde::{Deserialize, Serialize};

/// How a purchased line item must be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentKind {
    /// Shipped through the dropship provider.
    Physical,
    /// Delivered as a time-limited download grant.
    Digital,
    /// Activates a membership seat with lifetime access.
    MembershipSeat,
}

impl FulfillmentKind {
    /// Resolve the kind from a product's metadata tag.
    ///
    /// Returns `None` for a missing or unrecognized tag; the dispatcher
    /// treats that as a catalog-configuration issue, not a crash.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "physical" => Some(Self::Physical),
            "digital" => Some(Self::Digital),
            "membership_seat" => Some(Self::MembershipSeat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Physical => "physical",
            Self::Digital => "digital",
            Self::MembershipSeat => "membership_seat",
        }
    }
}

impl std::fmt::Display for FulfillmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription plan classification, derived from the amount paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Monthly,
    Annual,
}

impl PlanType {
    /// Amounts at or above the cutoff classify as annual.
    pub fn classify(amount_cents: i64, annual_cutoff_cents: i64) -> Self {
        if amount_cents >= annual_cutoff_cents {
            Self::Annual
        } else {
            Self::Monthly
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commission rate tier for a referrer, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionTier {
    /// Referrer holds founder lifetime access.
    Founder,
    /// Referrer holds an active annual subscription.
    Annual,
    /// Everyone else, and the fallback when tier lookups fail.
    Default,
}

impl CommissionTier {
    /// Rate as an integer percentage, kept integral so commission amounts
    /// stay in exact minor-unit arithmetic.
    pub fn rate_percent(&self) -> i64 {
        match self {
            Self::Founder => 70,
            Self::Annual => 60,
            Self::Default => 50,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Founder => "founder",
            Self::Annual => "annual",
            Self::Default => "default",
        }
    }
}

impl std::fmt::Display for CommissionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
