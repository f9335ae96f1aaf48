//! Processor gateway
//!
//! Narrow read-only boundary to the payment processor: fetch a checkout
//! session snapshot with its line items, and answer whether a customer
//! currently holds an active annual subscription. Everything
//! provider-specific stays behind this trait so the resolver and dispatcher
//! are testable with fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use orderflow_shared::FulfillmentKind;

use crate::client::StripeClient;
use crate::error::{FulfillmentError, FulfillmentResult};

/// Read-only snapshot of a checkout session at processing time.
#[derive(Debug, Clone)]
pub struct CheckoutSnapshot {
    pub id: String,
    pub customer_email: Option<String>,
    pub metadata: HashMap<String, String>,
    pub amount_subtotal_cents: i64,
    pub amount_total_cents: i64,
    pub amount_discount_cents: i64,
    pub amount_shipping_cents: i64,
    pub shipping: Option<ShippingAddress>,
    pub line_items: Vec<LineItem>,
}

impl CheckoutSnapshot {
    /// Metadata tag marking a one-time membership-seat purchase.
    pub fn is_membership_purchase(&self) -> bool {
        self.metadata.get("purchase_type").map(String::as_str) == Some("membership")
    }

    /// Referring discount code id carried in checkout metadata, if any.
    pub fn discount_code_id(&self) -> Option<&str> {
        self.metadata.get("discount_code_id").map(String::as_str)
    }
}

/// A purchased line item with its fulfillment kind resolved at ingestion.
#[derive(Debug, Clone)]
pub struct LineItem {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub amount_cents: i64,
    /// `None` when the product carries no recognizable fulfillment tag;
    /// the dispatcher audits that as a catalog-configuration issue.
    pub kind: Option<FulfillmentKind>,
}

/// Destination for a physical shipment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub name: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub region: Option<String>,
    pub postal_code: String,
    pub country: String,
}

#[async_trait]
pub trait ProcessorGateway: Send + Sync {
    /// Fetch the checkout session with line items expanded.
    async fn fetch_checkout(&self, session_id: &str) -> FulfillmentResult<CheckoutSnapshot>;

    /// Whether the customer behind this email holds an active annual
    /// subscription with the processor.
    async fn has_active_annual_subscription(&self, email: &str) -> FulfillmentResult<bool>;
}

/// Production gateway backed by the Stripe API.
pub struct StripeGateway {
    client: StripeClient,
}

impl StripeGateway {
    pub fn new(client: StripeClient) -> Self {
        Self { client }
    }

    fn map_line_item(item: &stripe::CheckoutSessionItem) -> LineItem {
        let price = item.price.as_ref();
        let product = price.and_then(|p| match &p.product {
            Some(stripe::Expandable::Object(prod)) => Some(prod.as_ref()),
            _ => None,
        });

        let product_id = product
            .map(|p| p.id.to_string())
            .or_else(|| price.map(|p| p.id.to_string()))
            .unwrap_or_default();
        let product_name = product
            .and_then(|p| p.name.clone())
            .unwrap_or_else(|| "unknown product".to_string());
        let kind = product
            .and_then(|p| p.metadata.as_ref())
            .and_then(|m| m.get("fulfillment"))
            .and_then(|tag| FulfillmentKind::from_tag(tag));

        LineItem {
            product_id,
            product_name,
            quantity: item.quantity.unwrap_or(1) as u32,
            amount_cents: item.amount_total,
            kind,
        }
    }

    fn map_shipping(shipping: &stripe::Shipping) -> Option<ShippingAddress> {
        let address = shipping.address.as_ref()?;
        Some(ShippingAddress {
            name: shipping.name.clone().unwrap_or_default(),
            line1: address.line1.clone()?,
            line2: address.line2.clone(),
            city: address.city.clone().unwrap_or_default(),
            region: address.state.clone(),
            postal_code: address.postal_code.clone().unwrap_or_default(),
            country: address.country.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ProcessorGateway for StripeGateway {
    async fn fetch_checkout(&self, session_id: &str) -> FulfillmentResult<CheckoutSnapshot> {
        let id: stripe::CheckoutSessionId = session_id
            .parse()
            .map_err(|_| FulfillmentError::not_found("checkout session", session_id))?;

        let session = stripe::CheckoutSession::retrieve(
            self.client.inner(),
            &id,
            &["line_items", "line_items.data.price.product"],
        )
        .await?;

        let customer_email = session
            .customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .or(session.customer_email.clone());

        let line_items = session
            .line_items
            .as_ref()
            .map(|items| items.data.iter().map(Self::map_line_item).collect())
            .unwrap_or_default();

        let total_details = session.total_details.as_ref();

        Ok(CheckoutSnapshot {
            id: session.id.to_string(),
            customer_email,
            metadata: session.metadata.clone().unwrap_or_default(),
            amount_subtotal_cents: session.amount_subtotal.unwrap_or(0),
            amount_total_cents: session.amount_total.unwrap_or(0),
            amount_discount_cents: total_details.map(|t| t.amount_discount).unwrap_or(0),
            amount_shipping_cents: total_details
                .and_then(|t| t.amount_shipping)
                .unwrap_or(0),
            shipping: session
                .shipping_details
                .as_ref()
                .and_then(Self::map_shipping),
            line_items,
        })
    }

    async fn has_active_annual_subscription(&self, email: &str) -> FulfillmentResult<bool> {
        let mut customer_params = stripe::ListCustomers::new();
        customer_params.email = Some(email);
        customer_params.limit = Some(1);

        let customers = stripe::Customer::list(self.client.inner(), &customer_params).await?;
        let customer = match customers.data.first() {
            Some(c) => c,
            None => {
                return Err(FulfillmentError::not_found("stripe customer", email));
            }
        };

        let mut sub_params = stripe::ListSubscriptions::new();
        sub_params.customer = Some(customer.id.clone());
        sub_params.status = Some(stripe::SubscriptionStatusFilter::Active);

        let subscriptions =
            stripe::Subscription::list(self.client.inner(), &sub_params).await?;

        let annual_price_id = &self.client.config().annual_price_id;
        let annual = subscriptions.data.iter().any(|sub| {
            sub.items.data.iter().any(|item| {
                item.price.as_ref().is_some_and(|price| {
                    price.id.as_str() == annual_price_id
                        || price
                            .recurring
                            .as_ref()
                            .is_some_and(|r| r.interval == stripe::RecurringInterval::Year)
                })
            })
        });

        Ok(annual)
    }
}
