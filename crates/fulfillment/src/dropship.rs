//! External fulfillment adapter
//!
//! The orchestrator depends only on the narrow [`DropshipProvider`]
//! contract; everything Printify-shaped (endpoints, request layout,
//! response parsing) stays behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FulfillmentError, FulfillmentResult};
use crate::gateway::ShippingAddress;

/// One physical line to fulfill.
#[derive(Debug, Clone, Serialize)]
pub struct FulfillmentItem {
    pub product_id: String,
    pub quantity: u32,
}

/// A complete fulfillment request for one checkout session.
#[derive(Debug, Clone)]
pub struct FulfillmentRequest {
    pub reference: String,
    pub items: Vec<FulfillmentItem>,
    pub address: ShippingAddress,
}

#[async_trait]
pub trait DropshipProvider: Send + Sync {
    /// Create a provider order; returns the provider's order id.
    async fn create_order(&self, request: &FulfillmentRequest) -> FulfillmentResult<String>;
}

/// Printify configuration, environment-provided.
#[derive(Debug, Clone)]
pub struct PrintifyConfig {
    pub api_key: String,
    pub shop_id: String,
    pub base_url: String,
}

impl PrintifyConfig {
    pub fn from_env() -> FulfillmentResult<Self> {
        let api_key = std::env::var("PRINTIFY_API_KEY")
            .map_err(|_| FulfillmentError::Internal("PRINTIFY_API_KEY not set".to_string()))?;
        let shop_id = std::env::var("PRINTIFY_SHOP_ID")
            .map_err(|_| FulfillmentError::Internal("PRINTIFY_SHOP_ID not set".to_string()))?;
        Ok(Self {
            api_key,
            shop_id,
            base_url: "https://api.printify.com/v1".to_string(),
        })
    }
}

#[derive(Serialize)]
struct PrintifyOrderBody<'a> {
    external_id: &'a str,
    line_items: Vec<PrintifyLineItem<'a>>,
    address_to: PrintifyAddress<'a>,
}

#[derive(Serialize)]
struct PrintifyLineItem<'a> {
    product_id: &'a str,
    quantity: u32,
}

#[derive(Serialize)]
struct PrintifyAddress<'a> {
    first_name: &'a str,
    address1: &'a str,
    address2: Option<&'a str>,
    city: &'a str,
    region: Option<&'a str>,
    zip: &'a str,
    country: &'a str,
}

#[derive(Deserialize)]
struct PrintifyOrderResponse {
    id: String,
}

/// Production adapter for the Printify dropship API.
pub struct PrintifyProvider {
    http: reqwest::Client,
    config: PrintifyConfig,
}

impl PrintifyProvider {
    pub fn new(config: PrintifyConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn map_request<'a>(request: &'a FulfillmentRequest) -> PrintifyOrderBody<'a> {
        PrintifyOrderBody {
            external_id: &request.reference,
            line_items: request
                .items
                .iter()
                .map(|item| PrintifyLineItem {
                    product_id: &item.product_id,
                    quantity: item.quantity,
                })
                .collect(),
            address_to: PrintifyAddress {
                first_name: &request.address.name,
                address1: &request.address.line1,
                address2: request.address.line2.as_deref(),
                city: &request.address.city,
                region: request.address.region.as_deref(),
                zip: &request.address.postal_code,
                country: &request.address.country,
            },
        }
    }
}

#[async_trait]
impl DropshipProvider for PrintifyProvider {
    async fn create_order(&self, request: &FulfillmentRequest) -> FulfillmentResult<String> {
        let url = format!(
            "{}/shops/{}/orders.json",
            self.config.base_url, self.config.shop_id
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&Self::map_request(request))
            .send()
            .await
            .map_err(|e| FulfillmentError::External(format!("printify request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FulfillmentError::External(format!(
                "printify returned {status}: {body}"
            )));
        }

        let parsed: PrintifyOrderResponse = response
            .json()
            .await
            .map_err(|e| FulfillmentError::External(format!("printify response unparseable: {e}")))?;

        tracing::info!(
            reference = %request.reference,
            printify_order_id = %parsed.id,
            "Printify order created"
        );

        Ok(parsed.id)
    }
}
