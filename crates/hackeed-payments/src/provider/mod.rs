//! Payment Provider Integration
//!
//! The checkout builder, webhook processor and verification query talk to
//! the provider only through [`PaymentProvider`]. Response types keep just
//! the fields the pipeline reads and tolerate expanded or collapsed
//! references.

mod mock;
mod stripe;

pub use mock::{MockFailure, MockPaymentProvider};
pub use stripe::StripeClient;

use async_trait::async_trait;
use hackeed_core::ShippingAddress;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// Payment provider trait (Strategy pattern)
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a hosted checkout session
    async fn create_checkout_session(&self, request: &SessionRequest) -> Result<CreatedSession>;

    /// Retrieve a checkout session with its payment intent reference
    async fn retrieve_session(&self, session_id: &str) -> Result<SessionDetails>;

    /// All line items of a session, with each price's product expanded
    async fn list_line_items(&self, session_id: &str) -> Result<Vec<LineItemDetails>>;

    async fn retrieve_payment_intent(&self, payment_intent_id: &str)
    -> Result<PaymentIntentDetails>;

    /// Provider name
    fn name(&self) -> &str;
}

/// Request to create a checkout session
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    pub line_items: Vec<SessionLineItem>,

    /// Prefilled customer email; the provider collects one when absent
    pub customer_email: Option<String>,

    /// Redirect after payment; may contain `{CHECKOUT_SESSION_ID}`
    pub success_url: String,

    pub cancel_url: String,

    /// Lower-case ISO currency code
    pub currency: String,

    pub locale: String,

    pub metadata: BTreeMap<String, String>,
}

/// One priced line of a session request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionLineItem {
    /// Display name shown on the hosted page
    pub name: String,

    /// Unit amount in cents
    pub unit_amount: i64,

    pub quantity: u64,

    /// Attached to the line's product; carries the reconciliation keys
    pub product_metadata: BTreeMap<String, String>,
}

/// A created session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    pub id: String,
    pub url: String,
}

/// Checkout session as returned by the provider
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionDetails {
    pub id: String,

    /// `paid`, `unpaid` or `no_payment_required`
    #[serde(default)]
    pub payment_status: Option<String>,

    /// `open`, `complete` or `expired`
    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub amount_total: Option<i64>,

    #[serde(default)]
    pub amount_subtotal: Option<i64>,

    #[serde(default)]
    pub currency: Option<String>,

    #[serde(default)]
    pub customer_email: Option<String>,

    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,

    #[serde(default, deserialize_with = "expandable_id")]
    pub payment_intent: Option<String>,

    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,

    #[serde(default)]
    pub shipping_details: Option<ShippingDetails>,

    /// Newer API versions nest shipping details here
    #[serde(default)]
    pub collected_information: Option<CollectedInformation>,

    #[serde(default)]
    pub total_details: Option<TotalDetails>,

    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,

    /// Unix timestamp
    #[serde(default)]
    pub created: Option<i64>,
}

impl SessionDetails {
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid" | "no_payment_required")
        )
    }

    /// Email the shopper paid with
    pub fn email(&self) -> Option<&str> {
        self.customer_email
            .as_deref()
            .or_else(|| self.customer_details.as_ref()?.email.as_deref())
            .filter(|email| !email.is_empty())
    }

    pub fn customer_name(&self) -> Option<&str> {
        self.customer_details
            .as_ref()?
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    pub fn amount_shipping(&self) -> i64 {
        self.total_details
            .as_ref()
            .and_then(|t| t.amount_shipping)
            .unwrap_or(0)
    }

    pub fn amount_tax(&self) -> i64 {
        self.total_details
            .as_ref()
            .and_then(|t| t.amount_tax)
            .unwrap_or(0)
    }

    /// Shipping address, if one was collected and is complete
    pub fn shipping_address(&self) -> Option<ShippingAddress> {
        self.shipping_details
            .as_ref()
            .or_else(|| self.collected_information.as_ref()?.shipping_details.as_ref())
            .and_then(|details| details.address.as_ref())
            .and_then(Address::to_shipping_address)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollectedInformation {
    #[serde(default)]
    pub shipping_details: Option<ShippingDetails>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShippingDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub line1: Option<String>,
    #[serde(default)]
    pub line2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl Address {
    fn to_shipping_address(&self) -> Option<ShippingAddress> {
        Some(ShippingAddress {
            line1: self.line1.clone().filter(|s| !s.is_empty())?,
            line2: self.line2.clone().filter(|s| !s.is_empty()),
            city: self.city.clone().filter(|s| !s.is_empty())?,
            state: self.state.clone().filter(|s| !s.is_empty()),
            postal_code: self.postal_code.clone().filter(|s| !s.is_empty())?,
            country: self.country.clone().filter(|s| !s.is_empty())?,
        })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TotalDetails {
    #[serde(default)]
    pub amount_shipping: Option<i64>,
    #[serde(default)]
    pub amount_tax: Option<i64>,
    #[serde(default)]
    pub amount_discount: Option<i64>,
}

/// A line item of a completed session
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LineItemDetails {
    pub id: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub quantity: Option<u64>,

    #[serde(default)]
    pub amount_total: Option<i64>,

    #[serde(default)]
    pub price: Option<PriceDetails>,
}

impl LineItemDetails {
    /// Metadata value on the expanded product
    pub fn product_metadata(&self, key: &str) -> Option<&str> {
        match self.price.as_ref()?.product.as_ref()? {
            ProductRef::Object(product) => product
                .metadata
                .as_ref()?
                .get(key)
                .map(String::as_str)
                .filter(|value| !value.is_empty()),
            ProductRef::Id(_) => None,
        }
    }

    /// Product name, falling back to the line description
    pub fn product_name(&self) -> Option<&str> {
        let from_product = match self.price.as_ref().and_then(|p| p.product.as_ref()) {
            Some(ProductRef::Object(product)) => product.name.as_deref(),
            _ => None,
        };
        from_product.or(self.description.as_deref())
    }

    pub fn quantity(&self) -> u64 {
        self.quantity.unwrap_or(1)
    }

    /// Unit amount the shopper was charged, in cents
    pub fn unit_amount(&self) -> i64 {
        self.price
            .as_ref()
            .and_then(|price| price.unit_amount)
            .or_else(|| {
                let quantity = i64::try_from(self.quantity()).ok().filter(|q| *q > 0)?;
                Some(self.amount_total? / quantity)
            })
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PriceDetails {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub product: Option<ProductRef>,
}

/// Product reference: an id, or the expanded object
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProductRef {
    Object(ProductDetails),
    Id(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProductDetails {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Payment intent as returned by the provider
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PaymentIntentDetails {
    pub id: String,

    /// `succeeded`, `processing`, `requires_payment_method`, `canceled`, ...
    pub status: String,

    #[serde(default)]
    pub amount: i64,

    #[serde(default)]
    pub currency: Option<String>,

    /// Never leaves the server
    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default)]
    pub last_payment_error: Option<LastPaymentError>,

    #[serde(default)]
    pub created: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LastPaymentError {
    #[serde(default)]
    pub message: Option<String>,
}

/// Paginated list envelope
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct List<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

/// Accept either `"id"` or `{ "id": ..., ... }`
pub(crate) fn expandable_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expandable {
        Id(String),
        Object { id: String },
    }

    Ok(Option::<Expandable>::deserialize(deserializer)?.map(|value| match value {
        Expandable::Id(id) | Expandable::Object { id } => id,
    }))
}
