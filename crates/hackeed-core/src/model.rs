//! Domain Models
//!
//! Products, variant options, orders and ledger records.
//! All monetary values are integer minor currency units (cents).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

/// Stock assumed for a variant option that only carries `inStock: true`
pub const LEGACY_IN_STOCK_QUANTITY: i32 = 999;

/// Subtract `quantity` from `stock`, never going below zero
pub fn clamped_decrement(stock: i32, quantity: i32) -> i32 {
    stock.saturating_sub(quantity).max(0)
}

static NEXT_LOCAL_ID: AtomicI64 = AtomicI64::new(1);

/// Catalog product identifier (the storefront's integer product key)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(i64);

impl ProductId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Next id from a process-wide sequence, for products built in memory.
    ///
    /// Products stored in Postgres get theirs from `BIGSERIAL`.
    pub fn generate() -> Self {
        Self(NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProductId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// A catalog product
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,

    pub sku: String,

    pub name: String,

    /// Unit price in cents
    pub price_cents: i64,

    /// General stock; authoritative only when no variant option is involved
    pub stock: i32,

    /// Inactive products cannot be purchased
    pub active: bool,

    /// Optional variant structure (per-option price and stock)
    pub variants: Option<Variants>,
}

impl Product {
    /// Create an active product without variants
    pub fn new(sku: impl Into<String>, name: impl Into<String>, price_cents: i64, stock: i32) -> Self {
        Self {
            id: ProductId::generate(),
            sku: sku.into(),
            name: name.into(),
            price_cents,
            stock,
            active: true,
            variants: None,
        }
    }

    pub fn with_variants(mut self, variants: Variants) -> Self {
        self.variants = Some(variants);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Whether at least one unit can be sold
    pub fn is_available(&self) -> bool {
        match &self.variants {
            Some(variants) if !variants.options.is_empty() => variants
                .options
                .iter()
                .any(|option| option.available_stock() > 0),
            _ => self.stock > 0,
        }
    }
}

/// Variant structure stored alongside a product
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Variants {
    /// Variant dimension (e.g. "ram", "color")
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Human-readable dimension name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub options: Vec<VariantOption>,

    /// Id of the option preselected in the storefront
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl Variants {
    /// Find an option by id, falling back to its name
    pub fn find_option(&self, key: &str) -> Option<&VariantOption> {
        self.options
            .iter()
            .find(|option| option.id == key)
            .or_else(|| self.options.iter().find(|option| option.name == key))
    }

    /// Mutable lookup with the same id-then-name rule
    pub fn find_option_mut(&mut self, key: &str) -> Option<&mut VariantOption> {
        let index = self
            .options
            .iter()
            .position(|option| option.id == key)
            .or_else(|| self.options.iter().position(|option| option.name == key))?;
        self.options.get_mut(index)
    }
}

/// One purchasable configuration of a product
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantOption {
    pub id: String,

    pub name: String,

    /// Unit price in cents; the product price applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock: Option<i32>,

    /// Derived availability flag, kept in sync with `stock`
    #[serde(default)]
    pub in_stock: bool,
}

impl VariantOption {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: Option<i64>, stock: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            stock: Some(stock),
            in_stock: stock > 0,
        }
    }

    /// Numeric stock, honouring options that only carry the `inStock` flag
    pub fn available_stock(&self) -> i32 {
        self.stock.unwrap_or(if self.in_stock {
            LEGACY_IN_STOCK_QUANTITY
        } else {
            0
        })
    }

    pub fn unit_price(&self, product_price: i64) -> i64 {
        self.price.unwrap_or(product_price)
    }

    /// Decrement with a floor at zero and recompute `in_stock`
    pub fn decrement(&mut self, quantity: i32) -> i32 {
        self.set_stock(clamped_decrement(self.available_stock(), quantity))
    }

    /// Add units back and recompute `in_stock`
    pub fn restore(&mut self, quantity: i32) -> i32 {
        self.set_stock(self.available_stock().saturating_add(quantity))
    }

    fn set_stock(&mut self, stock: i32) -> i32 {
        self.stock = Some(stock);
        self.in_stock = stock > 0;
        stock
    }
}

/// Order lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Disputed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "processing" => Some(OrderStatus::Processing),
            "shipped" => Some(OrderStatus::Shipped),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            "disputed" => Some(OrderStatus::Disputed),
            _ => None,
        }
    }

    /// Status after a successful payment: only `pending` is promoted
    pub fn after_payment_succeeded(self) -> Self {
        match self {
            OrderStatus::Pending => OrderStatus::Processing,
            other => other,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment status tracked on an order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "succeeded" => Some(PaymentStatus::Succeeded),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A customer, keyed by email
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub email: String,
    pub provider_customer_id: Option<String>,
    pub name: Option<String>,
}

/// Shipping address captured from a completed checkout
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub state: Option<String>,
    pub postal_code: String,
    pub country: String,
}

impl ShippingAddress {
    /// Single street line (`line1, line2`)
    pub fn street(&self) -> String {
        match self.line2.as_deref().filter(|line| !line.is_empty()) {
            Some(line2) => format!("{}, {}", self.line1, line2),
            None => self.line1.clone(),
        }
    }
}

/// A persisted order
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    pub customer_id: Option<i64>,
    pub session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
    /// ISO currency code, upper case
    pub currency: String,
    /// Internal operator notes (never exposed to customers)
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Append a line to the internal notes
    pub fn append_note(&mut self, note: &str) {
        self.notes = Some(match self.notes.take() {
            Some(existing) => format!("{existing}\n{note}"),
            None => note.to_string(),
        });
    }
}

/// Order fields derived from a completed checkout session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOrder {
    pub order_number: String,
    pub customer_id: Option<i64>,
    pub session_id: String,
    pub payment_intent_id: Option<String>,
    /// Initial status; replaces an existing order's status only while it is `pending`
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
    pub currency: String,
}

impl NewOrder {
    /// `ORD-<yyyymmddHHMMSS>-<last 8 chars of the session id>`
    pub fn order_number_for(session_id: &str, now: DateTime<Utc>) -> String {
        let start = session_id.len().saturating_sub(8);
        let suffix = session_id.get(start..).unwrap_or(session_id);
        format!("ORD-{}-{}", now.format("%Y%m%d%H%M%S"), suffix)
    }
}

/// Result of an order upsert keyed by session id
#[derive(Clone, Debug)]
pub struct UpsertedOrder {
    pub order: Order,
    /// `false` when an order for the session already existed
    pub created: bool,
}

/// An order status change together with the status it replaced
#[derive(Clone, Debug)]
pub struct StatusTransition {
    pub order: Order,
    pub previous_status: OrderStatus,
}

/// Snapshot of a purchased line, independent of later catalog changes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    /// Provider line item id; unique within an order
    pub line_item_id: String,
    pub product_id: Option<ProductId>,
    pub variant_option_id: Option<String>,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub total_price_cents: i64,
    /// Whether this line's quantity has been taken out of catalog stock
    pub stock_applied: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOrderItem {
    pub order_id: i64,
    pub line_item_id: String,
    pub product_id: Option<ProductId>,
    pub variant_option_id: Option<String>,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

impl NewOrderItem {
    pub fn total_price_cents(&self) -> i64 {
        self.unit_price_cents.saturating_mul(i64::from(self.quantity))
    }
}

/// Webhook event as recorded in the ledger
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Provider event id (globally unique)
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    /// Last dispatch failure, kept for operators
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Outcome of inserting an event into the ledger
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// Another delivery recorded the same event id first
    AlreadyRecorded,
}
