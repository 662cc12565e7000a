//! Order/Event Ledger
//!
//! Durable record of webhook events (for deduplication and audit),
//! customers, orders and their item snapshots.

mod memory;

pub use memory::MemoryOrderLedger;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::model::{
    Customer, NewOrder, NewOrderItem, Order, OrderItem, PaymentEvent, RecordOutcome,
    ShippingAddress, StatusTransition, UpsertedOrder,
};

/// Ledger trait
///
/// Implementations must keep `event_id` unique: two concurrent
/// `record_event` calls for the same id yield exactly one `Recorded`.
#[async_trait]
pub trait OrderLedger: Send + Sync {
    // --- events ---

    async fn find_event(&self, event_id: &str) -> Result<Option<PaymentEvent>>;

    /// Insert the event with `processed = false`
    async fn record_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<RecordOutcome>;

    /// Set `processed = true` and stamp `processed_at`
    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;

    /// Keep the event unprocessed and store the failure detail
    async fn mark_event_failed(&self, event_id: &str, error: &str) -> Result<()>;

    // --- customers ---

    /// Insert or update a customer keyed by email.
    ///
    /// Existing non-empty name and provider id are kept when the new
    /// values are absent.
    async fn upsert_customer(
        &self,
        email: &str,
        provider_customer_id: Option<&str>,
        name: Option<&str>,
    ) -> Result<Customer>;

    async fn find_customer(&self, id: i64) -> Result<Option<Customer>>;

    /// Store the customer's shipping address unless one already exists.
    ///
    /// Returns `true` when the address was stored.
    async fn save_shipping_address(
        &self,
        customer_id: i64,
        address: &ShippingAddress,
    ) -> Result<bool>;

    // --- orders ---

    /// Create the order for a session, or update the existing one
    async fn upsert_order(&self, order: &NewOrder) -> Result<UpsertedOrder>;

    /// Record a line item, keyed by `(order_id, line_item_id)`.
    ///
    /// A second call for the same key returns the stored item unchanged.
    async fn add_order_item(&self, item: &NewOrderItem) -> Result<OrderItem>;

    /// Flip `stock_applied` from `false` to `true`.
    ///
    /// Returns `false` when the flag was already set, so exactly one caller
    /// gets to decrement stock for the item.
    async fn claim_item_stock(&self, item_id: i64) -> Result<bool>;

    /// Reset `stock_applied` after a failed stock update
    async fn release_item_stock(&self, item_id: i64) -> Result<()>;

    async fn order_items(&self, order_id: i64) -> Result<Vec<OrderItem>>;

    /// `payment_status = succeeded`; `pending` orders move to `processing`.
    ///
    /// `None` when no order carries the payment intent.
    async fn mark_payment_succeeded(&self, payment_intent_id: &str) -> Result<Option<Order>>;

    /// `payment_status = failed`, `status = cancelled`, note appended.
    ///
    /// Returns the updated order with the status it had before.
    async fn mark_payment_failed(
        &self,
        payment_intent_id: &str,
        note: &str,
    ) -> Result<Option<StatusTransition>>;

    /// `status = disputed`, note appended
    async fn mark_disputed(&self, payment_intent_id: &str, note: &str) -> Result<Option<Order>>;

    async fn find_order_by_session(&self, session_id: &str) -> Result<Option<Order>>;

    async fn find_order_by_payment_intent(&self, payment_intent_id: &str)
    -> Result<Option<Order>>;

    /// Look up by numeric id or by order number
    async fn find_order_by_reference(&self, reference: &str) -> Result<Option<Order>>;
}
