//! In-memory Order Ledger

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::OrderLedger;
use crate::error::Result;
use crate::model::{
    Customer, NewOrder, NewOrderItem, Order, OrderItem, OrderStatus, PaymentEvent, PaymentStatus,
    RecordOutcome, ShippingAddress, StatusTransition, UpsertedOrder,
};

#[derive(Default)]
struct LedgerState {
    events: HashMap<String, PaymentEvent>,
    customers: Vec<Customer>,
    addresses: HashMap<i64, ShippingAddress>,
    orders: Vec<Order>,
    items: Vec<OrderItem>,
    next_id: i64,
}

impl LedgerState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn order_by_payment_intent(&mut self, payment_intent_id: &str) -> Option<&mut Order> {
        self.orders
            .iter_mut()
            .find(|order| order.payment_intent_id.as_deref() == Some(payment_intent_id))
    }
}

/// Ledger held behind a single mutex
#[derive(Default)]
pub struct MemoryOrderLedger {
    state: Mutex<LedgerState>,
}

impl MemoryOrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All orders, oldest first
    pub async fn orders(&self) -> Vec<Order> {
        self.state.lock().await.orders.clone()
    }

    pub async fn shipping_address(&self, customer_id: i64) -> Option<ShippingAddress> {
        self.state.lock().await.addresses.get(&customer_id).cloned()
    }

    /// Overwrite an order's internal notes (fixture helper)
    pub async fn set_notes(&self, order_id: i64, notes: &str) {
        if let Some(order) = self
            .state
            .lock()
            .await
            .orders
            .iter_mut()
            .find(|order| order.id == order_id)
        {
            order.notes = Some(notes.to_string());
        }
    }
}

#[async_trait]
impl OrderLedger for MemoryOrderLedger {
    async fn find_event(&self, event_id: &str) -> Result<Option<PaymentEvent>> {
        Ok(self.state.lock().await.events.get(event_id).cloned())
    }

    async fn record_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<RecordOutcome> {
        let mut state = self.state.lock().await;
        if state.events.contains_key(event_id) {
            return Ok(RecordOutcome::AlreadyRecorded);
        }
        state.events.insert(
            event_id.to_string(),
            PaymentEvent {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                payload: payload.clone(),
                processed: false,
                last_error: None,
                received_at: Utc::now(),
                processed_at: None,
            },
        );
        Ok(RecordOutcome::Recorded)
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        if let Some(event) = self.state.lock().await.events.get_mut(event_id) {
            event.processed = true;
            event.last_error = None;
            event.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_event_failed(&self, event_id: &str, error: &str) -> Result<()> {
        if let Some(event) = self.state.lock().await.events.get_mut(event_id) {
            event.processed = false;
            event.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn upsert_customer(
        &self,
        email: &str,
        provider_customer_id: Option<&str>,
        name: Option<&str>,
    ) -> Result<Customer> {
        let mut state = self.state.lock().await;
        if let Some(customer) = state.customers.iter_mut().find(|c| c.email == email) {
            if customer.provider_customer_id.is_none() {
                customer.provider_customer_id = provider_customer_id.map(str::to_string);
            }
            if customer.name.as_deref().is_none_or(str::is_empty) {
                customer.name = name.map(str::to_string);
            }
            return Ok(customer.clone());
        }

        let customer = Customer {
            id: state.next_id(),
            email: email.to_string(),
            provider_customer_id: provider_customer_id.map(str::to_string),
            name: name.map(str::to_string),
        };
        state.customers.push(customer.clone());
        Ok(customer)
    }

    async fn find_customer(&self, id: i64) -> Result<Option<Customer>> {
        Ok(self
            .state
            .lock()
            .await
            .customers
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn save_shipping_address(
        &self,
        customer_id: i64,
        address: &ShippingAddress,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.addresses.contains_key(&customer_id) {
            return Ok(false);
        }
        state.addresses.insert(customer_id, address.clone());
        Ok(true)
    }

    async fn upsert_order(&self, new: &NewOrder) -> Result<UpsertedOrder> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(order) = state
            .orders
            .iter_mut()
            .find(|order| order.session_id.as_deref() == Some(new.session_id.as_str()))
        {
            if order.status == OrderStatus::Pending {
                order.status = new.status;
            }
            if order.payment_status == PaymentStatus::Pending {
                order.payment_status = new.payment_status;
            }
            if new.payment_intent_id.is_some() {
                order.payment_intent_id.clone_from(&new.payment_intent_id);
            }
            order.customer_id = new.customer_id.or(order.customer_id);
            order.subtotal_cents = new.subtotal_cents;
            order.tax_cents = new.tax_cents;
            order.shipping_cents = new.shipping_cents;
            order.total_cents = new.total_cents;
            order.currency.clone_from(&new.currency);
            order.updated_at = now;
            return Ok(UpsertedOrder {
                order: order.clone(),
                created: false,
            });
        }

        let order = Order {
            id: state.next_id(),
            order_number: new.order_number.clone(),
            customer_id: new.customer_id,
            session_id: Some(new.session_id.clone()),
            payment_intent_id: new.payment_intent_id.clone(),
            status: new.status,
            payment_status: new.payment_status,
            subtotal_cents: new.subtotal_cents,
            tax_cents: new.tax_cents,
            shipping_cents: new.shipping_cents,
            total_cents: new.total_cents,
            currency: new.currency.clone(),
            notes: None,
            created_at: now,
            updated_at: now,
        };
        state.orders.push(order.clone());
        Ok(UpsertedOrder {
            order,
            created: true,
        })
    }

    async fn add_order_item(&self, item: &NewOrderItem) -> Result<OrderItem> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .items
            .iter()
            .find(|stored| stored.order_id == item.order_id && stored.line_item_id == item.line_item_id)
        {
            return Ok(existing.clone());
        }
        let stored = OrderItem {
            id: state.next_id(),
            order_id: item.order_id,
            line_item_id: item.line_item_id.clone(),
            product_id: item.product_id,
            variant_option_id: item.variant_option_id.clone(),
            quantity: item.quantity,
            unit_price_cents: item.unit_price_cents,
            total_price_cents: item.total_price_cents(),
            stock_applied: false,
        };
        state.items.push(stored.clone());
        Ok(stored)
    }

    async fn claim_item_stock(&self, item_id: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .items
            .iter_mut()
            .find(|item| item.id == item_id && !item.stock_applied)
            .map(|item| item.stock_applied = true)
            .is_some())
    }

    async fn release_item_stock(&self, item_id: i64) -> Result<()> {
        if let Some(item) = self
            .state
            .lock()
            .await
            .items
            .iter_mut()
            .find(|item| item.id == item_id)
        {
            item.stock_applied = false;
        }
        Ok(())
    }

    async fn order_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        Ok(self
            .state
            .lock()
            .await
            .items
            .iter()
            .filter(|item| item.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn mark_payment_succeeded(&self, payment_intent_id: &str) -> Result<Option<Order>> {
        let mut state = self.state.lock().await;
        Ok(state.order_by_payment_intent(payment_intent_id).map(|order| {
            order.payment_status = PaymentStatus::Succeeded;
            order.status = order.status.after_payment_succeeded();
            order.updated_at = Utc::now();
            order.clone()
        }))
    }

    async fn mark_payment_failed(
        &self,
        payment_intent_id: &str,
        note: &str,
    ) -> Result<Option<StatusTransition>> {
        let mut state = self.state.lock().await;
        Ok(state.order_by_payment_intent(payment_intent_id).map(|order| {
            let previous_status = order.status;
            order.payment_status = PaymentStatus::Failed;
            order.status = OrderStatus::Cancelled;
            order.append_note(note);
            order.updated_at = Utc::now();
            StatusTransition {
                order: order.clone(),
                previous_status,
            }
        }))
    }

    async fn mark_disputed(&self, payment_intent_id: &str, note: &str) -> Result<Option<Order>> {
        let mut state = self.state.lock().await;
        Ok(state.order_by_payment_intent(payment_intent_id).map(|order| {
            order.status = OrderStatus::Disputed;
            order.append_note(note);
            order.updated_at = Utc::now();
            order.clone()
        }))
    }

    async fn find_order_by_session(&self, session_id: &str) -> Result<Option<Order>> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .iter()
            .find(|order| order.session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn find_order_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<Order>> {
        Ok(self
            .state
            .lock()
            .await
            .order_by_payment_intent(payment_intent_id)
            .map(|order| order.clone()))
    }

    async fn find_order_by_reference(&self, reference: &str) -> Result<Option<Order>> {
        let numeric = reference.parse::<i64>().ok();
        Ok(self
            .state
            .lock()
            .await
            .orders
            .iter()
            .find(|order| Some(order.id) == numeric || order.order_number == reference)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_order(session_id: &str) -> NewOrder {
        NewOrder {
            order_number: format!("ORD-20250101000000-{session_id}"),
            customer_id: None,
            session_id: session_id.to_string(),
            payment_intent_id: Some("pi_1".into()),
            status: OrderStatus::Processing,
            payment_status: PaymentStatus::Succeeded,
            subtotal_cents: 2000,
            tax_cents: 0,
            shipping_cents: 0,
            total_cents: 2000,
            currency: "EUR".into(),
        }
    }

    #[tokio::test]
    async fn test_record_event_once() {
        let ledger = MemoryOrderLedger::new();
        let payload = json!({"id": "evt_123"});

        assert_eq!(
            ledger.record_event("evt_123", "checkout.session.completed", &payload).await.unwrap(),
            RecordOutcome::Recorded
        );
        assert_eq!(
            ledger.record_event("evt_123", "checkout.session.completed", &payload).await.unwrap(),
            RecordOutcome::AlreadyRecorded
        );

        ledger.mark_event_failed("evt_123", "db down").await.unwrap();
        let event = ledger.find_event("evt_123").await.unwrap().unwrap();
        assert!(!event.processed);
        assert_eq!(event.last_error.as_deref(), Some("db down"));

        ledger.mark_event_processed("evt_123").await.unwrap();
        let event = ledger.find_event("evt_123").await.unwrap().unwrap();
        assert!(event.processed);
        assert!(event.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_order_items_keyed_by_line_item() {
        let ledger = MemoryOrderLedger::new();
        let order = ledger.upsert_order(&new_order("cs_1")).await.unwrap().order;
        let item = NewOrderItem {
            order_id: order.id,
            line_item_id: "li_1".into(),
            product_id: None,
            variant_option_id: None,
            quantity: 2,
            unit_price_cents: 1000,
        };

        let first = ledger.add_order_item(&item).await.unwrap();
        let again = ledger.add_order_item(&item).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(ledger.order_items(order.id).await.unwrap().len(), 1);

        assert!(ledger.claim_item_stock(first.id).await.unwrap());
        assert!(!ledger.claim_item_stock(first.id).await.unwrap());
        ledger.release_item_stock(first.id).await.unwrap();
        assert!(ledger.claim_item_stock(first.id).await.unwrap());
        assert!(ledger.order_items(order.id).await.unwrap()[0].stock_applied);
    }

    #[tokio::test]
    async fn test_upsert_order_keyed_by_session() {
        let ledger = MemoryOrderLedger::new();
        let first = ledger.upsert_order(&new_order("cs_1")).await.unwrap();
        assert!(first.created);

        let second = ledger.upsert_order(&new_order("cs_1")).await.unwrap();
        assert!(!second.created);
        assert_eq!(first.order.id, second.order.id);
        assert_eq!(ledger.orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_customer_keeps_name() {
        let ledger = MemoryOrderLedger::new();
        let a = ledger.upsert_customer("ana@example.com", None, Some("Ana")).await.unwrap();
        let b = ledger.upsert_customer("ana@example.com", Some("cus_1"), None).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.name.as_deref(), Some("Ana"));
        assert_eq!(b.provider_customer_id.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn test_payment_transitions() {
        let ledger = MemoryOrderLedger::new();
        let mut pending = new_order("cs_2");
        pending.status = OrderStatus::Pending;
        pending.payment_status = PaymentStatus::Pending;
        ledger.upsert_order(&pending).await.unwrap();

        let order = ledger.mark_payment_succeeded("pi_1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(order.payment_status, PaymentStatus::Succeeded);

        let transition = ledger
            .mark_payment_failed("pi_1", "Payment failed: card declined")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transition.previous_status, OrderStatus::Processing);
        assert_eq!(transition.order.status, OrderStatus::Cancelled);

        let again = ledger.mark_payment_failed("pi_1", "again").await.unwrap().unwrap();
        assert_eq!(again.previous_status, OrderStatus::Cancelled);

        assert!(ledger.mark_payment_succeeded("pi_unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_reference() {
        let ledger = MemoryOrderLedger::new();
        let order = ledger.upsert_order(&new_order("cs_3")).await.unwrap().order;

        let by_id = ledger.find_order_by_reference(&order.id.to_string()).await.unwrap();
        let by_number = ledger.find_order_by_reference(&order.order_number).await.unwrap();
        assert_eq!(by_id.map(|o| o.id), Some(order.id));
        assert_eq!(by_number.map(|o| o.id), Some(order.id));
        assert!(ledger.find_order_by_reference("ORD-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_shipping_address_per_customer() {
        let ledger = MemoryOrderLedger::new();
        let address = ShippingAddress {
            line1: "Calle Mayor 1".into(),
            city: "Madrid".into(),
            postal_code: "28013".into(),
            country: "ES".into(),
            ..Default::default()
        };
        assert!(ledger.save_shipping_address(1, &address).await.unwrap());
        assert!(!ledger.save_shipping_address(1, &address).await.unwrap());
    }
}
