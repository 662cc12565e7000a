//! Stripe Webhook Handling
//!
//! Reconciles asynchronous payment events into orders and stock.
//!
//! Per event id: verify → deduplicate → record (`processed = false`) →
//! dispatch → mark processed, or store the failure and return an error so
//! Stripe redelivers. A redelivered event that already completed is
//! acknowledged without side effects.
//!
//! An event that is recorded but not yet processed carries no claim or
//! lease, so every concurrent redelivery dispatches it again. Handlers stay
//! safe under that: order upserts and line items are keyed, and each line's
//! stock is claimed once through `OrderLedger::claim_item_stock`.

use chrono::Utc;
use std::sync::Arc;
use tracing::Instrument;

use hackeed_core::{
    CatalogStore, NewOrder, NewOrderItem, OrderItem, OrderLedger, OrderStatus, PaymentStatus,
    ProductId, RecordOutcome, VariantStockChange,
};

use crate::error::{PaymentError, Result};
use crate::provider::{LineItemDetails, PaymentProvider};
use crate::signature::{SignatureVerifier, WebhookEvent};

/// Event types the processor acts on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    PaymentIntentSucceeded,
    PaymentIntentFailed,
    ChargeDisputeCreated,
    /// Invoice and subscription lifecycle; acknowledged only
    Billing,
    Unknown,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "payment_intent.succeeded" => EventKind::PaymentIntentSucceeded,
            "payment_intent.payment_failed" => EventKind::PaymentIntentFailed,
            "charge.dispute.created" => EventKind::ChargeDisputeCreated,
            "invoice.payment_succeeded"
            | "invoice.payment_failed"
            | "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => EventKind::Billing,
            _ => EventKind::Unknown,
        }
    }
}

/// How a delivery was handled; every variant is acknowledged with 200
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Dispatched and side effects applied
    Processed,
    /// Recorded, no handler for the type
    Ignored,
    /// The event id already completed earlier
    AlreadyProcessed,
    /// Another delivery of the same id is in flight
    Duplicate,
}

/// Webhook processor
pub struct WebhookProcessor {
    verifier: SignatureVerifier,
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<dyn OrderLedger>,
    provider: Arc<dyn PaymentProvider>,
}

impl WebhookProcessor {
    pub fn new(
        verifier: SignatureVerifier,
        catalog: Arc<dyn CatalogStore>,
        ledger: Arc<dyn OrderLedger>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self {
            verifier,
            catalog,
            ledger,
            provider,
        }
    }

    /// Verify the raw body and process the event.
    ///
    /// Signature failures return before the ledger is touched.
    pub async fn receive(&self, payload: &[u8], signature: Option<&str>) -> Result<WebhookOutcome> {
        let signature = signature.ok_or_else(|| {
            PaymentError::InvalidSignature("No stripe-signature header value was provided".into())
        })?;
        let event = self.verifier.construct_event(payload, signature).inspect_err(|e| {
            tracing::warn!(error = %e, "Webhook signature verification failed");
        })?;
        self.process(&event).await
    }

    /// Process a verified event
    pub async fn process(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let span = tracing::info_span!("webhook", event_id = %event.id, event_type = %event.event_type);
        self.process_recorded(event).instrument(span).await
    }

    /// Unprocessed events are re-dispatched by every delivery that sees them
    async fn process_recorded(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        match self.ledger.find_event(&event.id).await? {
            Some(existing) if existing.processed => {
                tracing::info!(event_id = %event.id, "Event already processed");
                return Ok(WebhookOutcome::AlreadyProcessed);
            }
            Some(existing) => {
                tracing::warn!(
                    event_id = %event.id,
                    last_error = existing.last_error.as_deref().unwrap_or(""),
                    "Retrying event that did not complete"
                );
            }
            None => {
                let recorded = self
                    .ledger
                    .record_event(&event.id, &event.event_type, &event.payload)
                    .await?;
                if recorded == RecordOutcome::AlreadyRecorded {
                    tracing::info!(event_id = %event.id, "Concurrent delivery already recorded");
                    return Ok(WebhookOutcome::Duplicate);
                }
            }
        }

        match self.dispatch(event).await {
            Ok(outcome) => {
                self.ledger.mark_event_processed(&event.id).await?;
                tracing::info!(event_id = %event.id, outcome = ?outcome, "Event processed");
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(event_id = %event.id, error = %err, "Event processing failed");
                if let Err(mark_err) = self.ledger.mark_event_failed(&event.id, &err.to_string()).await {
                    tracing::error!(
                        event_id = %event.id,
                        error = %mark_err,
                        "Could not store event failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        match EventKind::from_type(&event.event_type) {
            EventKind::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            EventKind::PaymentIntentSucceeded => self.handle_payment_succeeded(event).await,
            EventKind::PaymentIntentFailed => self.handle_payment_failed(event).await,
            EventKind::ChargeDisputeCreated => self.handle_dispute_created(event).await,
            EventKind::Billing => {
                tracing::info!(
                    event_type = %event.event_type,
                    object_id = event.object_str("id").unwrap_or(""),
                    "Billing event acknowledged"
                );
                Ok(WebhookOutcome::Ignored)
            }
            EventKind::Unknown => {
                tracing::debug!(event_type = %event.event_type, "Unhandled webhook event");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let session_id = event.object_id()?;
        let session = self.provider.retrieve_session(session_id).await?;
        let line_items = self.provider.list_line_items(session_id).await?;

        let customer = match session.email() {
            Some(email) => Some(
                self.ledger
                    .upsert_customer(email, session.customer.as_deref(), session.customer_name())
                    .await?,
            ),
            None => {
                tracing::warn!(session_id, "Completed session without customer email");
                None
            }
        };

        let (status, payment_status) = if session.is_paid() {
            (OrderStatus::Processing, PaymentStatus::Succeeded)
        } else {
            (OrderStatus::Pending, PaymentStatus::Pending)
        };
        // Totals are the provider's settled amounts, not recomputed here
        let total_cents = session.amount_total.unwrap_or(0);
        let new_order = NewOrder {
            order_number: NewOrder::order_number_for(&session.id, Utc::now()),
            customer_id: customer.as_ref().map(|c| c.id),
            session_id: session.id.clone(),
            payment_intent_id: session.payment_intent.clone(),
            status,
            payment_status,
            subtotal_cents: session.amount_subtotal.unwrap_or(total_cents),
            tax_cents: session.amount_tax(),
            shipping_cents: session.amount_shipping(),
            total_cents,
            currency: session.currency.as_deref().unwrap_or("eur").to_ascii_uppercase(),
        };

        let upserted = self.ledger.upsert_order(&new_order).await?;
        let order = upserted.order;

        for item in &line_items {
            self.reconcile_line_item(order.id, item).await?;
        }

        if let (Some(customer), Some(address)) = (&customer, session.shipping_address()) {
            if self.ledger.save_shipping_address(customer.id, &address).await? {
                tracing::debug!(customer_id = customer.id, "Shipping address stored");
            }
        }

        tracing::info!(
            order_id = order.id,
            order_number = %order.order_number,
            session_id,
            created = upserted.created,
            items = line_items.len(),
            total_cents = order.total_cents,
            "Order recorded from checkout session"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// Snapshot one line item and decrement the stock it drew from.
    ///
    /// Safe to repeat: the item is keyed by its provider line item id and
    /// the decrement runs only for the caller that claims the item's stock.
    /// A failed decrement releases the claim so a redelivery applies it.
    async fn reconcile_line_item(&self, order_id: i64, item: &LineItemDetails) -> Result<()> {
        let quantity = i32::try_from(item.quantity()).map_err(|_| {
            PaymentError::InvalidPayload(format!("line item {} quantity out of range", item.id))
        })?;
        let product_id = self.resolve_product(item).await?;

        let stored = self
            .ledger
            .add_order_item(&NewOrderItem {
                order_id,
                line_item_id: item.id.clone(),
                product_id,
                variant_option_id: item.product_metadata("variant_option_id").map(str::to_string),
                quantity,
                unit_price_cents: item.unit_amount(),
            })
            .await?;

        if stored.product_id.is_none() {
            tracing::warn!(
                order_id,
                line_item = %item.id,
                name = item.product_name().unwrap_or(""),
                "Line item matches no catalog product; stock not decremented"
            );
            return Ok(());
        }

        if !self.ledger.claim_item_stock(stored.id).await? {
            tracing::debug!(order_id, line_item = %item.id, "Stock already applied for line item");
            return Ok(());
        }

        if let Err(e) = self.decrement_item_stock(&stored).await {
            if let Err(release) = self.ledger.release_item_stock(stored.id).await {
                tracing::error!(
                    order_id,
                    line_item = %item.id,
                    error = %release,
                    "Could not release stock claim; line needs manual adjustment"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    async fn decrement_item_stock(&self, item: &OrderItem) -> Result<()> {
        let Some(product_id) = item.product_id else {
            return Ok(());
        };
        let quantity = item.quantity;

        match &item.variant_option_id {
            Some(option_id) => {
                match self
                    .catalog
                    .decrement_variant_stock(&product_id, option_id, quantity)
                    .await?
                {
                    VariantStockChange::Applied { stock } => tracing::info!(
                        product_id = %product_id,
                        variant_option_id = %option_id,
                        quantity,
                        stock,
                        "Variant stock decremented"
                    ),
                    missing => tracing::warn!(
                        product_id = %product_id,
                        variant_option_id = %option_id,
                        result = ?missing,
                        "Variant option not found; stock not decremented"
                    ),
                }
            }
            None => match self.catalog.decrement_stock(&product_id, quantity).await? {
                Some(stock) => tracing::info!(
                    product_id = %product_id,
                    quantity,
                    stock,
                    "Stock decremented"
                ),
                None => tracing::warn!(product_id = %product_id, "Product vanished before decrement"),
            },
        }
        Ok(())
    }

    /// Product id from line metadata, falling back to an exact name match
    async fn resolve_product(&self, item: &LineItemDetails) -> Result<Option<ProductId>> {
        if let Some(raw) = item.product_metadata("product_id") {
            match raw.parse::<ProductId>() {
                Ok(id) => {
                    if self.catalog.get_product(&id).await?.is_some() {
                        return Ok(Some(id));
                    }
                    tracing::warn!(product_id = raw, "Line item references unknown product");
                }
                Err(_) => tracing::warn!(product_id = raw, "Line item carries malformed product id"),
            }
            return Ok(None);
        }

        match item.product_name() {
            Some(name) => Ok(self.catalog.find_product_by_name(name).await?.map(|p| p.id)),
            None => Ok(None),
        }
    }

    async fn handle_payment_succeeded(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let payment_intent_id = event.object_id()?;
        match self.ledger.mark_payment_succeeded(payment_intent_id).await? {
            Some(order) => tracing::info!(
                order_id = order.id,
                payment_intent_id,
                status = %order.status,
                "Payment succeeded"
            ),
            None => tracing::warn!(payment_intent_id, "Payment succeeded for unknown order"),
        }
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_payment_failed(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let payment_intent_id = event.object_id()?;
        let reason = event
            .data
            .object
            .pointer("/last_payment_error/message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("Unknown error");
        let note = format!("Payment failed: {reason}");

        let Some(transition) = self.ledger.mark_payment_failed(payment_intent_id, &note).await? else {
            tracing::warn!(payment_intent_id, "Payment failed for unknown order");
            return Ok(WebhookOutcome::Processed);
        };
        let order = transition.order;

        if transition.previous_status == OrderStatus::Cancelled {
            tracing::info!(order_id = order.id, "Order already cancelled; stock not restored again");
            return Ok(WebhookOutcome::Processed);
        }

        let items = self.ledger.order_items(order.id).await?;
        let mut restored = 0;
        for item in items.iter().filter(|item| item.stock_applied) {
            let Some(product_id) = item.product_id else {
                continue;
            };
            restored += 1;
            match &item.variant_option_id {
                Some(option_id) => {
                    let change = self
                        .catalog
                        .restore_variant_stock(&product_id, option_id, item.quantity)
                        .await?;
                    if !matches!(change, VariantStockChange::Applied { .. }) {
                        tracing::warn!(
                            product_id = %product_id,
                            variant_option_id = %option_id,
                            "Variant option not found; stock not restored"
                        );
                    }
                }
                None => {
                    self.catalog.restore_stock(&product_id, item.quantity).await?;
                }
            }
        }

        tracing::info!(
            order_id = order.id,
            payment_intent_id,
            restored_items = restored,
            "Payment failed; order cancelled and stock restored"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_dispute_created(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let Some(payment_intent_id) = event.object_str("payment_intent") else {
            tracing::warn!(dispute_id = event.object_str("id").unwrap_or(""), "Dispute without payment intent");
            return Ok(WebhookOutcome::Processed);
        };
        let reason = event.object_str("reason").unwrap_or("unknown");
        let note = format!("Charge disputed: {reason}");

        match self.ledger.mark_disputed(payment_intent_id, &note).await? {
            Some(order) => tracing::warn!(order_id = order.id, payment_intent_id, reason, "Charge disputed"),
            None => tracing::warn!(payment_intent_id, "Dispute for unknown order"),
        }
        Ok(WebhookOutcome::Processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{CheckoutRequest, CheckoutService, CheckoutSettings};
    use crate::provider::{
        Address, MockFailure, MockPaymentProvider, PriceDetails, ProductDetails, ProductRef,
        SessionDetails, ShippingDetails,
    };
    use async_trait::async_trait;
    use hackeed_core::{
        CartLine, CartValidator, CoreError, MemoryCatalogStore, MemoryOrderLedger, Product,
        VariantOption, Variants,
    };
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SECRET: &str = "whsec_test_secret";

    struct Harness {
        processor: WebhookProcessor,
        checkout: CheckoutService,
        catalog: Arc<MemoryCatalogStore>,
        ledger: Arc<MemoryOrderLedger>,
        provider: Arc<MockPaymentProvider>,
    }

    fn harness(products: Vec<Product>) -> Harness {
        let catalog = Arc::new(MemoryCatalogStore::with_products(products));
        harness_with_store(catalog.clone(), catalog)
    }

    /// Webhooks go through `store`; checkout and assertions use `catalog`
    fn harness_with_store(catalog: Arc<MemoryCatalogStore>, store: Arc<dyn CatalogStore>) -> Harness {
        let ledger = Arc::new(MemoryOrderLedger::new());
        let provider = Arc::new(MockPaymentProvider::new());
        let processor = WebhookProcessor::new(
            SignatureVerifier::new(SecretString::from(SECRET.to_string())),
            store,
            ledger.clone(),
            provider.clone(),
        );
        let checkout = CheckoutService::new(
            CartValidator::new(catalog.clone()),
            provider.clone(),
            CheckoutSettings::from_base_url("http://localhost:8888"),
        );
        Harness {
            processor,
            checkout,
            catalog,
            ledger,
            provider,
        }
    }

    fn signed(body: &Value) -> (Vec<u8>, String) {
        let payload = serde_json::to_vec(body).unwrap();
        let header = SignatureVerifier::new(SecretString::from(SECRET.to_string()))
            .sign(&payload, Utc::now().timestamp())
            .unwrap();
        (payload, header)
    }

    fn event(id: &str, event_type: &str, object: Value) -> Value {
        json!({
            "id": id,
            "object": "event",
            "type": event_type,
            "created": Utc::now().timestamp(),
            "livemode": false,
            "data": {"object": object}
        })
    }

    async fn deliver(h: &Harness, body: &Value) -> Result<WebhookOutcome> {
        let (payload, header) = signed(body);
        h.processor.receive(&payload, Some(&header)).await
    }

    /// Checkout through the mock provider and complete the session
    async fn paid_session(h: &Harness, items: Vec<CartLine>, payment_intent: &str) -> String {
        let session = h
            .checkout
            .create_session(&CheckoutRequest {
                items,
                customer_email: Some("ana@example.com".into()),
            })
            .await
            .unwrap();
        h.provider.complete_session(&session.id, payment_intent).await.unwrap();
        session.id
    }

    async fn stock(h: &Harness, product: &Product) -> i32 {
        h.catalog.product(&product.id).await.unwrap().stock
    }

    #[tokio::test]
    async fn test_checkout_completed_decrements_stock() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let h = harness(vec![p1.clone()]);
        let session_id = paid_session(&h, vec![CartLine::new(p1.id.to_string(), 2)], "pi_1").await;

        let outcome = deliver(
            &h,
            &event("evt_1", "checkout.session.completed", json!({"id": session_id})),
        )
        .await
        .unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(stock(&h, &p1).await, 3);

        let orders = h.ledger.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Processing);
        assert_eq!(orders[0].payment_status, PaymentStatus::Succeeded);
        assert_eq!(orders[0].total_cents, 2000);
        assert_eq!(orders[0].currency, "EUR");
        assert_eq!(orders[0].payment_intent_id.as_deref(), Some("pi_1"));
        assert!(orders[0].order_number.starts_with("ORD-"));

        let items = h.ledger.order_items(orders[0].id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].product_id, Some(p1.id));
        assert_eq!(items[0].unit_price_cents, 1000);
        assert_eq!(items[0].total_price_cents, 2000);

        let event = h.ledger.find_event("evt_1").await.unwrap().unwrap();
        assert!(event.processed);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_has_no_second_effect() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let h = harness(vec![p1.clone()]);
        let session_id = paid_session(&h, vec![CartLine::new(p1.id.to_string(), 2)], "pi_1").await;
        let body = event("evt_123", "checkout.session.completed", json!({"id": session_id}));

        assert_eq!(deliver(&h, &body).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(deliver(&h, &body).await.unwrap(), WebhookOutcome::AlreadyProcessed);

        assert_eq!(stock(&h, &p1).await, 3);
        assert_eq!(h.ledger.orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_events_for_same_session_do_not_double_decrement() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let h = harness(vec![p1.clone()]);
        let session_id = paid_session(&h, vec![CartLine::new(p1.id.to_string(), 2)], "pi_1").await;

        deliver(&h, &event("evt_a", "checkout.session.completed", json!({"id": session_id})))
            .await
            .unwrap();
        deliver(&h, &event("evt_b", "checkout.session.completed", json!({"id": session_id})))
            .await
            .unwrap();

        assert_eq!(stock(&h, &p1).await, 3);
        let orders = h.ledger.orders().await;
        assert_eq!(h.ledger.order_items(orders[0].id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stock_floor() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 3);
        let h = harness(vec![p1.clone()]);
        let session_id = paid_session(&h, vec![CartLine::new(p1.id.to_string(), 3)], "pi_1").await;
        // stock sold elsewhere between checkout and webhook
        h.catalog.decrement_stock(&p1.id, 2).await.unwrap();

        deliver(&h, &event("evt_1", "checkout.session.completed", json!({"id": session_id})))
            .await
            .unwrap();
        assert_eq!(stock(&h, &p1).await, 0);
    }

    #[tokio::test]
    async fn test_variant_stock_decrement() {
        let pi = Product::new("PI5", "Raspberry Pi 5", 7900, 7).with_variants(Variants {
            kind: "ram".into(),
            name: "RAM".into(),
            options: vec![
                VariantOption::new("4gb", "4GB", None, 3),
                VariantOption::new("8gb", "8GB", Some(9900), 2),
            ],
            default: None,
        });
        let h = harness(vec![pi.clone()]);
        let line = CartLine::new(pi.id.to_string(), 2).with_option("8gb");
        let session_id = paid_session(&h, vec![line], "pi_1").await;

        deliver(&h, &event("evt_1", "checkout.session.completed", json!({"id": session_id})))
            .await
            .unwrap();

        let product = h.catalog.product(&pi.id).await.unwrap();
        let options = product.variants.unwrap().options;
        assert_eq!(options[1].stock, Some(0));
        assert!(!options[1].in_stock);
        assert_eq!(options[0].stock, Some(3));
        // general stock is not touched by variant lines
        assert_eq!(product.stock, 7);
    }

    #[tokio::test]
    async fn test_unknown_variant_option_is_skipped() {
        let pi = Product::new("PI5", "Raspberry Pi 5", 7900, 7).with_variants(Variants {
            options: vec![VariantOption::new("8gb", "8GB", None, 2)],
            ..Default::default()
        });
        let h = harness(vec![pi.clone()]);
        let metadata = BTreeMap::from([
            ("product_id".to_string(), pi.id.to_string()),
            ("variant_option_id".to_string(), "16gb".to_string()),
        ]);
        h.provider
            .insert_session(
                SessionDetails {
                    id: "cs_legacy".into(),
                    payment_status: Some("paid".into()),
                    amount_total: Some(7900),
                    currency: Some("eur".into()),
                    payment_intent: Some("pi_9".into()),
                    ..Default::default()
                },
                vec![line_item("li_1", 1, 7900, "Raspberry Pi 5 - 16GB", metadata)],
            )
            .await;

        let outcome = deliver(&h, &event("evt_1", "checkout.session.completed", json!({"id": "cs_legacy"})))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        let options = h.catalog.product(&pi.id).await.unwrap().variants.unwrap().options;
        assert_eq!(options[0].stock, Some(2));
    }

    #[tokio::test]
    async fn test_name_fallback_for_lines_without_product_id() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let h = harness(vec![p1.clone()]);
        h.provider
            .insert_session(
                SessionDetails {
                    id: "cs_old".into(),
                    payment_status: Some("paid".into()),
                    amount_total: Some(4000),
                    customer_email: Some("old@example.com".into()),
                    ..Default::default()
                },
                vec![
                    line_item("li_1", 1, 1000, "Arduino Uno", BTreeMap::new()),
                    line_item("li_2", 1, 3000, "Gift card", BTreeMap::new()),
                ],
            )
            .await;

        deliver(&h, &event("evt_1", "checkout.session.completed", json!({"id": "cs_old"})))
            .await
            .unwrap();

        assert_eq!(stock(&h, &p1).await, 4);
        let order = &h.ledger.orders().await[0];
        let items = h.ledger.order_items(order.id).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].product_id, None);
    }

    #[tokio::test]
    async fn test_payment_failed_restores_stock_once() {
        let p3 = Product::new("SENS", "Sensor kit", 1500, 10);
        let h = harness(vec![p3.clone()]);
        let session_id = paid_session(&h, vec![CartLine::new(p3.id.to_string(), 2)], "pi_3").await;
        deliver(&h, &event("evt_1", "checkout.session.completed", json!({"id": session_id})))
            .await
            .unwrap();
        assert_eq!(stock(&h, &p3).await, 8);

        let failed = json!({"id": "pi_3", "last_payment_error": {"message": "Your card was declined."}});
        let body = event("evt_2", "payment_intent.payment_failed", failed.clone());
        deliver(&h, &body).await.unwrap();
        assert_eq!(stock(&h, &p3).await, 10);

        let order = &h.ledger.orders().await[0];
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.payment_status, PaymentStatus::Failed);
        assert_eq!(order.notes.as_deref(), Some("Payment failed: Your card was declined."));

        // same event redelivered, then a second failure event for the same intent
        assert_eq!(deliver(&h, &body).await.unwrap(), WebhookOutcome::AlreadyProcessed);
        deliver(&h, &event("evt_3", "payment_intent.payment_failed", failed))
            .await
            .unwrap();
        assert_eq!(stock(&h, &p3).await, 10);
    }

    #[tokio::test]
    async fn test_payment_failed_restores_variant_stock() {
        let pi = Product::new("PI5", "Raspberry Pi 5", 7900, 0).with_variants(Variants {
            options: vec![VariantOption::new("8gb", "8GB", Some(9900), 3)],
            ..Default::default()
        });
        let h = harness(vec![pi.clone()]);
        let line = CartLine::new(pi.id.to_string(), 2).with_option("8gb");
        let session_id = paid_session(&h, vec![line], "pi_4").await;
        deliver(&h, &event("evt_1", "checkout.session.completed", json!({"id": session_id})))
            .await
            .unwrap();
        deliver(&h, &event("evt_2", "payment_intent.payment_failed", json!({"id": "pi_4"})))
            .await
            .unwrap();

        let option = &h.catalog.product(&pi.id).await.unwrap().variants.unwrap().options[0];
        assert_eq!(option.stock, Some(3));
        assert!(option.in_stock);
    }

    #[tokio::test]
    async fn test_payment_succeeded_promotes_pending_only() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let h = harness(vec![p1.clone()]);
        h.provider
            .insert_session(
                SessionDetails {
                    id: "cs_async".into(),
                    payment_status: Some("unpaid".into()),
                    payment_intent: Some("pi_5".into()),
                    amount_total: Some(1000),
                    ..Default::default()
                },
                vec![],
            )
            .await;
        deliver(&h, &event("evt_1", "checkout.session.completed", json!({"id": "cs_async"})))
            .await
            .unwrap();
        assert_eq!(h.ledger.orders().await[0].status, OrderStatus::Pending);

        deliver(&h, &event("evt_2", "payment_intent.succeeded", json!({"id": "pi_5"})))
            .await
            .unwrap();
        let order = &h.ledger.orders().await[0];
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(order.payment_status, PaymentStatus::Succeeded);

        // arrives before any order exists: tolerated
        let outcome = deliver(&h, &event("evt_3", "payment_intent.succeeded", json!({"id": "pi_unknown"})))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
    }

    #[tokio::test]
    async fn test_dispute_marks_order() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let h = harness(vec![p1.clone()]);
        let session_id = paid_session(&h, vec![CartLine::new(p1.id.to_string(), 1)], "pi_6").await;
        deliver(&h, &event("evt_1", "checkout.session.completed", json!({"id": session_id})))
            .await
            .unwrap();

        deliver(
            &h,
            &event(
                "evt_2",
                "charge.dispute.created",
                json!({"id": "dp_1", "payment_intent": "pi_6", "reason": "fraudulent"}),
            ),
        )
        .await
        .unwrap();

        let order = &h.ledger.orders().await[0];
        assert_eq!(order.status, OrderStatus::Disputed);
        assert_eq!(order.notes.as_deref(), Some("Charge disputed: fraudulent"));
        assert_eq!(stock(&h, &p1).await, 4);
    }

    #[tokio::test]
    async fn test_unknown_and_billing_events_are_acknowledged() {
        let h = harness(vec![]);
        let outcome = deliver(&h, &event("evt_1", "customer.created", json!({"id": "cus_1"})))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);

        let outcome = deliver(&h, &event("evt_2", "invoice.payment_succeeded", json!({"id": "in_1"})))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert!(h.ledger.find_event("evt_1").await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn test_invalid_signature_touches_nothing() {
        let h = harness(vec![]);
        let body = event("evt_1", "checkout.session.completed", json!({"id": "cs_1"}));
        let payload = serde_json::to_vec(&body).unwrap();
        let header = SignatureVerifier::new(SecretString::from("whsec_wrong".to_string()))
            .sign(&payload, Utc::now().timestamp())
            .unwrap();

        let err = h.processor.receive(&payload, Some(&header)).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidSignature(_)));
        let err = h.processor.receive(&payload, None).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidSignature(_)));
        assert!(h.ledger.find_event("evt_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_retry_completes() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let h = harness(vec![p1.clone()]);
        let session_id = paid_session(&h, vec![CartLine::new(p1.id.to_string(), 2)], "pi_1").await;
        let body = event("evt_1", "checkout.session.completed", json!({"id": session_id}));

        h.provider.fail_next(MockFailure::Connectivity).await;
        let err = deliver(&h, &body).await.unwrap_err();
        assert!(err.is_retryable());

        let recorded = h.ledger.find_event("evt_1").await.unwrap().unwrap();
        assert!(!recorded.processed);
        assert!(recorded.last_error.unwrap().contains("unavailable"));
        assert_eq!(stock(&h, &p1).await, 5);

        assert_eq!(deliver(&h, &body).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(stock(&h, &p1).await, 3);
    }

    /// Catalog whose first `n` general-stock decrements fail
    struct FlakyCatalog {
        inner: Arc<MemoryCatalogStore>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl CatalogStore for FlakyCatalog {
        async fn get_product(&self, id: &ProductId) -> hackeed_core::Result<Option<Product>> {
            self.inner.get_product(id).await
        }

        async fn find_product_by_name(&self, name: &str) -> hackeed_core::Result<Option<Product>> {
            self.inner.find_product_by_name(name).await
        }

        async fn decrement_stock(&self, id: &ProductId, quantity: i32) -> hackeed_core::Result<Option<i32>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(CoreError::Storage("connection reset".into()));
            }
            self.inner.decrement_stock(id, quantity).await
        }

        async fn restore_stock(&self, id: &ProductId, quantity: i32) -> hackeed_core::Result<Option<i32>> {
            self.inner.restore_stock(id, quantity).await
        }

        async fn decrement_variant_stock(
            &self,
            id: &ProductId,
            option_id: &str,
            quantity: i32,
        ) -> hackeed_core::Result<VariantStockChange> {
            self.inner.decrement_variant_stock(id, option_id, quantity).await
        }

        async fn restore_variant_stock(
            &self,
            id: &ProductId,
            option_id: &str,
            quantity: i32,
        ) -> hackeed_core::Result<VariantStockChange> {
            self.inner.restore_variant_stock(id, option_id, quantity).await
        }
    }

    #[tokio::test]
    async fn test_retry_after_partial_failure_applies_every_line_once() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let p2 = Product::new("ESP32", "ESP32 DevKit", 800, 5);
        let catalog = Arc::new(MemoryCatalogStore::with_products([p1.clone(), p2.clone()]));
        let flaky = Arc::new(FlakyCatalog {
            inner: catalog.clone(),
            failures: AtomicUsize::new(0),
        });
        let h = harness_with_store(catalog, flaky.clone());
        let session_id = paid_session(
            &h,
            vec![
                CartLine::new(p1.id.to_string(), 2),
                CartLine::new(p2.id.to_string(), 1),
            ],
            "pi_1",
        )
        .await;
        let body = event("evt_1", "checkout.session.completed", json!({"id": session_id}));

        flaky.failures.store(1, Ordering::SeqCst);
        let err = deliver(&h, &body).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!h.ledger.find_event("evt_1").await.unwrap().unwrap().processed);
        assert_eq!(stock(&h, &p1).await, 5);

        assert_eq!(deliver(&h, &body).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(stock(&h, &p1).await, 3);
        assert_eq!(stock(&h, &p2).await, 4);

        let order = &h.ledger.orders().await[0];
        let items = h.ledger.order_items(order.id).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.stock_applied));

        // a later event for the same session changes nothing
        deliver(&h, &event("evt_2", "checkout.session.completed", json!({"id": session_id})))
            .await
            .unwrap();
        assert_eq!(stock(&h, &p1).await, 3);
        assert_eq!(stock(&h, &p2).await, 4);
    }

    #[tokio::test]
    async fn test_concurrent_redeliveries_apply_stock_once() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let catalog = Arc::new(MemoryCatalogStore::with_products([p1.clone()]));
        let flaky = Arc::new(FlakyCatalog {
            inner: catalog.clone(),
            failures: AtomicUsize::new(1),
        });
        let h = harness_with_store(catalog, flaky);
        let session_id = paid_session(&h, vec![CartLine::new(p1.id.to_string(), 2)], "pi_1").await;
        let body = event("evt_1", "checkout.session.completed", json!({"id": session_id}));
        assert!(deliver(&h, &body).await.is_err());

        let (first, second) = tokio::join!(deliver(&h, &body), deliver(&h, &body));
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(stock(&h, &p1).await, 3);
        let order = &h.ledger.orders().await[0];
        assert_eq!(h.ledger.order_items(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkout_completed_stores_shipping_address() {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let h = harness(vec![p1.clone()]);
        let mut metadata = BTreeMap::new();
        metadata.insert("product_id".to_string(), p1.id.to_string());
        h.provider
            .insert_session(
                SessionDetails {
                    id: "cs_ship".into(),
                    payment_status: Some("paid".into()),
                    payment_intent: Some("pi_ship".into()),
                    amount_total: Some(1000),
                    currency: Some("eur".into()),
                    customer_email: Some("ana@example.com".into()),
                    shipping_details: Some(ShippingDetails {
                        name: Some("Ana".into()),
                        address: Some(Address {
                            line1: Some("Calle Mayor 1".into()),
                            line2: Some("2B".into()),
                            city: Some("Madrid".into()),
                            state: Some("M".into()),
                            postal_code: Some("28013".into()),
                            country: Some("ES".into()),
                        }),
                    }),
                    ..Default::default()
                },
                vec![line_item("li_1", 1, 1000, "Arduino Uno", metadata)],
            )
            .await;

        deliver(&h, &event("evt_1", "checkout.session.completed", json!({"id": "cs_ship"})))
            .await
            .unwrap();

        let order = &h.ledger.orders().await[0];
        let customer_id = order.customer_id.unwrap();
        let address = h.ledger.shipping_address(customer_id).await.unwrap();
        assert_eq!(address.line1, "Calle Mayor 1");
        assert_eq!(address.line2.as_deref(), Some("2B"));
        assert_eq!(address.city, "Madrid");
        assert_eq!(address.postal_code, "28013");
        assert_eq!(address.country, "ES");
        assert_eq!(stock(&h, &p1).await, 4);
    }

    fn line_item(
        id: &str,
        quantity: u64,
        unit_amount: i64,
        name: &str,
        metadata: BTreeMap<String, String>,
    ) -> LineItemDetails {
        LineItemDetails {
            id: id.into(),
            description: Some(name.into()),
            quantity: Some(quantity),
            amount_total: Some(unit_amount * i64::try_from(quantity).unwrap()),
            price: Some(PriceDetails {
                id: None,
                unit_amount: Some(unit_amount),
                product: Some(ProductRef::Object(ProductDetails {
                    id: format!("prod_{id}"),
                    name: Some(name.into()),
                    metadata: Some(metadata),
                })),
            }),
        }
    }
}
