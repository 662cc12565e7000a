//! Order and webhook ledger queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use hackeed_core::{
    Customer, NewOrder, NewOrderItem, Order, OrderItem, OrderLedger, OrderStatus, PaymentEvent,
    PaymentStatus, ProductId, RecordOutcome, Result, ShippingAddress, StatusTransition,
    UpsertedOrder,
};

use super::RepositoryError;

const ORDER_COLUMNS: &str = "id, order_number, customer_id, stripe_session_id, \
    stripe_payment_intent_id, status, payment_status, subtotal_cents, tax_cents, \
    shipping_cents, total_cents, currency, notes, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, order_id, stripe_line_item_id, product_id, variant_option_id, \
    quantity, unit_price_cents, total_price_cents, stock_applied";

#[derive(FromRow)]
struct OrderRow {
    id: i64,
    order_number: String,
    customer_id: Option<i64>,
    stripe_session_id: Option<String>,
    stripe_payment_intent_id: Option<String>,
    status: String,
    payment_status: String,
    subtotal_cents: i64,
    tax_cents: i64,
    shipping_cents: i64,
    total_cents: i64,
    currency: String,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = RepositoryError;

    fn try_from(row: OrderRow) -> std::result::Result<Self, Self::Error> {
        let status = OrderStatus::parse(&row.status).ok_or_else(|| {
            RepositoryError::DataCorruption(format!("order {}: status '{}'", row.id, row.status))
        })?;
        let payment_status = PaymentStatus::parse(&row.payment_status).ok_or_else(|| {
            RepositoryError::DataCorruption(format!(
                "order {}: payment_status '{}'",
                row.id, row.payment_status
            ))
        })?;

        Ok(Self {
            id: row.id,
            order_number: row.order_number,
            customer_id: row.customer_id,
            session_id: row.stripe_session_id,
            payment_intent_id: row.stripe_payment_intent_id,
            status,
            payment_status,
            subtotal_cents: row.subtotal_cents,
            tax_cents: row.tax_cents,
            shipping_cents: row.shipping_cents,
            total_cents: row.total_cents,
            currency: row.currency,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct UpsertedOrderRow {
    #[sqlx(flatten)]
    order: OrderRow,
    inserted: bool,
}

#[derive(FromRow)]
struct TransitionRow {
    #[sqlx(flatten)]
    order: OrderRow,
    previous_status: String,
}

#[derive(FromRow)]
struct ItemRow {
    id: i64,
    order_id: i64,
    stripe_line_item_id: String,
    product_id: Option<i64>,
    variant_option_id: Option<String>,
    quantity: i32,
    unit_price_cents: i64,
    total_price_cents: i64,
    stock_applied: bool,
}

impl From<ItemRow> for OrderItem {
    fn from(row: ItemRow) -> Self {
        Self {
            id: row.id,
            order_id: row.order_id,
            line_item_id: row.stripe_line_item_id,
            product_id: row.product_id.map(ProductId::new),
            variant_option_id: row.variant_option_id,
            quantity: row.quantity,
            unit_price_cents: row.unit_price_cents,
            total_price_cents: row.total_price_cents,
            stock_applied: row.stock_applied,
        }
    }
}

#[derive(FromRow)]
struct EventRow {
    stripe_event_id: String,
    event_type: String,
    data: Json<Value>,
    processed: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<EventRow> for PaymentEvent {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.stripe_event_id,
            event_type: row.event_type,
            payload: row.data.0,
            processed: row.processed,
            last_error: row.last_error,
            received_at: row.created_at,
            processed_at: row.processed_at,
        }
    }
}

#[derive(FromRow)]
struct CustomerRow {
    id: i64,
    email: String,
    stripe_customer_id: Option<String>,
    name: Option<String>,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            provider_customer_id: row.stripe_customer_id,
            name: row.name,
        }
    }
}

fn to_order(row: Option<OrderRow>) -> Result<Option<Order>> {
    Ok(row.map(Order::try_from).transpose()?)
}

/// Ledger backed by `stripe_events`, `customers`, `addresses`, `orders`
/// and `order_items`
#[derive(Clone)]
pub struct PgOrderLedger {
    pool: PgPool,
}

impl PgOrderLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_order(&self, condition: &str, value: &str) -> Result<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE {condition} ORDER BY id LIMIT 1"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        to_order(row)
    }
}

#[async_trait]
impl OrderLedger for PgOrderLedger {
    async fn find_event(&self, event_id: &str) -> Result<Option<PaymentEvent>> {
        let row: Option<EventRow> = sqlx::query_as(
            r"
            SELECT stripe_event_id, event_type, data, processed, last_error, created_at, processed_at
            FROM stripe_events
            WHERE stripe_event_id = $1
            ",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(row.map(PaymentEvent::from))
    }

    async fn record_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<RecordOutcome> {
        let result = sqlx::query(
            r"
            INSERT INTO stripe_events (stripe_event_id, event_type, data, processed)
            VALUES ($1, $2, $3, false)
            ON CONFLICT (stripe_event_id) DO NOTHING
            ",
        )
        .bind(event_id)
        .bind(event_type)
        .bind(Json(payload))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(if result.rows_affected() == 0 {
            RecordOutcome::AlreadyRecorded
        } else {
            RecordOutcome::Recorded
        })
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE stripe_events
            SET processed = true, processed_at = NOW(), last_error = NULL
            WHERE stripe_event_id = $1
            ",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn mark_event_failed(&self, event_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE stripe_events SET processed = false, last_error = $2 WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn upsert_customer(
        &self,
        email: &str,
        provider_customer_id: Option<&str>,
        name: Option<&str>,
    ) -> Result<Customer> {
        let row: CustomerRow = sqlx::query_as(
            r"
            INSERT INTO customers (email, stripe_customer_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO UPDATE SET
                stripe_customer_id = COALESCE(customers.stripe_customer_id, EXCLUDED.stripe_customer_id),
                name = COALESCE(NULLIF(customers.name, ''), EXCLUDED.name),
                updated_at = NOW()
            RETURNING id, email, stripe_customer_id, name
            ",
        )
        .bind(email)
        .bind(provider_customer_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(row.into())
    }

    async fn find_customer(&self, id: i64) -> Result<Option<Customer>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            "SELECT id, email, stripe_customer_id, name FROM customers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(row.map(Customer::from))
    }

    async fn save_shipping_address(
        &self,
        customer_id: i64,
        address: &ShippingAddress,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO addresses (customer_id, type, street, city, state, postal_code, country, is_default)
            VALUES ($1, 'shipping', $2, $3, $4, $5, $6, true)
            ON CONFLICT (customer_id, type) DO NOTHING
            ",
        )
        .bind(customer_id)
        .bind(address.street())
        .bind(&address.city)
        .bind(address.state.as_deref())
        .bind(&address.postal_code)
        .bind(&address.country)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_order(&self, order: &NewOrder) -> Result<UpsertedOrder> {
        // xmax = 0 only for a freshly inserted row
        let row: UpsertedOrderRow = sqlx::query_as(&format!(
            r"
            INSERT INTO orders (
                order_number, customer_id, stripe_session_id, stripe_payment_intent_id,
                status, payment_status, subtotal_cents, tax_cents, shipping_cents,
                total_cents, currency
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (stripe_session_id) DO UPDATE SET
                customer_id = COALESCE(EXCLUDED.customer_id, orders.customer_id),
                stripe_payment_intent_id = COALESCE(EXCLUDED.stripe_payment_intent_id, orders.stripe_payment_intent_id),
                status = CASE WHEN orders.status = 'pending' THEN EXCLUDED.status ELSE orders.status END,
                payment_status = CASE WHEN orders.payment_status = 'pending'
                    THEN EXCLUDED.payment_status ELSE orders.payment_status END,
                subtotal_cents = EXCLUDED.subtotal_cents,
                tax_cents = EXCLUDED.tax_cents,
                shipping_cents = EXCLUDED.shipping_cents,
                total_cents = EXCLUDED.total_cents,
                currency = EXCLUDED.currency,
                updated_at = NOW()
            RETURNING {ORDER_COLUMNS}, (xmax = 0) AS inserted
            "
        ))
        .bind(&order.order_number)
        .bind(order.customer_id)
        .bind(&order.session_id)
        .bind(order.payment_intent_id.as_deref())
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.subtotal_cents)
        .bind(order.tax_cents)
        .bind(order.shipping_cents)
        .bind(order.total_cents)
        .bind(&order.currency)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(UpsertedOrder {
            created: row.inserted,
            order: Order::try_from(row.order)?,
        })
    }

    async fn add_order_item(&self, item: &NewOrderItem) -> Result<OrderItem> {
        // The no-op update makes RETURNING yield the existing row on redelivery
        let row: ItemRow = sqlx::query_as(&format!(
            r"
            INSERT INTO order_items
                (order_id, stripe_line_item_id, product_id, variant_option_id, quantity,
                 unit_price_cents, total_price_cents)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id, stripe_line_item_id)
                DO UPDATE SET order_id = order_items.order_id
            RETURNING {ITEM_COLUMNS}
            "
        ))
        .bind(item.order_id)
        .bind(&item.line_item_id)
        .bind(item.product_id.map(|id| id.get()))
        .bind(item.variant_option_id.as_deref())
        .bind(item.quantity)
        .bind(item.unit_price_cents)
        .bind(item.total_price_cents())
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(row.into())
    }

    async fn claim_item_stock(&self, item_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE order_items SET stock_applied = true WHERE id = $1 AND stock_applied = false",
        )
        .bind(item_id)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_item_stock(&self, item_id: i64) -> Result<()> {
        sqlx::query("UPDATE order_items SET stock_applied = false WHERE id = $1")
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn order_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = $1 ORDER BY id"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(rows.into_iter().map(OrderItem::from).collect())
    }

    async fn mark_payment_succeeded(&self, payment_intent_id: &str) -> Result<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            r"
            UPDATE orders SET
                payment_status = 'succeeded',
                status = CASE WHEN status = 'pending' THEN 'processing' ELSE status END,
                updated_at = NOW()
            WHERE stripe_payment_intent_id = $1
            RETURNING {ORDER_COLUMNS}
            "
        ))
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        to_order(row)
    }

    async fn mark_payment_failed(
        &self,
        payment_intent_id: &str,
        note: &str,
    ) -> Result<Option<StatusTransition>> {
        let returning = ORDER_COLUMNS
            .split(", ")
            .map(|column| format!("o.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        // The CTE locks the row and captures the status being replaced
        let row: Option<TransitionRow> = sqlx::query_as(&format!(
            r"
            WITH previous AS (
                SELECT id, status FROM orders
                WHERE stripe_payment_intent_id = $1
                ORDER BY id
                LIMIT 1
                FOR UPDATE
            )
            UPDATE orders o SET
                payment_status = 'failed',
                status = 'cancelled',
                notes = COALESCE(o.notes || E'\n', '') || $2,
                updated_at = NOW()
            FROM previous
            WHERE o.id = previous.id
            RETURNING {returning}, previous.status AS previous_status
            "
        ))
        .bind(payment_intent_id)
        .bind(note)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let previous_status = OrderStatus::parse(&row.previous_status).ok_or_else(|| {
            RepositoryError::DataCorruption(format!("order status '{}'", row.previous_status))
        })?;
        Ok(Some(StatusTransition {
            order: Order::try_from(row.order)?,
            previous_status,
        }))
    }

    async fn mark_disputed(&self, payment_intent_id: &str, note: &str) -> Result<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            r"
            UPDATE orders SET
                status = 'disputed',
                notes = COALESCE(notes || E'\n', '') || $2,
                updated_at = NOW()
            WHERE stripe_payment_intent_id = $1
            RETURNING {ORDER_COLUMNS}
            "
        ))
        .bind(payment_intent_id)
        .bind(note)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        to_order(row)
    }

    async fn find_order_by_session(&self, session_id: &str) -> Result<Option<Order>> {
        self.fetch_order("stripe_session_id = $1", session_id).await
    }

    async fn find_order_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<Order>> {
        self.fetch_order("stripe_payment_intent_id = $1", payment_intent_id)
            .await
    }

    async fn find_order_by_reference(&self, reference: &str) -> Result<Option<Order>> {
        if reference.parse::<i64>().is_ok() {
            self.fetch_order("id::text = $1 OR order_number = $1", reference)
                .await
        } else {
            self.fetch_order("order_number = $1", reference).await
        }
    }
}
