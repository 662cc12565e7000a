//! Payment Verification
//!
//! Read-only view combining the provider's live payment status with the
//! local order and its items. Customer email, internal notes and client
//! secrets are not part of any view type, so they cannot be serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use hackeed_core::{CatalogStore, Order, OrderItem, OrderLedger, PaymentStatus};

use crate::error::{PaymentError, Result};
use crate::provider::{PaymentIntentDetails, PaymentProvider, SessionDetails};

/// Query parameters accepted by the verification endpoint
#[derive(Clone, Debug, Default, Deserialize)]
pub struct VerificationQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub payment_intent_id: Option<String>,
    /// Numeric order id or order number
    #[serde(default)]
    pub order_id: Option<String>,
}

impl VerificationQuery {
    fn non_empty(value: Option<&String>) -> Option<&str> {
        value.map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    pub fn session_id(&self) -> Option<&str> {
        Self::non_empty(self.session_id.as_ref())
    }

    pub fn payment_intent_id(&self) -> Option<&str> {
        Self::non_empty(self.payment_intent_id.as_ref())
    }

    pub fn order_id(&self) -> Option<&str> {
        Self::non_empty(self.order_id.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.session_id().is_none() && self.payment_intent_id().is_none() && self.order_id().is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    Session,
    PaymentIntent,
    Order,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Completed,
    Failed,
    Pending,
    Unknown,
    NotFound,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub payment_status: Option<String>,
    pub status: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
}

impl From<&SessionDetails> for SessionView {
    fn from(session: &SessionDetails) -> Self {
        Self {
            id: session.id.clone(),
            payment_status: session.payment_status.clone(),
            status: session.status.clone(),
            amount_total: session.amount_total,
            currency: session.currency.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentIntentView {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: Option<String>,
}

impl From<&PaymentIntentDetails> for PaymentIntentView {
    fn from(intent: &PaymentIntentDetails) -> Self {
        Self {
            id: intent.id.clone(),
            status: intent.status.clone(),
            amount: intent.amount,
            currency: intent.currency.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderItemView {
    pub id: i64,
    pub product_id: Option<String>,
    pub product_name: Option<String>,
    pub product_sku: Option<String>,
    pub variant_option_id: Option<String>,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub total_price_cents: i64,
}

/// Order as shown to the shopper
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderView {
    pub id: i64,
    pub order_number: String,
    pub status: String,
    pub payment_status: String,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
    pub currency: String,
    /// First letter followed by `***`
    pub customer_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<OrderItemView>,
}

/// Verification response
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub verification_type: Option<VerificationType>,
    pub stripe_session: Option<SessionView>,
    pub stripe_payment_intent: Option<PaymentIntentView>,
    pub order: Option<OrderView>,
    pub payment_verified: bool,
    pub overall_status: Option<OverallStatus>,
    /// Unix seconds
    pub created_at: Option<i64>,
}

impl PaymentVerification {
    /// Later lookups override fields they produced
    fn merge(&mut self, other: PaymentVerification) {
        self.verification_type = other.verification_type.or(self.verification_type);
        self.stripe_session = other.stripe_session.or(self.stripe_session.take());
        self.stripe_payment_intent = other
            .stripe_payment_intent
            .or(self.stripe_payment_intent.take());
        self.order = other.order.or(self.order.take());
        self.payment_verified = other.payment_verified;
        self.created_at = other.created_at.or(self.created_at);
    }

    fn is_empty(&self) -> bool {
        self.stripe_session.is_none() && self.stripe_payment_intent.is_none() && self.order.is_none()
    }

    pub fn compute_overall_status(&self) -> OverallStatus {
        let Some(order) = &self.order else {
            return OverallStatus::NotFound;
        };
        let intent_status = self.stripe_payment_intent.as_ref().map(|pi| pi.status.as_str());
        let session_status = self
            .stripe_session
            .as_ref()
            .and_then(|s| s.payment_status.as_deref());
        let has_provider_data = intent_status.is_some() || session_status.is_some();

        if order.payment_status == PaymentStatus::Succeeded.as_str()
            && (!has_provider_data || intent_status == Some("succeeded") || session_status == Some("paid"))
        {
            return OverallStatus::Completed;
        }
        if order.payment_status == PaymentStatus::Failed.as_str()
            || matches!(intent_status, Some("failed" | "canceled"))
            || session_status == Some("unpaid")
        {
            return OverallStatus::Failed;
        }
        if order.payment_status == PaymentStatus::Pending.as_str()
            || intent_status == Some("processing")
            || session_status == Some("pending")
        {
            return OverallStatus::Pending;
        }
        OverallStatus::Unknown
    }
}

/// `Ana` → `A***`
pub fn mask_name(name: &str) -> Option<String> {
    name.trim().chars().next().map(|first| format!("{first}***"))
}

/// Payment verification service
pub struct PaymentVerifier {
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<dyn OrderLedger>,
    provider: Arc<dyn PaymentProvider>,
}

impl PaymentVerifier {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        ledger: Arc<dyn OrderLedger>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            provider,
        }
    }

    /// Look up every supplied identifier and merge in the order
    /// session → payment intent → order
    pub async fn verify(&self, query: &VerificationQuery) -> Result<PaymentVerification> {
        if query.is_empty() {
            return Err(PaymentError::Validation(
                "session_id, payment_intent_id or order_id is required".into(),
            ));
        }

        let mut result = PaymentVerification::default();
        if let Some(session_id) = query.session_id() {
            if let Some(found) = skip_not_found(self.by_session(session_id).await)? {
                result.merge(found);
            }
        }
        if let Some(payment_intent_id) = query.payment_intent_id() {
            if let Some(found) = skip_not_found(self.by_payment_intent(payment_intent_id).await)? {
                result.merge(found);
            }
        }
        if let Some(reference) = query.order_id() {
            if let Some(found) = self.by_order(reference).await? {
                result.merge(found);
            }
        }

        if result.is_empty() {
            return Err(PaymentError::NotFound("No payment or order matches the query".into()));
        }
        result.overall_status = Some(result.compute_overall_status());

        tracing::info!(
            verification_type = ?result.verification_type,
            payment_verified = result.payment_verified,
            overall_status = ?result.overall_status,
            "Payment verified"
        );
        Ok(result)
    }

    async fn by_session(&self, session_id: &str) -> Result<PaymentVerification> {
        let session = self.provider.retrieve_session(session_id).await?;
        let order = self.ledger.find_order_by_session(session_id).await?;
        let order = match order {
            Some(order) => Some(self.order_view(&order).await?),
            None => None,
        };

        Ok(PaymentVerification {
            verification_type: Some(VerificationType::Session),
            payment_verified: session.payment_status.as_deref() == Some("paid") && order.is_some(),
            stripe_session: Some(SessionView::from(&session)),
            order,
            created_at: session.created,
            ..Default::default()
        })
    }

    async fn by_payment_intent(&self, payment_intent_id: &str) -> Result<PaymentVerification> {
        let intent = self.provider.retrieve_payment_intent(payment_intent_id).await?;
        let order = self.ledger.find_order_by_payment_intent(payment_intent_id).await?;
        let order = match order {
            Some(order) => Some(self.order_view(&order).await?),
            None => None,
        };

        Ok(PaymentVerification {
            verification_type: Some(VerificationType::PaymentIntent),
            payment_verified: intent.status == "succeeded" && order.is_some(),
            stripe_payment_intent: Some(PaymentIntentView::from(&intent)),
            order,
            created_at: intent.created,
            ..Default::default()
        })
    }

    async fn by_order(&self, reference: &str) -> Result<Option<PaymentVerification>> {
        let Some(order) = self.ledger.find_order_by_reference(reference).await? else {
            return Ok(None);
        };

        let stripe_payment_intent = match &order.payment_intent_id {
            Some(id) => self
                .best_effort(self.provider.retrieve_payment_intent(id).await, "payment_intent")
                .map(|intent| PaymentIntentView::from(&intent)),
            None => None,
        };
        let stripe_session = match &order.session_id {
            Some(id) => self
                .best_effort(self.provider.retrieve_session(id).await, "checkout_session")
                .map(|session| SessionView::from(&session)),
            None => None,
        };

        Ok(Some(PaymentVerification {
            verification_type: Some(VerificationType::Order),
            payment_verified: order.payment_status == PaymentStatus::Succeeded,
            created_at: Some(order.created_at.timestamp()),
            order: Some(self.order_view(&order).await?),
            stripe_payment_intent,
            stripe_session,
            ..Default::default()
        }))
    }

    fn best_effort<T>(&self, result: Result<T>, object: &str) -> Option<T> {
        result
            .inspect_err(|e| {
                tracing::warn!(provider = self.provider.name(), object, error = %e, "Provider lookup failed");
            })
            .ok()
    }

    async fn order_view(&self, order: &Order) -> Result<OrderView> {
        let customer_name = match order.customer_id {
            Some(id) => self
                .ledger
                .find_customer(id)
                .await?
                .and_then(|customer| customer.name)
                .and_then(|name| mask_name(&name)),
            None => None,
        };

        let items = self.ledger.order_items(order.id).await?;
        let mut item_views = Vec::with_capacity(items.len());
        for item in &items {
            item_views.push(self.item_view(item).await?);
        }

        Ok(OrderView {
            id: order.id,
            order_number: order.order_number.clone(),
            status: order.status.as_str().to_string(),
            payment_status: order.payment_status.as_str().to_string(),
            subtotal_cents: order.subtotal_cents,
            tax_cents: order.tax_cents,
            shipping_cents: order.shipping_cents,
            total_cents: order.total_cents,
            currency: order.currency.clone(),
            customer_name,
            created_at: order.created_at,
            updated_at: order.updated_at,
            items: item_views,
        })
    }

    async fn item_view(&self, item: &OrderItem) -> Result<OrderItemView> {
        let product = match &item.product_id {
            Some(id) => self.catalog.get_product(id).await?,
            None => None,
        };
        Ok(OrderItemView {
            id: item.id,
            product_id: item.product_id.map(|id| id.to_string()),
            product_name: product.as_ref().map(|p| p.name.clone()),
            product_sku: product.map(|p| p.sku),
            variant_option_id: item.variant_option_id.clone(),
            quantity: item.quantity,
            unit_price_cents: item.unit_price_cents,
            total_price_cents: item.total_price_cents,
        })
    }
}

fn skip_not_found(result: Result<PaymentVerification>) -> Result<Option<PaymentVerification>> {
    match result {
        Ok(found) => Ok(Some(found)),
        Err(PaymentError::NotFound(message)) => {
            tracing::debug!(detail = %message, "Verification lookup found nothing");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
