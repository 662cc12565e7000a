//! Application State

use std::sync::Arc;

use hackeed_payments::{CheckoutService, PaymentVerifier, WebhookProcessor};
use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub checkout: Arc<CheckoutService>,

    pub webhooks: Arc<WebhookProcessor>,

    pub verifier: Arc<PaymentVerifier>,

    /// Database pool for readiness checks (None when running on memory stores)
    pub db: Option<PgPool>,
}
