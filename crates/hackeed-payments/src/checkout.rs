//! Checkout Session Builder
//!
//! Implements the "Stripe Checkout (Hosted)" flow: validate the cart
//! against the catalog, then create one priced line per validated line.
//! Each line's product metadata carries `product_id` and
//! `variant_option_id`, the only link back to the catalog once the
//! session exists.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use hackeed_core::{CartLine, CartValidator, ValidatedLine};

use crate::error::{PaymentError, Result};
use crate::provider::{CreatedSession, PaymentProvider, SessionLineItem, SessionRequest};

/// Value of the `source` session metadata key
pub const SESSION_SOURCE: &str = "storefront-checkout";

/// Placeholder the provider replaces with the session id
pub const SESSION_ID_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";

/// Redirect URLs and session defaults
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutSettings {
    pub success_url: String,
    pub cancel_url: String,
    pub currency: String,
    pub locale: String,
    /// Used when the cart omits an email
    pub default_customer_email: Option<String>,
}

impl CheckoutSettings {
    /// `{base}/success?session_id={CHECKOUT_SESSION_ID}` and `{base}/cart`
    pub fn from_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            success_url: format!("{base}/success?session_id={SESSION_ID_PLACEHOLDER}"),
            cancel_url: format!("{base}/cart"),
            currency: "eur".into(),
            locale: "es".into(),
            default_customer_email: None,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into().to_ascii_lowercase();
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_default_customer_email(mut self, email: Option<String>) -> Self {
        self.default_customer_email = email;
        self
    }
}

/// Checkout request body as posted by the storefront
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CheckoutRequest {
    #[serde(default)]
    pub items: Vec<CartLine>,

    #[serde(default, rename = "customerEmail")]
    pub customer_email: Option<String>,
}

/// Result of creating a checkout session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Provider session id
    pub id: String,

    /// URL to redirect the shopper to
    pub url: String,
}

impl From<CreatedSession> for CheckoutSession {
    fn from(session: CreatedSession) -> Self {
        Self {
            id: session.id,
            url: session.url,
        }
    }
}

/// Validates carts and creates provider sessions
pub struct CheckoutService {
    validator: CartValidator,
    provider: Arc<dyn PaymentProvider>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        validator: CartValidator,
        provider: Arc<dyn PaymentProvider>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            validator,
            provider,
            settings,
        }
    }

    pub fn settings(&self) -> &CheckoutSettings {
        &self.settings
    }

    /// Validate the cart and create a session.
    ///
    /// No session is created when any line fails validation.
    pub async fn create_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let customer_email = self.customer_email(request)?;
        let lines = self.validator.validate(&request.items).await?;
        let session_request = self.build_request(&lines, customer_email);

        let created = self
            .provider
            .create_checkout_session(&session_request)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    provider = self.provider.name(),
                    code = e.code(),
                    error = %e,
                    "Checkout session creation failed"
                );
            })?;

        tracing::info!(
            session_id = %created.id,
            lines = lines.len(),
            total_cents = lines.iter().map(ValidatedLine::total_cents).sum::<i64>(),
            "Checkout session created"
        );
        Ok(created.into())
    }

    /// Session request for already validated lines
    pub fn build_request(
        &self,
        lines: &[ValidatedLine],
        customer_email: Option<String>,
    ) -> SessionRequest {
        let line_items = lines
            .iter()
            .map(|line| {
                let mut product_metadata = BTreeMap::from([
                    ("product_id".to_string(), line.product_id.to_string()),
                    ("sku".to_string(), line.sku.clone()),
                ]);
                if let Some(option_id) = &line.variant_option_id {
                    product_metadata.insert("variant_option_id".into(), option_id.clone());
                }
                SessionLineItem {
                    name: line.name.clone(),
                    unit_amount: line.unit_price_cents,
                    quantity: u64::from(line.quantity.unsigned_abs()),
                    product_metadata,
                }
            })
            .collect();

        SessionRequest {
            line_items,
            customer_email,
            success_url: self.settings.success_url.clone(),
            cancel_url: self.settings.cancel_url.clone(),
            currency: self.settings.currency.clone(),
            locale: self.settings.locale.clone(),
            metadata: BTreeMap::from([
                ("source".to_string(), SESSION_SOURCE.to_string()),
                ("item_count".to_string(), lines.len().to_string()),
            ]),
        }
    }

    fn customer_email(&self, request: &CheckoutRequest) -> Result<Option<String>> {
        let email = request
            .customer_email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .map(str::to_string)
            .or_else(|| self.settings.default_customer_email.clone());

        match email {
            Some(email) if !looks_like_email(&email) => {
                Err(PaymentError::Validation("Invalid customer email".into()))
            }
            other => Ok(other),
        }
    }
}

fn looks_like_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.contains('@')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockFailure, MockPaymentProvider};
    use hackeed_core::{MemoryCatalogStore, Product, VariantOption, Variants};
    use serde_json::json;

    struct Fixture {
        service: CheckoutService,
        provider: Arc<MockPaymentProvider>,
        p1: Product,
        p2: Product,
        pi: Product,
    }

    fn fixture() -> Fixture {
        let p1 = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
        let p2 = Product::new("ESP32", "ESP32 DevKit", 800, 1);
        let pi = Product::new("PI5", "Raspberry Pi 5", 7900, 0).with_variants(Variants {
            kind: "ram".into(),
            name: "RAM".into(),
            options: vec![VariantOption::new("8gb", "8GB", Some(9900), 4)],
            default: None,
        });
        let catalog = Arc::new(MemoryCatalogStore::with_products([
            p1.clone(),
            p2.clone(),
            pi.clone(),
        ]));
        let provider = Arc::new(MockPaymentProvider::new());
        let service = CheckoutService::new(
            CartValidator::new(catalog),
            provider.clone(),
            CheckoutSettings::from_base_url("http://localhost:8888/"),
        );
        Fixture {
            service,
            provider,
            p1,
            p2,
            pi,
        }
    }

    fn request(items: serde_json::Value) -> CheckoutRequest {
        serde_json::from_value(json!({"items": items, "customerEmail": "ana@example.com"}))
            .unwrap()
    }

    #[test]
    fn test_redirect_urls() {
        let settings = CheckoutSettings::from_base_url("https://hackeed.example/");
        assert_eq!(
            settings.success_url,
            "https://hackeed.example/success?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(settings.cancel_url, "https://hackeed.example/cart");
    }

    #[tokio::test]
    async fn test_session_uses_catalog_prices() {
        let f = fixture();
        let body = request(json!([
            {"id": f.p1.id.to_string(), "quantity": 2, "price": 0.01, "name": "Cheap"}
        ]));

        let session = f.service.create_session(&body).await.unwrap();
        assert!(session.url.contains(&session.id));

        let sent = f.provider.requests().await;
        assert_eq!(sent.len(), 1);
        let line = &sent[0].line_items[0];
        assert_eq!(line.unit_amount, 1000);
        assert_eq!(line.quantity, 2);
        assert_eq!(line.name, "Arduino Uno");
        assert_eq!(line.product_metadata["product_id"], f.p1.id.to_string());
        assert_eq!(sent[0].currency, "eur");
        assert_eq!(sent[0].metadata["source"], SESSION_SOURCE);
        assert_eq!(sent[0].customer_email.as_deref(), Some("ana@example.com"));
    }

    #[tokio::test]
    async fn test_variant_line_metadata() {
        let f = fixture();
        let body = request(json!([
            {"id": f.pi.id.to_string(), "quantity": 1, "variants": {"selected": {"ram": "8gb"}}}
        ]));

        f.service.create_session(&body).await.unwrap();
        let line = &f.provider.requests().await[0].line_items[0];
        assert_eq!(line.unit_amount, 9900);
        assert_eq!(line.name, "Raspberry Pi 5 - 8GB");
        assert_eq!(line.product_metadata["variant_option_id"], "8gb");
    }

    #[tokio::test]
    async fn test_insufficient_stock_creates_no_session() {
        let f = fixture();
        let body = request(json!([
            {"id": f.p1.id.to_string(), "quantity": 1},
            {"id": f.p2.id.to_string(), "quantity": 3}
        ]));

        let err = f.service.create_session(&body).await.unwrap_err();
        assert!(matches!(
            err,
            PaymentError::InsufficientStock { available: 1, requested: 3, .. }
        ));
        assert!(f.provider.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_cart_and_bad_email() {
        let f = fixture();
        let err = f.service.create_session(&request(json!([]))).await.unwrap_err();
        assert!(matches!(err, PaymentError::EmptyCart));

        let body: CheckoutRequest = serde_json::from_value(json!({
            "items": [{"id": f.p1.id.to_string(), "quantity": 1}],
            "customerEmail": "not an email"
        }))
        .unwrap();
        let err = f.service.create_session(&body).await.unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_provider_failures_keep_their_kind() {
        let f = fixture();
        let body = request(json!([{"id": f.p1.id.to_string(), "quantity": 1}]));

        f.provider.fail_next(MockFailure::Connectivity).await;
        let err = f.service.create_session(&body).await.unwrap_err();
        assert!(matches!(err, PaymentError::ProviderConnectivity(_)));

        f.provider.fail_next(MockFailure::Auth).await;
        let err = f.service.create_session(&body).await.unwrap_err();
        assert!(matches!(err, PaymentError::ProviderAuth(_)));

        f.provider.fail_next(MockFailure::InvalidRequest).await;
        let err = f.service.create_session(&body).await.unwrap_err();
        assert!(matches!(err, PaymentError::ProviderRequest(_)));
    }

    #[test]
    fn test_email_shape() {
        assert!(looks_like_email("ana@example.com"));
        assert!(!looks_like_email("ana@localhost"));
        assert!(!looks_like_email("@example.com"));
        assert!(!looks_like_email("ana example@x.com"));
    }
}
