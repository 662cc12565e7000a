//! Stripe Checkout Integration
//!
//! Session creation goes through the typed `async-stripe` request builders.
//! Reads use the same client's raw `get`/`get_query` so the pipeline can
//! deserialize only the fields it reads.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use stripe::{
    CheckoutSession as StripeCheckoutSession, CheckoutSessionBillingAddressCollection,
    CheckoutSessionLocale, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData, CreateCheckoutSessionPaymentMethodTypes,
    Currency, StripeError,
};

use super::{
    CreatedSession, LineItemDetails, List, PaymentIntentDetails, PaymentProvider,
    SessionDetails, SessionRequest,
};
use crate::error::{PaymentError, Result};

const LINE_ITEMS_PAGE_SIZE: u64 = 100;

/// Stripe client wrapper
pub struct StripeClient {
    client: Client,
}

impl StripeClient {
    /// Create a new Stripe client
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: Client::new(secret_key),
        }
    }

    /// Get the underlying Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[derive(Serialize)]
struct LineItemsQuery<'a> {
    limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    starting_after: Option<&'a str>,
    expand: &'a [&'a str],
}

#[derive(Serialize)]
struct ExpandQuery<'a> {
    expand: &'a [&'a str],
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(&self, request: &SessionRequest) -> Result<CreatedSession> {
        let currency = parse_currency(&request.currency)?;

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Payment);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.customer_email = request.customer_email.as_deref();
        params.locale = Some(parse_locale(&request.locale));
        params.payment_method_types = Some(vec![CreateCheckoutSessionPaymentMethodTypes::Card]);
        params.billing_address_collection = Some(CheckoutSessionBillingAddressCollection::Required);
        params.metadata = Some(
            request
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        );

        params.line_items = Some(
            request
                .line_items
                .iter()
                .map(|item| CreateCheckoutSessionLineItems {
                    quantity: Some(item.quantity),
                    price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                        currency,
                        unit_amount: Some(item.unit_amount),
                        product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                            name: item.name.clone(),
                            metadata: Some(
                                item.product_metadata
                                    .iter()
                                    .map(|(k, v)| (k.clone(), v.clone()))
                                    .collect::<HashMap<_, _>>(),
                            ),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
        );

        let session = StripeCheckoutSession::create(&self.client, params)
            .await
            .map_err(classify)?;

        let url = session
            .url
            .ok_or_else(|| PaymentError::Provider("No checkout URL returned".into()))?;

        Ok(CreatedSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<SessionDetails> {
        check_object_id(session_id)?;
        self.client
            .get_query(
                &format!("/checkout/sessions/{session_id}"),
                ExpandQuery {
                    expand: &["payment_intent", "customer"],
                },
            )
            .await
            .map_err(classify)
    }

    async fn list_line_items(&self, session_id: &str) -> Result<Vec<LineItemDetails>> {
        check_object_id(session_id)?;
        let path = format!("/checkout/sessions/{session_id}/line_items");
        let mut items: Vec<LineItemDetails> = Vec::new();

        loop {
            let query = LineItemsQuery {
                limit: LINE_ITEMS_PAGE_SIZE,
                starting_after: items.last().map(|item| item.id.as_str()),
                expand: &["data.price.product"],
            };
            let page: List<LineItemDetails> =
                self.client.get_query(&path, query).await.map_err(classify)?;
            let has_more = page.has_more && !page.data.is_empty();
            items.extend(page.data);
            if !has_more {
                break;
            }
        }

        Ok(items)
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentDetails> {
        check_object_id(payment_intent_id)?;
        self.client
            .get(&format!("/payment_intents/{payment_intent_id}"))
            .await
            .map_err(classify)
    }

    fn name(&self) -> &str {
        "stripe"
    }
}

/// Map a Stripe failure to its error kind
fn classify(err: StripeError) -> PaymentError {
    match err {
        StripeError::Stripe(request) => {
            let message = request
                .message
                .clone()
                .unwrap_or_else(|| format!("{:?}", request.error_type));
            match request.http_status {
                401 | 403 => PaymentError::ProviderAuth(message),
                404 => PaymentError::NotFound(message),
                429 | 500..=599 => PaymentError::ProviderConnectivity(message),
                _ => PaymentError::ProviderRequest(message),
            }
        }
        StripeError::Timeout => PaymentError::ProviderConnectivity("request timed out".into()),
        StripeError::ClientError(message) => PaymentError::ProviderConnectivity(message),
        other => PaymentError::Provider(other.to_string()),
    }
}

/// Object ids are interpolated into request paths
fn check_object_id(id: &str) -> Result<()> {
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(PaymentError::Validation(format!("Invalid identifier: {id}")))
    }
}

fn parse_currency(code: &str) -> Result<Currency> {
    match code.to_ascii_lowercase().as_str() {
        "eur" => Ok(Currency::EUR),
        "usd" => Ok(Currency::USD),
        "gbp" => Ok(Currency::GBP),
        other => Err(PaymentError::Config(format!("Unsupported currency: {other}"))),
    }
}

fn parse_locale(locale: &str) -> CheckoutSessionLocale {
    match locale.to_ascii_lowercase().as_str() {
        "es" => CheckoutSessionLocale::Es,
        "en" => CheckoutSessionLocale::En,
        "fr" => CheckoutSessionLocale::Fr,
        "de" => CheckoutSessionLocale::De,
        "it" => CheckoutSessionLocale::It,
        "pt" => CheckoutSessionLocale::Pt,
        _ => CheckoutSessionLocale::Auto,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_check() {
        assert!(check_object_id("cs_test_a1B2c3").is_ok());
        assert!(check_object_id("pi_3Nx").is_ok());
        assert!(check_object_id("").is_err());
        assert!(check_object_id("cs_1/../../customers").is_err());
        assert!(check_object_id("cs_1?expand[]=x").is_err());
    }

    #[test]
    fn test_currency_and_locale() {
        assert!(matches!(parse_currency("EUR"), Ok(Currency::EUR)));
        assert!(matches!(parse_currency("jpy"), Err(PaymentError::Config(_))));
        assert!(matches!(parse_locale("es"), CheckoutSessionLocale::Es));
        assert!(matches!(parse_locale("xx"), CheckoutSessionLocale::Auto));
    }

    #[test]
    fn test_timeout_is_connectivity() {
        let err = classify(StripeError::Timeout);
        assert!(matches!(err, PaymentError::ProviderConnectivity(_)));
        assert!(err.is_retryable());

        let err = classify(StripeError::ClientError("connection refused".into()));
        assert_eq!(err.code(), "NETWORK_ERROR");
    }
}
