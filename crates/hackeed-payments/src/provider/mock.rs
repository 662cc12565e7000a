//! Mock Payment Provider
//!
//! In-process stand-in for Stripe. Sessions created through it can be
//! completed, and their line items are derived from the request exactly as
//! the hosted checkout would report them.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{
    CreatedSession, LineItemDetails, PaymentIntentDetails, PaymentProvider, PriceDetails,
    ProductDetails, ProductRef, SessionDetails, SessionRequest,
};
use crate::error::{PaymentError, Result};

/// Scripted failure for the next provider call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockFailure {
    Connectivity,
    Auth,
    InvalidRequest,
}

impl MockFailure {
    fn into_error(self) -> PaymentError {
        match self {
            MockFailure::Connectivity => {
                PaymentError::ProviderConnectivity("mock: connection reset".into())
            }
            MockFailure::Auth => PaymentError::ProviderAuth("mock: invalid api key".into()),
            MockFailure::InvalidRequest => {
                PaymentError::ProviderRequest("mock: invalid line items".into())
            }
        }
    }
}

#[derive(Default)]
struct MockState {
    requests: Vec<SessionRequest>,
    sessions: HashMap<String, SessionDetails>,
    line_items: HashMap<String, Vec<LineItemDetails>>,
    payment_intents: HashMap<String, PaymentIntentDetails>,
    next_id: u32,
    failure: Option<MockFailure>,
}

impl MockState {
    fn take_failure(&mut self) -> Result<()> {
        self.failure.take().map_or(Ok(()), |f| Err(f.into_error()))
    }
}

/// Mock provider keeping sessions and payment intents in memory
#[derive(Default)]
pub struct MockPaymentProvider {
    state: Mutex<MockState>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call with the given kind
    pub async fn fail_next(&self, failure: MockFailure) {
        self.state.lock().await.failure = Some(failure);
    }

    /// Session requests received so far
    pub async fn requests(&self) -> Vec<SessionRequest> {
        self.state.lock().await.requests.clone()
    }

    /// Mark a session paid and attach a succeeded payment intent
    pub async fn complete_session(
        &self,
        session_id: &str,
        payment_intent_id: &str,
    ) -> Option<SessionDetails> {
        let mut state = self.state.lock().await;
        let session = state.sessions.get_mut(session_id)?;
        session.payment_status = Some("paid".into());
        session.status = Some("complete".into());
        session.payment_intent = Some(payment_intent_id.to_string());
        let session = session.clone();

        state.payment_intents.insert(
            payment_intent_id.to_string(),
            PaymentIntentDetails {
                id: payment_intent_id.to_string(),
                status: "succeeded".into(),
                amount: session.amount_total.unwrap_or(0),
                currency: session.currency.clone(),
                client_secret: Some(format!("{payment_intent_id}_secret_mock")),
                last_payment_error: None,
                created: Some(Utc::now().timestamp()),
            },
        );
        Some(session)
    }

    /// Register a session and its line items directly
    pub async fn insert_session(&self, session: SessionDetails, line_items: Vec<LineItemDetails>) {
        let mut state = self.state.lock().await;
        state.line_items.insert(session.id.clone(), line_items);
        state.sessions.insert(session.id.clone(), session);
    }

    pub async fn insert_payment_intent(&self, payment_intent: PaymentIntentDetails) {
        self.state
            .lock()
            .await
            .payment_intents
            .insert(payment_intent.id.clone(), payment_intent);
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_checkout_session(&self, request: &SessionRequest) -> Result<CreatedSession> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        state.next_id += 1;
        let n = state.next_id;
        let id = format!("cs_test_mock{n:08}");

        let line_items: Vec<LineItemDetails> = request
            .line_items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let quantity = i64::try_from(item.quantity).unwrap_or(i64::MAX);
                LineItemDetails {
                    id: format!("li_mock_{n}_{i}"),
                    description: Some(item.name.clone()),
                    quantity: Some(item.quantity),
                    amount_total: Some(item.unit_amount.saturating_mul(quantity)),
                    price: Some(PriceDetails {
                        id: Some(format!("price_mock_{n}_{i}")),
                        unit_amount: Some(item.unit_amount),
                        product: Some(ProductRef::Object(ProductDetails {
                            id: format!("prod_mock_{n}_{i}"),
                            name: Some(item.name.clone()),
                            metadata: Some(item.product_metadata.clone()),
                        })),
                    }),
                }
            })
            .collect();
        let amount_total = line_items
            .iter()
            .filter_map(|item| item.amount_total)
            .sum::<i64>();

        let session = SessionDetails {
            id: id.clone(),
            payment_status: Some("unpaid".into()),
            status: Some("open".into()),
            amount_total: Some(amount_total),
            amount_subtotal: Some(amount_total),
            currency: Some(request.currency.clone()),
            customer_email: request.customer_email.clone(),
            metadata: Some(request.metadata.clone()),
            created: Some(Utc::now().timestamp()),
            ..Default::default()
        };

        state.requests.push(request.clone());
        state.line_items.insert(id.clone(), line_items);
        state.sessions.insert(id.clone(), session);

        Ok(CreatedSession {
            url: format!("https://checkout.stripe.com/c/pay/{id}"),
            id,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<SessionDetails> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(format!("No such checkout.session: '{session_id}'")))
    }

    async fn list_line_items(&self, session_id: &str) -> Result<Vec<LineItemDetails>> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state
            .line_items
            .get(session_id)
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(format!("No such checkout.session: '{session_id}'")))
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentDetails> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state
            .payment_intents
            .get(payment_intent_id)
            .cloned()
            .ok_or_else(|| {
                PaymentError::NotFound(format!("No such payment_intent: '{payment_intent_id}'"))
            })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
