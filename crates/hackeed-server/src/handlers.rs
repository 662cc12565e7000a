//! HTTP Handlers

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use hackeed_payments::{
    CheckoutRequest, CheckoutSession, PaymentError, PaymentVerification, VerificationQuery,
};

use crate::error::ApiError;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// Liveness probe
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe, checks the database connection
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    let Some(pool) = &state.db else {
        return Json(HealthResponse {
            status: "ready",
            version: env!("CARGO_PKG_VERSION"),
        })
        .into_response();
    };

    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => Json(HealthResponse {
            status: "ready",
            version: env!("CARGO_PKG_VERSION"),
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Database health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable").into_response()
        }
    }
}

/// Create a hosted checkout session for the posted cart
pub async fn create_checkout(
    State(state): State<AppState>,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Json<CheckoutSession>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        ApiError::checkout(&PaymentError::Validation(format!(
            "Invalid request body: {}",
            rejection.body_text()
        )))
    })?;

    let session = state
        .checkout
        .create_session(&request)
        .await
        .map_err(|e| ApiError::checkout(&e))?;

    Ok(Json(session))
}

/// Stripe webhook receiver.
///
/// The body is taken as raw bytes; the signature covers them exactly.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match state.webhooks.receive(&body, signature).await {
        Ok(outcome) => {
            tracing::debug!(outcome = ?outcome, "Webhook acknowledged");
            Json(WebhookAck { received: true }).into_response()
        }
        Err(e @ (PaymentError::InvalidSignature(_) | PaymentError::InvalidPayload(_))) => {
            (StatusCode::BAD_REQUEST, format!("Webhook Error: {e}")).into_response()
        }
        Err(e) => {
            tracing::error!(code = e.code(), error = %e, "Webhook processing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Webhook Error: {}", e.user_message()))
                .into_response()
        }
    }
}

/// Read-only payment status for the success page
pub async fn verify_payment(
    State(state): State<AppState>,
    Query(query): Query<VerificationQuery>,
) -> Result<Json<PaymentVerification>, ApiError> {
    let verification = state
        .verifier
        .verify(&query)
        .await
        .map_err(|e| ApiError::verification(&e))?;
    Ok(Json(verification))
}

/// Bare `OPTIONS` without CORS request headers
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}
