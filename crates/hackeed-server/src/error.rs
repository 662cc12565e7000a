//! HTTP error responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use hackeed_payments::PaymentError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

/// Error returned by a handler, already mapped to a status and a safe message
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    code: Option<&'static str>,
}

impl ApiError {
    /// Map a checkout failure. Missing products are a bad cart, so 400.
    pub fn checkout(err: &PaymentError) -> Self {
        Self::from_payment(err, StatusCode::BAD_REQUEST)
    }

    /// Map a verification failure. Nothing found is a 404.
    pub fn verification(err: &PaymentError) -> Self {
        Self::from_payment(err, StatusCode::NOT_FOUND)
    }

    pub fn method_not_allowed() -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            error: "Method not allowed".into(),
            code: None,
        }
    }

    fn from_payment(err: &PaymentError, not_found: StatusCode) -> Self {
        let status = match err {
            PaymentError::EmptyCart
            | PaymentError::Validation(_)
            | PaymentError::InsufficientStock { .. }
            | PaymentError::InvalidSignature(_)
            | PaymentError::InvalidPayload(_)
            | PaymentError::ProviderRequest(_) => StatusCode::BAD_REQUEST,
            PaymentError::NotFound(_) => not_found,
            PaymentError::ProviderConnectivity(_) => StatusCode::SERVICE_UNAVAILABLE,
            PaymentError::ProviderAuth(_)
            | PaymentError::Provider(_)
            | PaymentError::Config(_)
            | PaymentError::Storage(_)
            | PaymentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "Request failed");
        } else {
            tracing::debug!(code = err.code(), error = %err, "Request rejected");
        }

        Self {
            status,
            error: err.user_message(),
            code: Some(err.code()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.error,
                code: self.code,
            }),
        )
            .into_response()
    }
}
