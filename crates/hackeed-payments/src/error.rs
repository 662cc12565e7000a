//! Payment Error Types

use hackeed_core::CoreError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
///
/// Provider failures are classified where the provider call fails, from
/// the provider's structured error (HTTP status, timeout, transport).
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Cart without lines
    #[error("Cart is empty")]
    EmptyCart,

    /// Malformed input (quantity, email, identifiers)
    #[error("{0}")]
    Validation(String),

    /// Product, variant, order or provider object missing
    #[error("{0}")]
    NotFound(String),

    /// Requested more units than available
    #[error("Insufficient stock for {name}: {available} available, {requested} requested")]
    InsufficientStock {
        product_id: String,
        name: String,
        available: i32,
        requested: i32,
    },

    /// Webhook signature verification failed
    #[error("{0}")]
    InvalidSignature(String),

    /// Webhook body is not a well-formed event
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    /// Provider unreachable, timed out or rate limited
    #[error("Payment provider unavailable: {0}")]
    ProviderConnectivity(String),

    /// Provider rejected the request as malformed
    #[error("Payment provider rejected the request: {0}")]
    ProviderRequest(String),

    /// Provider rejected our credentials
    #[error("Payment provider authentication failed: {0}")]
    ProviderAuth(String),

    /// Any other provider failure
    #[error("Payment provider error: {0}")]
    Provider(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog or ledger failure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::ProviderConnectivity(_) | PaymentError::Storage(_)
        )
    }

    /// Errors whose message is already safe to show to the shopper
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PaymentError::EmptyCart
                | PaymentError::Validation(_)
                | PaymentError::NotFound(_)
                | PaymentError::InsufficientStock { .. }
                | PaymentError::InvalidSignature(_)
                | PaymentError::InvalidPayload(_)
        )
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::EmptyCart => "EMPTY_CART",
            PaymentError::Validation(_) | PaymentError::InvalidPayload(_) => "VALIDATION_ERROR",
            PaymentError::NotFound(_) => "NOT_FOUND",
            PaymentError::InsufficientStock { .. } => "INVENTORY_ERROR",
            PaymentError::InvalidSignature(_) => "SIGNATURE_ERROR",
            PaymentError::ProviderConnectivity(_) => "NETWORK_ERROR",
            PaymentError::ProviderRequest(_) | PaymentError::Provider(_) => "PAYMENT_ERROR",
            PaymentError::ProviderAuth(_) | PaymentError::Config(_) => "CONFIG_ERROR",
            PaymentError::Storage(_) | PaymentError::Internal(_) => "GENERIC_ERROR",
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        if self.is_client_error() {
            return self.to_string();
        }
        match self {
            PaymentError::ProviderConnectivity(_) => {
                "Could not reach the payment service. Please try again in a moment.".into()
            }
            PaymentError::ProviderRequest(_) => {
                "The payment could not be set up. Please review your cart and try again.".into()
            }
            PaymentError::ProviderAuth(_) | PaymentError::Config(_) => {
                "Payment service configuration error.".into()
            }
            _ => "An error occurred processing your request.".into(),
        }
    }
}

impl From<CoreError> for PaymentError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::EmptyCart => PaymentError::EmptyCart,
            CoreError::InvalidQuantity { .. } | CoreError::Validation(_) => {
                PaymentError::Validation(err.to_string())
            }
            CoreError::ProductNotFound(_)
            | CoreError::VariantNotFound { .. }
            | CoreError::OrderNotFound(_) => PaymentError::NotFound(err.to_string()),
            CoreError::InsufficientStock {
                product_id,
                name,
                available,
                requested,
            } => PaymentError::InsufficientStock {
                product_id,
                name,
                available,
                requested,
            },
            CoreError::Storage(msg) => PaymentError::Storage(msg),
            CoreError::DataCorruption(_) | CoreError::Json(_) => {
                PaymentError::Internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_keep_their_kind() {
        let err: PaymentError = CoreError::InsufficientStock {
            product_id: "p2".into(),
            name: "ESP32".into(),
            available: 1,
            requested: 3,
        }
        .into();
        assert_eq!(err.code(), "INVENTORY_ERROR");
        assert_eq!(err.user_message(), "Insufficient stock for ESP32: 1 available, 3 requested");

        let err: PaymentError = CoreError::Storage("pool timed out".into()).into();
        assert!(err.is_retryable());
        assert_eq!(err.user_message(), "An error occurred processing your request.");
    }

    #[test]
    fn test_provider_details_are_not_shown() {
        let err = PaymentError::ProviderAuth("Invalid API Key provided: sk_test_****1234".into());
        assert!(!err.user_message().contains("sk_test"));
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(!err.is_retryable());
    }
}
