//! Error Types

use thiserror::Error;

/// Result type alias for catalog, ledger and validation operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Domain errors raised by the validator and the storage traits
#[derive(Error, Debug)]
pub enum CoreError {
    /// Cart has no lines
    #[error("Cart is empty")]
    EmptyCart,

    /// Quantity outside `1..=max`
    #[error("Invalid quantity {quantity} for product {product_id} (allowed: 1-{max})")]
    InvalidQuantity {
        product_id: String,
        quantity: i64,
        max: i32,
    },

    /// Malformed input that is not covered by a more specific variant
    #[error("Validation error: {0}")]
    Validation(String),

    /// Product missing or inactive
    #[error("Product not found: {0}")]
    ProductNotFound(String),

    /// Variant selection does not match any option of the product
    #[error("Variant '{variant}' not found for product {product_id}")]
    VariantNotFound { product_id: String, variant: String },

    /// Requested more units than the authoritative stock
    #[error("Insufficient stock for {name}: {available} available, {requested} requested")]
    InsufficientStock {
        product_id: String,
        name: String,
        available: i32,
        requested: i32,
    },

    /// Order lookup failed
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Backing store failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Persisted data could not be decoded into the domain model
    #[error("Data corruption: {0}")]
    DataCorruption(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Errors caused by the caller's input (safe to show verbatim)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::EmptyCart
                | CoreError::InvalidQuantity { .. }
                | CoreError::Validation(_)
                | CoreError::ProductNotFound(_)
                | CoreError::VariantNotFound { .. }
                | CoreError::InsufficientStock { .. }
                | CoreError::OrderNotFound(_)
        )
    }
}
