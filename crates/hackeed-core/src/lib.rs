//! # hackeed-core
//!
//! Storefront domain for the Hackeed checkout pipeline.
//!
//! - [`model`]: products with typed variant options, orders, ledger records
//! - [`catalog`]: the [`CatalogStore`] trait (price, stock, clamped decrements)
//! - [`ledger`]: the [`OrderLedger`] trait (event dedup, customers, orders)
//! - [`validation`]: the [`CartValidator`] that re-prices untrusted carts
//!
//! Storage traits ship with in-memory implementations; the Postgres ones
//! live in the server crate.
//!
//! ```rust,ignore
//! use hackeed_core::{CartLine, CartValidator, MemoryCatalogStore, Product};
//!
//! let product = Product::new("ARD-UNO", "Arduino Uno", 1000, 5);
//! let cart = vec![CartLine::new(product.id.to_string(), 2)];
//! let catalog = Arc::new(MemoryCatalogStore::with_products([product]));
//!
//! let lines = CartValidator::new(catalog).validate(&cart).await?;
//! assert_eq!(lines[0].unit_price_cents, 1000);
//! ```

pub mod catalog;
pub mod error;
pub mod ledger;
pub mod model;
pub mod validation;

pub use catalog::{CatalogStore, MemoryCatalogStore, VariantStockChange};
pub use error::{CoreError, Result};
pub use ledger::{MemoryOrderLedger, OrderLedger};
pub use model::{
    clamped_decrement, Customer, NewOrder, NewOrderItem, Order, OrderItem, OrderStatus,
    PaymentEvent, PaymentStatus, Product, ProductId, RecordOutcome, ShippingAddress,
    StatusTransition, UpsertedOrder, VariantOption, Variants, LEGACY_IN_STOCK_QUANTITY,
};
pub use validation::{
    CartLine, CartValidator, SelectedOption, ValidatedLine, VariantSelection,
    DEFAULT_MAX_QUANTITY,
};
