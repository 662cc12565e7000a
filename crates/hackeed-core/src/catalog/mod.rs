//! Product Catalog Store
//!
//! Read access for pricing and validation, clamped stock mutation for
//! webhook reconciliation.

mod memory;

pub use memory::MemoryCatalogStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Product, ProductId};

/// Result of a per-variant stock mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VariantStockChange {
    /// Option updated; carries the option's new stock
    Applied { stock: i32 },

    /// No product with that id
    ProductNotFound,

    /// Product exists but has no option matching the id (or name)
    OptionNotFound,
}

/// Catalog store trait
///
/// Implement this for each backing store: Postgres, in-memory, etc.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Fetch a product by id (active or not)
    async fn get_product(&self, id: &ProductId) -> Result<Option<Product>>;

    /// Exact-name lookup, used when line metadata predates product ids
    async fn find_product_by_name(&self, name: &str) -> Result<Option<Product>>;

    /// Atomically set `stock = max(stock - quantity, 0)`.
    ///
    /// Returns the new stock, or `None` when the product does not exist.
    async fn decrement_stock(&self, id: &ProductId, quantity: i32) -> Result<Option<i32>>;

    /// Add `quantity` back to the general stock column
    async fn restore_stock(&self, id: &ProductId, quantity: i32) -> Result<Option<i32>>;

    /// Clamped decrement of one variant option's stock.
    ///
    /// The read-modify-write of the variant structure must not lose
    /// concurrent updates to the same product.
    async fn decrement_variant_stock(
        &self,
        id: &ProductId,
        option_id: &str,
        quantity: i32,
    ) -> Result<VariantStockChange>;

    /// Inverse of [`CatalogStore::decrement_variant_stock`]
    async fn restore_variant_stock(
        &self,
        id: &ProductId,
        option_id: &str,
        quantity: i32,
    ) -> Result<VariantStockChange>;
}
