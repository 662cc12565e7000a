//! Product catalog queries.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use hackeed_core::{CatalogStore, Product, ProductId, Result, VariantOption, VariantStockChange, Variants};

use super::RepositoryError;

const PRODUCT_COLUMNS: &str = "id, sku, name, price_cents, stock, active, variants";

#[derive(FromRow)]
struct ProductRow {
    id: i64,
    sku: String,
    name: String,
    price_cents: i64,
    stock: i32,
    active: bool,
    variants: Option<Json<Variants>>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Self {
            id: ProductId::new(row.id),
            sku: row.sku,
            name: row.name,
            price_cents: row.price_cents,
            stock: row.stock,
            active: row.active,
            variants: row.variants.map(|Json(variants)| variants),
        }
    }
}

/// Catalog backed by the `products` table
#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read-modify-write of one variant option under a row lock.
    ///
    /// `SELECT ... FOR UPDATE` serialises concurrent webhooks touching the
    /// same product, so no option update is lost.
    async fn update_option(
        &self,
        id: &ProductId,
        option_id: &str,
        apply: impl FnOnce(&mut VariantOption) -> i32 + Send,
    ) -> std::result::Result<VariantStockChange, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Option<Json<Variants>>,)> =
            sqlx::query_as("SELECT variants FROM products WHERE id = $1 FOR UPDATE")
                .bind(id.get())
                .fetch_optional(&mut *tx)
                .await?;

        let Some((variants,)) = row else {
            return Ok(VariantStockChange::ProductNotFound);
        };
        let Some(Json(mut variants)) = variants else {
            return Ok(VariantStockChange::OptionNotFound);
        };
        let Some(option) = variants.find_option_mut(option_id) else {
            return Ok(VariantStockChange::OptionNotFound);
        };
        let stock = apply(option);

        sqlx::query("UPDATE products SET variants = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.get())
            .bind(Json(&variants))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(VariantStockChange::Applied { stock })
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn get_product(&self, id: &ProductId) -> Result<Option<Product>> {
        let row: Option<ProductRow> =
            sqlx::query_as(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"))
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await
                .map_err(RepositoryError::from)?;
        Ok(row.map(Product::from))
    }

    async fn find_product_by_name(&self, name: &str) -> Result<Option<Product>> {
        let row: Option<ProductRow> = sqlx::query_as(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE name = $1 ORDER BY active DESC, created_at LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(row.map(Product::from))
    }

    async fn decrement_stock(&self, id: &ProductId, quantity: i32) -> Result<Option<i32>> {
        let stock: Option<i32> = sqlx::query_scalar(
            r"
            UPDATE products
            SET stock = GREATEST(stock - $2, 0), updated_at = NOW()
            WHERE id = $1
            RETURNING stock
            ",
        )
        .bind(id.get())
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(stock)
    }

    async fn restore_stock(&self, id: &ProductId, quantity: i32) -> Result<Option<i32>> {
        let stock: Option<i32> = sqlx::query_scalar(
            r"
            UPDATE products
            SET stock = stock + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING stock
            ",
        )
        .bind(id.get())
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(stock)
    }

    async fn decrement_variant_stock(
        &self,
        id: &ProductId,
        option_id: &str,
        quantity: i32,
    ) -> Result<VariantStockChange> {
        Ok(self
            .update_option(id, option_id, |option| option.decrement(quantity))
            .await?)
    }

    async fn restore_variant_stock(
        &self,
        id: &ProductId,
        option_id: &str,
        quantity: i32,
    ) -> Result<VariantStockChange> {
        Ok(self
            .update_option(id, option_id, |option| option.restore(quantity))
            .await?)
    }
}
