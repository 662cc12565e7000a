//! In-memory Catalog Store
//!
//! Backs tests and local demos. A single lock serialises every mutation,
//! so variant updates never interleave.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{CatalogStore, VariantStockChange};
use crate::error::Result;
use crate::model::{clamped_decrement, Product, ProductId, VariantOption};

/// Catalog held in a `HashMap`
#[derive(Default)]
pub struct MemoryCatalogStore {
    products: RwLock<HashMap<ProductId, Product>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `products`
    pub fn with_products(products: impl IntoIterator<Item = Product>) -> Self {
        Self {
            products: RwLock::new(products.into_iter().map(|p| (p.id, p)).collect()),
        }
    }

    pub async fn insert(&self, product: Product) {
        self.products.write().await.insert(product.id, product);
    }

    /// Snapshot of a product, for assertions
    pub async fn product(&self, id: &ProductId) -> Option<Product> {
        self.products.read().await.get(id).cloned()
    }

    async fn update_option(
        &self,
        id: &ProductId,
        option_id: &str,
        apply: impl FnOnce(&mut VariantOption) -> i32 + Send,
    ) -> VariantStockChange {
        let mut products = self.products.write().await;
        let Some(product) = products.get_mut(id) else {
            return VariantStockChange::ProductNotFound;
        };
        match product
            .variants
            .as_mut()
            .and_then(|variants| variants.find_option_mut(option_id))
        {
            Some(option) => VariantStockChange::Applied {
                stock: apply(option),
            },
            None => VariantStockChange::OptionNotFound,
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn get_product(&self, id: &ProductId) -> Result<Option<Product>> {
        Ok(self.products.read().await.get(id).cloned())
    }

    async fn find_product_by_name(&self, name: &str) -> Result<Option<Product>> {
        Ok(self
            .products
            .read()
            .await
            .values()
            .find(|product| product.name == name)
            .cloned())
    }

    async fn decrement_stock(&self, id: &ProductId, quantity: i32) -> Result<Option<i32>> {
        let mut products = self.products.write().await;
        Ok(products.get_mut(id).map(|product| {
            product.stock = clamped_decrement(product.stock, quantity);
            product.stock
        }))
    }

    async fn restore_stock(&self, id: &ProductId, quantity: i32) -> Result<Option<i32>> {
        let mut products = self.products.write().await;
        Ok(products.get_mut(id).map(|product| {
            product.stock = product.stock.saturating_add(quantity);
            product.stock
        }))
    }

    async fn decrement_variant_stock(
        &self,
        id: &ProductId,
        option_id: &str,
        quantity: i32,
    ) -> Result<VariantStockChange> {
        Ok(self
            .update_option(id, option_id, |option| option.decrement(quantity))
            .await)
    }

    async fn restore_variant_stock(
        &self,
        id: &ProductId,
        option_id: &str,
        quantity: i32,
    ) -> Result<VariantStockChange> {
        Ok(self
            .update_option(id, option_id, |option| option.restore(quantity))
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Variants;
    use std::sync::Arc;

    fn pi_with_ram() -> Product {
        Product::new("PI5", "Raspberry Pi 5", 7900, 0).with_variants(Variants {
            kind: "ram".into(),
            name: "RAM".into(),
            options: vec![
                VariantOption::new("4gb", "4GB", None, 2),
                VariantOption {
                    id: "8gb".into(),
                    name: "8GB".into(),
                    price: Some(9900),
                    stock: None,
                    in_stock: true,
                },
            ],
            default: None,
        })
    }

    #[tokio::test]
    async fn test_decrement_clamps_at_zero() {
        let product = Product::new("P1", "Arduino Uno", 1000, 5);
        let id = product.id;
        let store = MemoryCatalogStore::with_products([product]);

        assert_eq!(store.decrement_stock(&id, 2).await.unwrap(), Some(3));
        assert_eq!(store.decrement_stock(&id, 10).await.unwrap(), Some(0));
        assert_eq!(store.decrement_stock(&ProductId::generate(), 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_variant_decrement_and_restore() {
        let product = pi_with_ram();
        let id = product.id;
        let store = MemoryCatalogStore::with_products([product]);

        assert_eq!(
            store.decrement_variant_stock(&id, "4gb", 3).await.unwrap(),
            VariantStockChange::Applied { stock: 0 }
        );
        let option = store.product(&id).await.unwrap().variants.unwrap().options[0].clone();
        assert!(!option.in_stock);

        // legacy option without numeric stock starts at 999
        assert_eq!(
            store.decrement_variant_stock(&id, "8GB", 1).await.unwrap(),
            VariantStockChange::Applied { stock: 998 }
        );
        assert_eq!(
            store.restore_variant_stock(&id, "4gb", 2).await.unwrap(),
            VariantStockChange::Applied { stock: 2 }
        );
        assert_eq!(
            store.decrement_variant_stock(&id, "64gb", 1).await.unwrap(),
            VariantStockChange::OptionNotFound
        );
    }

    #[tokio::test]
    async fn test_concurrent_variant_decrements_are_not_lost() {
        let product = Product::new("PI5", "Raspberry Pi 5", 7900, 0).with_variants(Variants {
            options: vec![VariantOption::new("8gb", "8GB", None, 50)],
            ..Default::default()
        });
        let id = product.id;
        let store = Arc::new(MemoryCatalogStore::with_products([product]));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.decrement_variant_stock(&id, "8gb", 2).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stock = store.product(&id).await.unwrap().variants.unwrap().options[0].stock;
        assert_eq!(stock, Some(10));
    }

    #[tokio::test]
    async fn test_find_by_name() {
        let store = MemoryCatalogStore::with_products([pi_with_ram()]);
        assert!(store.find_product_by_name("Raspberry Pi 5").await.unwrap().is_some());
        assert!(store.find_product_by_name("raspberry pi 5").await.unwrap().is_none());
    }
}
