//! Pricing & Stock Validator
//!
//! Re-derives unit price and available stock for every cart line from the
//! catalog. Client-supplied names and prices are never read. One failing
//! line rejects the whole cart.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::catalog::CatalogStore;
use crate::error::{CoreError, Result};
use crate::model::{Product, ProductId, VariantOption};

/// Default per-line quantity cap
pub const DEFAULT_MAX_QUANTITY: i32 = 10;

/// Untrusted cart line as submitted by the storefront
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CartLine {
    /// Catalog id as sent by the storefront, a number or a string
    #[serde(rename = "id", deserialize_with = "string_or_number")]
    pub product_id: String,

    pub quantity: i64,

    /// Variant selection descriptor, if the shopper picked an option
    #[serde(default, rename = "variants", skip_serializing_if = "Option::is_none")]
    pub variant: Option<VariantSelection>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

impl CartLine {
    pub fn new(product_id: impl Into<String>, quantity: i64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            variant: None,
        }
    }

    pub fn with_option(mut self, option_id: impl Into<String>) -> Self {
        self.variant = Some(VariantSelection {
            selected: BTreeMap::new(),
            option: Some(SelectedOption {
                id: Some(Value::String(option_id.into())),
                name: None,
            }),
        });
        self
    }
}

/// `{selected: {<type>: <optionId>}, option: {id, name}}`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VariantSelection {
    #[serde(default)]
    pub selected: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<SelectedOption>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SelectedOption {
    #[serde(default)]
    pub id: Option<Value>,

    #[serde(default)]
    pub name: Option<String>,
}

impl VariantSelection {
    /// Lookup keys in priority order: option id, selected value for the
    /// variant dimension, any other selected value, option name.
    pub fn candidate_keys(&self, kind: &str) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(id) = self.option.as_ref().and_then(|o| o.id.as_ref()).and_then(value_key) {
            keys.push(id);
        }
        if let Some(selected) = self.selected.get(kind).and_then(value_key) {
            keys.push(selected);
        }
        keys.extend(
            self.selected
                .iter()
                .filter(|(dimension, _)| dimension.as_str() != kind)
                .filter_map(|(_, value)| value_key(value)),
        );
        if let Some(name) = self.option.as_ref().and_then(|o| o.name.clone()) {
            keys.push(name);
        }
        keys.retain(|key| !key.is_empty());
        keys.dedup();
        keys
    }

    /// Human-readable label for error messages
    pub fn describe(&self) -> String {
        self.candidate_keys("")
            .into_iter()
            .next()
            .unwrap_or_else(|| "<empty>".to_string())
    }
}

fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A cart line whose price and stock come from the catalog
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidatedLine {
    pub product_id: ProductId,

    pub sku: String,

    /// `"<product> - <option>"` for variant lines, product name otherwise
    pub name: String,

    pub variant_option_id: Option<String>,

    pub variant_option_name: Option<String>,

    /// Authoritative unit price in cents
    pub unit_price_cents: i64,

    pub quantity: i32,
}

impl ValidatedLine {
    pub fn total_cents(&self) -> i64 {
        self.unit_price_cents.saturating_mul(i64::from(self.quantity))
    }
}

/// Pricing & stock validator
pub struct CartValidator {
    catalog: Arc<dyn CatalogStore>,
    max_quantity: i32,
}

impl CartValidator {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            catalog,
            max_quantity: DEFAULT_MAX_QUANTITY,
        }
    }

    pub fn with_max_quantity(mut self, max_quantity: i32) -> Self {
        self.max_quantity = max_quantity.max(1);
        self
    }

    pub fn max_quantity(&self) -> i32 {
        self.max_quantity
    }

    /// Validate every line; the first failure rejects the cart
    pub async fn validate(&self, lines: &[CartLine]) -> Result<Vec<ValidatedLine>> {
        if lines.is_empty() {
            return Err(CoreError::EmptyCart);
        }

        let mut validated = Vec::with_capacity(lines.len());
        // Lines repeating the same product/option draw from one stock
        let mut requested: HashMap<(ProductId, Option<String>), i32> = HashMap::new();

        for line in lines {
            let quantity = self.check_quantity(line)?;
            let product = self.load_product(&line.product_id).await?;

            let option = match (&product.variants, &line.variant) {
                (Some(variants), Some(selection)) if !variants.options.is_empty() => {
                    let option = selection
                        .candidate_keys(&variants.kind)
                        .iter()
                        .find_map(|key| variants.find_option(key))
                        .ok_or_else(|| CoreError::VariantNotFound {
                            product_id: product.id.to_string(),
                            variant: selection.describe(),
                        })?;
                    Some(option.clone())
                }
                _ => None,
            };

            let available = option
                .as_ref()
                .map_or(product.stock, VariantOption::available_stock)
                .max(0);

            let key = (product.id, option.as_ref().map(|o| o.id.clone()));
            let total = requested.entry(key).or_insert(0);
            *total = total.saturating_add(quantity);
            if *total > available {
                tracing::debug!(
                    product_id = %product.id,
                    available,
                    requested = *total,
                    "Cart rejected: insufficient stock"
                );
                return Err(CoreError::InsufficientStock {
                    product_id: product.id.to_string(),
                    name: display_name(&product, option.as_ref()),
                    available,
                    requested: *total,
                });
            }

            validated.push(Self::validated_line(&product, option.as_ref(), quantity)?);
        }

        tracing::debug!(lines = validated.len(), "Cart validated");
        Ok(validated)
    }

    fn check_quantity(&self, line: &CartLine) -> Result<i32> {
        i32::try_from(line.quantity)
            .ok()
            .filter(|q| (1..=self.max_quantity).contains(q))
            .ok_or_else(|| CoreError::InvalidQuantity {
                product_id: line.product_id.clone(),
                quantity: line.quantity,
                max: self.max_quantity,
            })
    }

    async fn load_product(&self, raw_id: &str) -> Result<Product> {
        let id: ProductId = raw_id
            .parse()
            .map_err(|_| CoreError::ProductNotFound(raw_id.to_string()))?;
        match self.catalog.get_product(&id).await? {
            Some(product) if product.active => Ok(product),
            _ => Err(CoreError::ProductNotFound(raw_id.to_string())),
        }
    }

    fn validated_line(
        product: &Product,
        option: Option<&VariantOption>,
        quantity: i32,
    ) -> Result<ValidatedLine> {
        let unit_price_cents =
            option.map_or(product.price_cents, |o| o.unit_price(product.price_cents));
        if unit_price_cents < 0 {
            return Err(CoreError::DataCorruption(format!(
                "negative price for product {}",
                product.id
            )));
        }
        Ok(ValidatedLine {
            product_id: product.id,
            sku: product.sku.clone(),
            name: display_name(product, option),
            variant_option_id: option.map(|o| o.id.clone()),
            variant_option_name: option.map(|o| o.name.clone()),
            unit_price_cents,
            quantity,
        })
    }
}

fn display_name(product: &Product, option: Option<&VariantOption>) -> String {
    match option {
        Some(option) => format!("{} - {}", product.name, option.name),
        None => product.name.clone(),
    }
}
