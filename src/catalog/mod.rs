//! Read-only product metadata.
//!
//! Products come either from the HTTP product service or from a local
//! export file. Both deserialize through [`RawProduct`], which accepts the
//! loose shapes the product service emits (`_id`, `defaultPrice`, category
//! fields at the root or nested under a populated `categoryId`).

mod export;
mod http;

use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use export::ExportCatalog;
pub use http::HttpCatalog;

/// Products scanned when a category listing is needed.
pub const CATEGORY_SCAN_LIMIT: usize = 1000;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum CatalogError {
    #[error("product {0} not found")]
    NotFound(String),

    #[error("product catalog unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_type: Option<String>,
}

impl Category {
    pub fn new(master: &str, sub: &str, article: &str) -> Self {
        Self {
            master_category: populated(Some(master.to_string())),
            sub_category: populated(Some(sub.to_string())),
            article_type: populated(Some(article.to_string())),
        }
    }

    /// True when no field is populated.
    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|f| f.is_none())
    }

    /// `other` matches when it agrees on every field populated here.
    pub fn admits(&self, other: &Category) -> bool {
        self.fields()
            .iter()
            .zip(other.fields().iter())
            .all(|(want, got)| match want {
                Some(want) => got.map(|got| got == *want).unwrap_or(false),
                None => true,
            })
    }

    fn fields(&self) -> [Option<&str>; 3] {
        [
            self.master_category.as_deref(),
            self.sub_category.as_deref(),
            self.article_type.as_deref(),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawProduct")]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Product {
    /// Primary image used for embeddings.
    pub fn primary_image(&self) -> Option<&str> {
        self.images.first().map(String::as_str)
    }
}

/// Wire shape accepted from the product service and export files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProduct {
    #[serde(alias = "_id", default)]
    id: Option<RawId>,
    #[serde(alias = "productDisplayName", default)]
    name: Option<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default)]
    usage: Option<String>,
    #[serde(alias = "defaultPrice", default)]
    price: Option<f64>,
    #[serde(default)]
    images: Vec<Value>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    master_category: Option<String>,
    #[serde(default)]
    sub_category: Option<String>,
    #[serde(default)]
    article_type: Option<String>,
    #[serde(default)]
    category_id: Option<Value>,
    #[serde(default)]
    created_at: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Num(u64),
    Oid {
        #[serde(rename = "$oid")]
        oid: String,
    },
}

impl From<RawProduct> for Product {
    fn from(raw: RawProduct) -> Self {
        let id = match raw.id {
            Some(RawId::Str(s)) => s,
            Some(RawId::Num(n)) => n.to_string(),
            Some(RawId::Oid { oid }) => oid,
            None => String::new(),
        };

        let mut category = Category {
            master_category: populated(raw.master_category),
            sub_category: populated(raw.sub_category),
            article_type: populated(raw.article_type),
        };
        if category.is_empty() {
            if let Some(Value::Object(nested)) = &raw.category_id {
                let field = |key: &str| {
                    populated(nested.get(key).and_then(Value::as_str).map(str::to_string))
                };
                category = Category {
                    master_category: field("masterCategory"),
                    sub_category: field("subCategory"),
                    article_type: field("articleType"),
                };
            }
        }

        let mut images: Vec<String> = raw
            .images
            .into_iter()
            .filter_map(|img| match img {
                Value::String(s) => Some(s),
                Value::Object(obj) => obj.get("url").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .filter(|s| !s.trim().is_empty())
            .collect();
        if images.is_empty() {
            images.extend(populated(raw.image_url));
        }

        Product {
            id,
            name: raw.name.unwrap_or_default(),
            category,
            brand: populated(raw.brand),
            gender: populated(raw.gender),
            usage: populated(raw.usage),
            price: raw.price.filter(|p| p.is_finite()),
            images,
            created_at: raw.created_at.as_ref().and_then(parse_timestamp),
        }
    }
}

fn populated(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Object(obj) => obj.get("$date").and_then(parse_timestamp),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

pub trait Catalog: Send + Sync {
    fn product(&self, id: &str) -> Result<Product, CatalogError>;

    /// First `limit` active products in catalog order.
    fn products(&self, limit: usize) -> Result<Vec<Product>, CatalogError>;

    /// Products admitted by `category`, newest first.
    fn category_members(
        &self,
        category: &Category,
        limit: usize,
    ) -> Result<Vec<Product>, CatalogError> {
        let mut members: Vec<Product> = self
            .products(CATEGORY_SCAN_LIMIT)?
            .into_iter()
            .filter(|p| category.admits(&p.category))
            .collect();
        members.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        members.truncate(limit);
        Ok(members)
    }
}

/// Looks up `ids` concurrently on `pool`.
///
/// Only lookups that finish within `budget` are returned; failed and late
/// ones are left out. Late jobs finish in the background and are discarded.
pub fn lookup_many(
    catalog: &Arc<dyn Catalog>,
    pool: &rayon::ThreadPool,
    ids: &[String],
    budget: Duration,
) -> HashMap<String, Product> {
    let mut found = HashMap::with_capacity(ids.len());
    if ids.is_empty() {
        return found;
    }

    let deadline = Instant::now() + budget;
    let (tx, rx) = mpsc::channel();
    for id in ids {
        let catalog = catalog.clone();
        let tx = tx.clone();
        let id = id.clone();
        pool.spawn(move || {
            let result = catalog.product(&id);
            let _ = tx.send((id, result));
        });
    }
    drop(tx);

    for _ in 0..ids.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((id, Ok(product))) => {
                found.insert(id, product);
            }
            Ok((id, Err(err))) => log::debug!("metadata lookup for {id} failed: {err}"),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!(
                    "metadata lookups exceeded {budget:?}, {} of {} resolved",
                    found.len(),
                    ids.len()
                );
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    found
}

/// Unwraps `{data: ...}` / `{product: ...}` envelopes around a single product.
pub(crate) fn unwrap_product(body: Value) -> Value {
    let mut body = body;
    if let Some(data) = body.get_mut("data").map(Value::take) {
        body = data;
    }
    if let Some(product) = body.get_mut("product").map(Value::take) {
        body = product;
    }
    body
}

/// Unwraps the list envelopes the product service and exports use.
pub(crate) fn unwrap_product_list(body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(mut obj) => {
            if let Some(products) = obj.remove("products") {
                return unwrap_product_list(products);
            }
            if let Some(data) = obj.remove("data") {
                return unwrap_product_list(data);
            }
            None
        }
        _ => None,
    }
}

/// Parses products, skipping entries without an id.
pub(crate) fn parse_products(items: Vec<Value>) -> Vec<Product> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<Product>(item) {
            Ok(product) if !product.id.is_empty() => Some(product),
            Ok(_) => {
                log::warn!("skipping product without id");
                None
            }
            Err(err) => {
                log::warn!("skipping malformed product: {err}");
                None
            }
        })
        .collect()
}
