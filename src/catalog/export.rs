use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;

use super::{parse_products, unwrap_product_list, Catalog, CatalogError, Category, Product};

/// In-memory catalog loaded from a database export or a styles CSV.
pub struct ExportCatalog {
    products: Vec<Product>,
    by_id: HashMap<String, usize>,
}

/// One row of the fashion dataset's `styles.csv`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StyleRow {
    id: String,
    #[serde(default)]
    gender: String,
    #[serde(default)]
    master_category: String,
    #[serde(default)]
    sub_category: String,
    #[serde(default)]
    article_type: String,
    #[serde(default)]
    usage: String,
    #[serde(default)]
    product_display_name: String,
}

impl ExportCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        let mut kept = Vec::with_capacity(products.len());
        let mut by_id = HashMap::with_capacity(products.len());

        for product in products {
            if by_id.contains_key(&product.id) {
                log::warn!("duplicate product id {} in export, keeping the first", product.id);
                continue;
            }
            by_id.insert(product.id.clone(), kept.len());
            kept.push(product);
        }

        Self {
            products: kept,
            by_id,
        }
    }

    /// Loads `.json` exports or `.csv` style sheets based on the extension.
    pub fn open(path: &Path, image_url_template: Option<&str>) -> anyhow::Result<Self> {
        let now = Instant::now();
        let catalog = match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => {
                let template = image_url_template
                    .ok_or_else(|| anyhow!("catalog.image_url_template is required for CSV exports"))?;
                Self::from_styles_csv(path, template)?
            }
            _ => Self::from_json_export(path)?,
        };

        log::info!(
            "loaded {} products from {} in {:?}",
            catalog.len(),
            path.display(),
            now.elapsed()
        );

        Ok(catalog)
    }

    pub fn from_json_export(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read export {}", path.display()))?;
        let body: serde_json::Value = serde_json::from_str(&data).context("export is not valid json")?;

        let Some(items) = unwrap_product_list(body) else {
            bail!("export has no product list");
        };

        Ok(Self::new(parse_products(items)))
    }

    pub fn from_styles_csv(path: &Path, image_url_template: &str) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        let mut products = vec![];
        for (line, row) in reader.deserialize::<StyleRow>().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    log::warn!("skipping styles row {}: {err}", line + 2);
                    continue;
                }
            };

            let id = row.id.trim().to_string();
            if id.is_empty() {
                continue;
            }

            products.push(Product {
                images: vec![image_url_template.replace("{id}", &id)],
                name: row.product_display_name,
                category: Category::new(&row.master_category, &row.sub_category, &row.article_type),
                gender: non_blank(row.gender),
                usage: non_blank(row.usage),
                id,
                ..Default::default()
            });
        }

        Ok(Self::new(products))
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn all(&self) -> &[Product] {
        &self.products
    }
}

fn non_blank(value: String) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl Catalog for ExportCatalog {
    fn product(&self, id: &str) -> Result<Product, CatalogError> {
        self.by_id
            .get(id)
            .map(|&idx| self.products[idx].clone())
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    fn products(&self, limit: usize) -> Result<Vec<Product>, CatalogError> {
        Ok(self.products.iter().take(limit).cloned().collect())
    }
}
