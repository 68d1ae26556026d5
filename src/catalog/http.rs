use std::time::Duration;

use anyhow::bail;
use reqwest::StatusCode;
use serde_json::Value;
use url::Url;

use super::{parse_products, unwrap_product, unwrap_product_list, Catalog, CatalogError, Product};

/// Client for the product service REST API.
pub struct HttpCatalog {
    base_url: Url,
    client: reqwest::blocking::Client,
}

impl HttpCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            bail!("catalog url {base_url} cannot be used as a base");
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self { base_url, client })
    }

    /// `base_url` with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn product_url(&self, id: &str) -> Url {
        self.endpoint(&["api", "products", id])
    }

    fn products_url(&self, limit: usize) -> Url {
        let mut url = self.endpoint(&["api", "products"]);
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        url
    }

    fn get(&self, url: Url) -> Result<reqwest::blocking::Response, CatalogError> {
        log::debug!("GET {url}");

        self.client.get(url.clone()).send().map_err(|err| {
            log::error!("catalog request failed: GET {url}: {err}");
            CatalogError::Unavailable(err.to_string())
        })
    }
}

fn read_json(response: reqwest::blocking::Response) -> Result<Value, CatalogError> {
    let status = response.status();
    if !status.is_success() {
        return Err(CatalogError::Unavailable(format!(
            "product service returned {status}"
        )));
    }

    response.json::<Value>().map_err(|err| {
        log::error!("failed to parse catalog response: {err}");
        CatalogError::Unavailable(err.to_string())
    })
}

impl Catalog for HttpCatalog {
    fn product(&self, id: &str) -> Result<Product, CatalogError> {
        // dot segments are dropped when the url is built
        if matches!(id, "" | "." | "..") {
            return Err(CatalogError::NotFound(id.to_string()));
        }
        let response = self.get(self.product_url(id))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound(id.to_string()));
        }

        let body = unwrap_product(read_json(response)?);
        if body.is_null() {
            return Err(CatalogError::NotFound(id.to_string()));
        }

        let mut product: Product = serde_json::from_value(body)
            .map_err(|err| CatalogError::Unavailable(format!("malformed product {id}: {err}")))?;
        if product.id.is_empty() {
            product.id = id.to_string();
        }

        Ok(product)
    }

    fn products(&self, limit: usize) -> Result<Vec<Product>, CatalogError> {
        let response = self.get(self.products_url(limit))?;
        let body = read_json(response)?;

        match unwrap_product_list(body) {
            Some(items) => {
                let mut products = parse_products(items);
                products.truncate(limit);
                Ok(products)
            }
            None => {
                log::warn!("unexpected response structure for product listing");
                Ok(vec![])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        for base in ["http://localhost:3002", "http://localhost:3002/"] {
            let catalog = HttpCatalog::new(base, Duration::from_secs(1)).unwrap();
            assert_eq!(
                catalog.products_url(10).as_str(),
                "http://localhost:3002/api/products?limit=10"
            );
            assert_eq!(
                catalog.product_url("15970").as_str(),
                "http://localhost:3002/api/products/15970"
            );
        }

        let prefixed = HttpCatalog::new("http://gateway/catalog/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            prefixed.product_url("p1").as_str(),
            "http://gateway/catalog/api/products/p1"
        );
    }

    #[test]
    fn test_product_id_is_one_path_segment() {
        let catalog = HttpCatalog::new("http://localhost:3002", Duration::from_secs(1)).unwrap();
        assert_eq!(
            catalog.product_url("x?limit=5").as_str(),
            "http://localhost:3002/api/products/x%3Flimit=5"
        );
        assert_eq!(
            catalog.product_url("../admin").as_str(),
            "http://localhost:3002/api/products/..%2Fadmin"
        );
        assert_eq!(
            catalog.product_url("a#b").as_str(),
            "http://localhost:3002/api/products/a%23b"
        );
    }

    #[test]
    fn test_dot_ids_are_not_found() {
        let catalog = HttpCatalog::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        for id in ["", ".", ".."] {
            assert!(matches!(catalog.product(id), Err(CatalogError::NotFound(_))));
        }
    }

    #[test]
    fn test_rejects_non_base_url() {
        assert!(HttpCatalog::new("mailto:catalog@example.com", Duration::from_secs(1)).is_err());
        assert!(HttpCatalog::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_unreachable_service_is_unavailable() {
        // port 9 (discard) is closed on test hosts
        let catalog = HttpCatalog::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(matches!(
            catalog.product("p1"),
            Err(CatalogError::Unavailable(_))
        ));
        assert!(matches!(
            catalog.products(10),
            Err(CatalogError::Unavailable(_))
        ));
    }
}
