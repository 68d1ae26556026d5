//! Deterministic stand-ins for the encoder, image host and catalog.
//!
//! "Images" are small text payloads the fake encoder understands:
//! `seed:N` expands to a pseudo-random unit vector, `vec:a,b,c` is
//! zero-padded to the embedding width and normalized.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::StatusCode;

use crate::catalog::{Catalog, CatalogError, Category, Product};
use crate::images::{FetchError, ImageFetcher};
use crate::semantic::{l2_normalize, Encoder, EncodingError, EMBEDDING_DIM};

pub const FAKE_MODEL_ID: [u8; 32] = [42u8; 32];

pub struct FakeEncoder {
    dimensions: usize,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self {
            dimensions: EMBEDDING_DIM,
        }
    }

    fn vector_from(&self, payload: &str) -> Result<Vec<f32>, EncodingError> {
        let mut vector = if let Some(seed) = payload.strip_prefix("seed:") {
            let seed: u64 = seed
                .trim()
                .parse()
                .map_err(|_| EncodingError::Decode(format!("bad seed {seed}")))?;
            let mut rng = StdRng::seed_from_u64(seed);
            (0..self.dimensions)
                .map(|_| rng.random_range(-1.0f32..1.0))
                .collect()
        } else if let Some(values) = payload.strip_prefix("vec:") {
            let mut vector = values
                .split(',')
                .map(|v| v.trim().parse::<f32>())
                .collect::<Result<Vec<f32>, _>>()
                .map_err(|e| EncodingError::Decode(e.to_string()))?;
            vector.resize(self.dimensions, 0.0);
            vector
        } else {
            return Err(EncodingError::Decode("unrecognized payload".into()));
        };

        l2_normalize(&mut vector).map_err(|_| EncodingError::Degenerate)?;
        Ok(vector)
    }
}

impl Encoder for FakeEncoder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> [u8; 32] {
        FAKE_MODEL_ID
    }

    fn encode_image(&self, image: &[u8]) -> Result<Vec<f32>, EncodingError> {
        let payload = std::str::from_utf8(image)
            .map_err(|_| EncodingError::Decode("not a fake image".into()))?;
        self.vector_from(payload)
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EncodingError::EmptyText);
        }
        if text.starts_with("vec:") || text.starts_with("seed:") {
            return self.vector_from(text);
        }
        self.vector_from(&format!("seed:{}", crc32fast::hash(text.as_bytes())))
    }
}

#[derive(Clone, Default)]
pub struct FakeFetcher {
    images: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
    calls: Arc<AtomicUsize>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, url: &str, seed: u64) -> Self {
        self.images
            .insert(url.to_string(), format!("seed:{seed}").into_bytes());
        self
    }

    pub fn with_vector(mut self, url: &str, vector: &[f32]) -> Self {
        self.images.insert(url.to_string(), vec_payload(vector).into_bytes());
        self
    }

    pub fn with_delay(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    /// Number of fetches served so far, shared with clones.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl ImageFetcher for FakeFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(url) {
            std::thread::sleep(*delay);
        }
        self.images
            .get(url)
            .cloned()
            .ok_or(FetchError::Status(StatusCode::NOT_FOUND))
    }
}

pub fn vec_payload(vector: &[f32]) -> String {
    let values: Vec<String> = vector.iter().map(|v| v.to_string()).collect();
    format!("vec:{}", values.join(","))
}

/// In-memory catalog that can be switched off to simulate an outage.
pub struct FakeCatalog {
    products: Mutex<Vec<Product>>,
    delays: Mutex<HashMap<String, Duration>>,
    unavailable: AtomicBool,
}

impl FakeCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            products: Mutex::new(products),
            delays: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Slows down single-product lookups of `id`.
    pub fn set_delay(&self, id: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(id.to_string(), delay);
    }

    pub fn push(&self, product: Product) {
        self.products.lock().unwrap().push(product);
    }

    fn check(&self) -> Result<(), CatalogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

impl Catalog for FakeCatalog {
    fn product(&self, id: &str) -> Result<Product, CatalogError> {
        self.check()?;
        let delay = self.delays.lock().unwrap().get(id).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.products
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    fn products(&self, limit: usize) -> Result<Vec<Product>, CatalogError> {
        self.check()?;
        Ok(self.products.lock().unwrap().iter().take(limit).cloned().collect())
    }
}

pub fn image_url(id: &str) -> String {
    format!("https://cdn.test/{id}.jpg")
}

pub fn product(id: &str, category: (&str, &str, &str)) -> Product {
    Product {
        id: id.to_string(),
        name: format!("Product {id}"),
        category: Category::new(category.0, category.1, category.2),
        images: vec![image_url(id)],
        ..Default::default()
    }
}

pub fn created(product: Product, rfc3339: &str) -> Product {
    Product {
        created_at: DateTime::parse_from_rfc3339(rfc3339)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        ..product
    }
}
