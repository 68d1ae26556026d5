//! Bounded worker pool for image fetch + encode.
//!
//! Inference never runs on the request thread: jobs are spawned on a
//! dedicated rayon pool and the caller waits on a channel with a deadline.
//! A job that misses its deadline is reported as
//! [`EncodingError::Timeout`]; its eventual result is discarded.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use crate::catalog::Product;
use crate::images::ImageFetcher;

use super::embeddings::{Encoder, EncodingError};

pub struct EncoderPool {
    pool: rayon::ThreadPool,
    encoder: Arc<dyn Encoder>,
    fetcher: Arc<dyn ImageFetcher>,
    timeout: Duration,
    cache: EmbeddingCache,
}

impl EncoderPool {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        fetcher: Arc<dyn ImageFetcher>,
        threads: usize,
        timeout: Duration,
        cache_capacity: usize,
    ) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("encoder-{i}"))
            .build()?;

        Ok(Self {
            pool,
            encoder,
            fetcher,
            timeout,
            cache: EmbeddingCache::new(cache_capacity),
        })
    }

    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.encoder
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Run one job on the pool, waiting at most `timeout`.
    fn run<F>(&self, job: F) -> Result<Vec<f32>, EncodingError>
    where
        F: FnOnce() -> Result<Vec<f32>, EncodingError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.pool.spawn(move || {
            let _ = tx.send(job());
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(EncodingError::Timeout(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(EncodingError::WorkerLost),
        }
    }

    pub fn encode_bytes(&self, image: Vec<u8>) -> Result<Vec<f32>, EncodingError> {
        let encoder = self.encoder.clone();
        self.run(move || encoder.encode_image(&image))
    }

    pub fn encode_url(&self, url: &str) -> Result<Vec<f32>, EncodingError> {
        let job = self.fetch_and_encode(url.to_string());
        self.run(job)
    }

    pub fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodingError> {
        let encoder = self.encoder.clone();
        let text = text.to_string();
        self.run(move || encoder.encode_text(&text))
    }

    /// Encode a product's primary image, memoized by product id.
    pub fn encode_product(&self, product: &Product) -> Result<Arc<Vec<f32>>, EncodingError> {
        if let Some(hit) = self.cache.get(&product.id) {
            return Ok(hit);
        }

        let url = product
            .primary_image()
            .ok_or_else(|| EncodingError::NoImage(product.id.clone()))?;
        let vector = Arc::new(self.encode_url(url)?);
        self.cache.insert(&product.id, vector.clone());

        Ok(vector)
    }

    /// Fetch + encode many `(key, url)` pairs concurrently.
    ///
    /// Results come back in input order. An item whose own fetch + encode
    /// exceeds the timeout, or that is still queued when the batch deadline
    /// runs out, is returned as a timeout.
    pub fn encode_many(&self, items: &[(String, String)]) -> Vec<Result<Vec<f32>, EncodingError>> {
        if items.is_empty() {
            return vec![];
        }

        let (tx, rx) = mpsc::channel();
        for (pos, (_, url)) in items.iter().enumerate() {
            let tx = tx.clone();
            let job = self.fetch_and_encode(url.clone());
            let timeout = self.timeout;
            self.pool.spawn(move || {
                let started = Instant::now();
                let mut result = job();
                if result.is_ok() && started.elapsed() > timeout {
                    result = Err(EncodingError::Timeout(timeout));
                }
                let _ = tx.send((pos, result));
            });
        }
        drop(tx);

        let waves = items.len().div_ceil(self.threads()) as u32;
        let deadline = Instant::now() + self.timeout * waves;

        let mut results: Vec<Option<Result<Vec<f32>, EncodingError>>> =
            (0..items.len()).map(|_| None).collect();
        let mut received = 0;
        while received < items.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((pos, result)) => {
                    results[pos] = Some(result);
                    received += 1;
                }
                Err(_) => break,
            }
        }

        results
            .into_iter()
            .zip(items)
            .map(|(result, (key, _))| {
                result.unwrap_or_else(|| {
                    log::warn!("encoding {key} missed the batch deadline");
                    Err(EncodingError::Timeout(self.timeout))
                })
            })
            .collect()
    }

    /// Encode products' primary images through the cache.
    /// Products without images or failing to encode are dropped.
    pub fn encode_products<'a>(&self, products: &'a [Product]) -> Vec<(&'a Product, Arc<Vec<f32>>)> {
        let mut encoded: Vec<Option<Arc<Vec<f32>>>> = products
            .iter()
            .map(|p| self.cache.get(&p.id))
            .collect();

        let misses: Vec<(usize, (String, String))> = products
            .iter()
            .enumerate()
            .filter(|(pos, _)| encoded[*pos].is_none())
            .filter_map(|(pos, p)| {
                p.primary_image()
                    .map(|url| (pos, (p.id.clone(), url.to_string())))
            })
            .collect();

        if !misses.is_empty() {
            let jobs: Vec<(String, String)> = misses.iter().map(|(_, item)| item.clone()).collect();
            for ((pos, (key, _)), result) in misses.iter().zip(self.encode_many(&jobs)) {
                match result {
                    Ok(vector) => {
                        let vector = Arc::new(vector);
                        self.cache.insert(key, vector.clone());
                        encoded[*pos] = Some(vector);
                    }
                    Err(err) => log::warn!("skipping {key}: {err}"),
                }
            }
        }

        products
            .iter()
            .zip(encoded)
            .filter_map(|(p, v)| v.map(|v| (p, v)))
            .collect()
    }

    fn fetch_and_encode(
        &self,
        url: String,
    ) -> impl FnOnce() -> Result<Vec<f32>, EncodingError> + Send + 'static {
        let encoder = self.encoder.clone();
        let fetcher = self.fetcher.clone();
        move || {
            let bytes = fetcher.fetch(&url)?;
            encoder.encode_image(&bytes)
        }
    }
}

/// Process-local product id → embedding memo. Cleared when full.
pub struct EmbeddingCache {
    entries: Mutex<HashMap<String, Arc<Vec<f32>>>>,
    capacity: usize,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: &str, vector: Arc<Vec<f32>>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.capacity && !entries.contains_key(key) {
            log::debug!("embedding cache full ({} entries), clearing", entries.len());
            entries.clear();
        }
        entries.insert(key.to_string(), vector);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
