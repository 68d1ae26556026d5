//! Offline embedding store + index build.
//!
//! The build is a fold over the catalog: each product either lands in the
//! store (keeping catalog order for its ordinal) or becomes a
//! [`BuildFailure`]. One bad image never aborts the run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::catalog::{Catalog, Product};
use crate::lock::FileLock;

use super::pool::EncoderPool;
use super::storage::{IndexFile, StoreFile};
use super::store::EmbeddingStore;

/// Products submitted to the encoder pool at once
const BUILD_CHUNK: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct BuildFailure {
    pub product_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub products: usize,
    pub encoded: usize,
    pub failed: usize,
    pub store_path: PathBuf,
    pub index_path: PathBuf,
    pub elapsed_ms: u128,
}

/// Encode every product's primary image into a new store.
pub fn build_store(
    products: &[Product],
    pool: &EncoderPool,
    progress: &ProgressBar,
) -> (EmbeddingStore, Vec<BuildFailure>) {
    let mut store = EmbeddingStore::with_capacity(pool.encoder().dimensions(), products.len());
    let mut failures = vec![];
    let mut seen = HashSet::new();

    for chunk in products.chunks(BUILD_CHUNK) {
        let mut jobs = vec![];
        let mut accepted = vec![];

        for product in chunk {
            if !seen.insert(product.id.as_str()) {
                failures.push(BuildFailure {
                    product_id: product.id.clone(),
                    reason: "duplicate product id".into(),
                });
                continue;
            }
            match product.primary_image() {
                Some(url) => {
                    jobs.push((product.id.clone(), url.to_string()));
                    accepted.push(product);
                }
                None => failures.push(BuildFailure {
                    product_id: product.id.clone(),
                    reason: "no image".into(),
                }),
            }
        }

        let results = pool.encode_many(&jobs);
        for (product, result) in accepted.into_iter().zip(results) {
            let outcome = result.map_err(|e| e.to_string()).and_then(|vector| {
                store
                    .push(
                        &product.id,
                        &product.name,
                        product.primary_image().unwrap_or_default(),
                        vector,
                    )
                    .map_err(|e| e.to_string())
            });

            if let Err(reason) = outcome {
                failures.push(BuildFailure {
                    product_id: product.id.clone(),
                    reason,
                });
            }
        }

        progress.inc(chunk.len() as u64);
    }

    (store, failures)
}

/// Persist `store` and a freshly built index into `dir`.
pub fn write_artifacts(dir: &Path, store: &EmbeddingStore, model_id: &[u8; 32]) -> anyhow::Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let _lock = FileLock::try_acquire(dir).context("another build holds the data directory")?;

    let store_file = StoreFile::in_dir(dir);
    store_file.save(store, model_id)?;

    let index_file = IndexFile::in_dir(dir);
    index_file.save(&store.build_index(), store.fingerprint())?;

    Ok((store_file.path().to_path_buf(), index_file.path().to_path_buf()))
}

/// Full rebuild from `catalog` into `dir`.
pub fn run(
    catalog: &dyn Catalog,
    limit: usize,
    pool: &EncoderPool,
    dir: &Path,
    show_progress: bool,
) -> anyhow::Result<BuildSummary> {
    let now = Instant::now();
    let products = catalog.products(limit).context("failed to list catalog products")?;
    if products.is_empty() {
        bail!("catalog returned no products");
    }
    log::info!("building embeddings for {} products", products.len());

    let progress = if show_progress {
        let bar = ProgressBar::new(products.len() as u64);
        if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} {elapsed_precise} eta {eta}") {
            bar.set_style(style);
        }
        bar
    } else {
        ProgressBar::hidden()
    };

    let (store, failures) = build_store(&products, pool, &progress);
    progress.finish_and_clear();

    for failure in &failures {
        log::warn!("skipped {}: {}", failure.product_id, failure.reason);
    }
    if store.is_empty() {
        bail!("no embeddings were generated, check image urls and network");
    }

    let (store_path, index_path) = write_artifacts(dir, &store, &pool.encoder().model_id())?;
    log::info!(
        "wrote {} embeddings to {} ({} skipped)",
        store.len(),
        store_path.display(),
        failures.len()
    );

    Ok(BuildSummary {
        products: products.len(),
        encoded: store.len(),
        failed: failures.len(),
        store_path,
        index_path,
        elapsed_ms: now.elapsed().as_millis(),
    })
}
