//! Multi-seed personalization.
//!
//! Every seed is searched on its own and the results are merged by product
//! id keeping the best score any seed gave it. Seeds are weighted equally
//! regardless of recency.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;

use crate::catalog::Catalog;
use crate::semantic::Snapshot;

use super::errors::RecommendError;
use super::retriever::{Candidate, Retriever};

/// Seed ids de-duplicated, first occurrence kept.
pub fn dedup_seeds(seeds: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    seeds
        .iter()
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect()
}

/// Union of per-seed results, max-merged, seeds removed, best first.
///
/// Equal scores are ordered by ascending product id.
pub fn aggregate(per_seed: Vec<Vec<Candidate>>, seeds: &HashSet<String>) -> Vec<Candidate> {
    let mut merged: HashMap<String, Candidate> = HashMap::new();

    for candidate in per_seed.into_iter().flatten() {
        if seeds.contains(&candidate.product_id) {
            continue;
        }
        match merged.get_mut(&candidate.product_id) {
            Some(existing) if existing.similarity >= candidate.similarity => {
                if existing.product.is_none() {
                    existing.product = candidate.product;
                }
            }
            Some(existing) => {
                let product = existing.product.take();
                *existing = candidate;
                if existing.product.is_none() {
                    existing.product = product;
                }
            }
            None => {
                merged.insert(candidate.product_id.clone(), candidate);
            }
        }
    }

    let mut merged: Vec<Candidate> = merged.into_values().collect();
    merged.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.product_id.cmp(&b.product_id))
    });
    merged
}

/// Retrieve `k` candidates per seed in parallel and aggregate them.
///
/// A seed that cannot be resolved contributes nothing. With an index
/// loaded, seeds missing from the store are skipped; without one, the
/// seed's product is fetched and its image encoded.
pub fn personalize(
    retriever: &Retriever,
    catalog: &dyn Catalog,
    snapshot: &Snapshot,
    seeds: &[String],
    k: usize,
) -> Vec<Candidate> {
    let seeds = dedup_seeds(seeds);
    let exclude: HashSet<String> = seeds.iter().cloned().collect();

    let per_seed: Vec<Vec<Candidate>> = seeds
        .par_iter()
        .filter_map(|seed| {
            let query = match snapshot.store().and_then(|s| s.vector_for(seed)) {
                Some(vector) => vector.to_vec(),
                None if snapshot.indexed().is_some() => {
                    log::debug!("seed {seed} is not in the store, skipping");
                    return None;
                }
                None => {
                    let resolved = catalog
                        .product(seed)
                        .map_err(RecommendError::from)
                        .and_then(|product| retriever.query_vector(snapshot, &product));
                    match resolved {
                        Ok(vector) => vector,
                        Err(err) => {
                            log::warn!("seed {seed} skipped: {err}");
                            return None;
                        }
                    }
                }
            };

            match retriever.retrieve(snapshot, &query, k, &exclude) {
                Ok(candidates) => Some(candidates),
                Err(err) => {
                    log::warn!("retrieval for seed {seed} failed: {err}");
                    None
                }
            }
        })
        .collect();

    aggregate(per_seed, &exclude)
}
