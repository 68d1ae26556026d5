//! Candidate retrieval in indexed or on-the-fly mode.
//!
//! Both modes end in [`FlatIndex::search`]: on-the-fly mode encodes the
//! candidate pool into a transient store and searches its index, so scores
//! and tie-breaks are identical to the persisted path. The category-restricted
//! search works the same way over the members of one category.
//!
//! [`FlatIndex::search`]: crate::semantic::FlatIndex::search

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::catalog::{Catalog, Category, Product};
use crate::semantic::{EmbeddingStore, EncoderPool, Snapshot, StoreEntry};

use super::errors::RecommendError;

/// A retrieved product reference and its raw similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub product_id: String,
    pub product_name: String,
    pub image_url: String,
    pub similarity: f32,
    /// Catalog record, when retrieval already had it
    pub product: Option<Product>,
}

impl Candidate {
    fn from_entry(entry: StoreEntry<'_>, similarity: f32) -> Self {
        Self {
            product_id: entry.product_id.to_string(),
            product_name: entry.product_name.to_string(),
            image_url: entry.image_url.to_string(),
            similarity,
            product: None,
        }
    }

    /// The catalog record, or a bare one built from the stored references.
    pub fn into_product(self) -> Product {
        match self.product {
            Some(product) => product,
            None => Product {
                id: self.product_id,
                name: self.product_name,
                images: if self.image_url.is_empty() {
                    vec![]
                } else {
                    vec![self.image_url]
                },
                ..Default::default()
            },
        }
    }
}

pub struct Retriever {
    catalog: Arc<dyn Catalog>,
    pool: Arc<EncoderPool>,
    pool_size: usize,
    on_the_fly: bool,
}

impl Retriever {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        pool: Arc<EncoderPool>,
        pool_size: usize,
        on_the_fly: bool,
    ) -> Self {
        Self {
            catalog,
            pool,
            pool_size,
            on_the_fly,
        }
    }

    /// Stored embedding for `product`, or its primary image encoded now.
    pub fn query_vector(&self, snapshot: &Snapshot, product: &Product) -> Result<Vec<f32>, RecommendError> {
        if let Some(vector) = snapshot.store().and_then(|s| s.vector_for(&product.id)) {
            return Ok(vector.to_vec());
        }

        log::debug!("{} is not in the store, encoding its image", product.id);
        let vector = self.pool.encode_product(product)?;
        Ok(vector.as_ref().clone())
    }

    /// Top `k` candidates for `query`, never including an `exclude`d id.
    pub fn retrieve(
        &self,
        snapshot: &Snapshot,
        query: &[f32],
        k: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<Candidate>, RecommendError> {
        if let Some((store, index)) = snapshot.indexed() {
            let hits = index.search(query, k + exclude.len())?;
            return Ok(hits
                .into_iter()
                .filter_map(|hit| store.get(hit.ordinal).map(|e| (e, hit.score)))
                .filter(|(entry, _)| !exclude.contains(entry.product_id))
                .take(k)
                .map(|(entry, score)| Candidate::from_entry(entry, score))
                .collect());
        }

        if !self.on_the_fly {
            return Err(RecommendError::IndexUnavailable);
        }
        self.retrieve_on_the_fly(query, k, exclude)
    }

    fn retrieve_on_the_fly(
        &self,
        query: &[f32],
        k: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<Candidate>, RecommendError> {
        let products: Vec<Product> = self
            .catalog
            .products(self.pool_size)?
            .into_iter()
            .filter(|p| !exclude.contains(&p.id))
            .collect();

        self.search_products(None, query, &products, k, true)
    }

    /// Top `k` of the catalog products `category` admits.
    ///
    /// Stored vectors are reused. Members missing from the store are encoded
    /// only in on-the-fly mode.
    pub fn retrieve_within(
        &self,
        snapshot: &Snapshot,
        query: &[f32],
        category: &Category,
        k: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<Candidate>, RecommendError> {
        let members: Vec<Product> = self
            .catalog
            .category_members(category, self.pool_size)?
            .into_iter()
            .filter(|p| !exclude.contains(&p.id))
            .collect();

        self.search_products(snapshot.store(), query, &members, k, self.on_the_fly)
    }

    /// Ranks `products` against `query` through a transient store.
    fn search_products(
        &self,
        stored: Option<&EmbeddingStore>,
        query: &[f32],
        products: &[Product],
        k: usize,
        encode_missing: bool,
    ) -> Result<Vec<Candidate>, RecommendError> {
        let missing: Vec<Product> = if encode_missing {
            products
                .iter()
                .filter(|p| stored.and_then(|s| s.vector_for(&p.id)).is_none())
                .cloned()
                .collect()
        } else {
            vec![]
        };
        let encoded: HashMap<&str, Arc<Vec<f32>>> = self
            .pool
            .encode_products(&missing)
            .into_iter()
            .map(|(p, vector)| (p.id.as_str(), vector))
            .collect();

        let mut store = EmbeddingStore::with_capacity(query.len(), products.len());
        let mut members = Vec::with_capacity(products.len());
        for product in products {
            let vector = match stored.and_then(|s| s.vector_for(&product.id)) {
                Some(vector) => vector.to_vec(),
                None => match encoded.get(product.id.as_str()) {
                    Some(vector) => vector.as_ref().clone(),
                    None => continue,
                },
            };
            let url = product.primary_image().unwrap_or_default();
            match store.push(&product.id, &product.name, url, vector) {
                Ok(_) => members.push(product),
                Err(err) => log::warn!("skipping {}: {err}", product.id),
            }
        }
        log::debug!(
            "transient pool: {} of {} products have vectors",
            members.len(),
            products.len()
        );

        let hits = store.build_index().search(query, k)?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let entry = store.get(hit.ordinal)?;
                let mut candidate = Candidate::from_entry(entry, hit.score);
                candidate.product = members.get(hit.ordinal).map(|p| (*p).clone());
                Some(candidate)
            })
            .collect())
    }
}
