use std::collections::HashMap;

use super::index::{FlatIndex, IndexError};
use super::l2_normalize;

/// Ordinal-aligned embeddings and product references.
///
/// `vectors`, `product_ids`, `product_names` and `image_urls` always have
/// the same length; ordinal `i` names the same product in all of them.
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    dimensions: usize,
    vectors: Vec<f32>,
    product_ids: Vec<String>,
    product_names: Vec<String>,
    image_urls: Vec<String>,
    by_id: HashMap<String, usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreEntry<'a> {
    pub ordinal: usize,
    pub product_id: &'a str,
    pub product_name: &'a str,
    pub image_url: &'a str,
    pub vector: &'a [f32],
}

impl EmbeddingStore {
    pub fn new(dimensions: usize) -> Self {
        Self::with_capacity(dimensions, 0)
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            dimensions,
            vectors: Vec::with_capacity(dimensions * capacity),
            product_ids: Vec::with_capacity(capacity),
            product_names: Vec::with_capacity(capacity),
            image_urls: Vec::with_capacity(capacity),
            by_id: HashMap::with_capacity(capacity),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.product_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.product_ids.is_empty()
    }

    /// Append a product. The vector is normalized before it is stored.
    pub fn push(
        &mut self,
        product_id: &str,
        product_name: &str,
        image_url: &str,
        mut vector: Vec<f32>,
    ) -> Result<usize, IndexError> {
        self.check_entry(product_id, &vector)?;
        l2_normalize(&mut vector)?;
        Ok(self.append(product_id, product_name, image_url, &vector))
    }

    /// Append a vector that is already unit length, keeping its exact bits.
    pub(super) fn push_unit(
        &mut self,
        product_id: &str,
        product_name: &str,
        image_url: &str,
        vector: &[f32],
    ) -> Result<usize, IndexError> {
        self.check_entry(product_id, vector)?;
        Ok(self.append(product_id, product_name, image_url, vector))
    }

    fn check_entry(&self, product_id: &str, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        if self.by_id.contains_key(product_id) {
            return Err(IndexError::Duplicate(product_id.to_string()));
        }
        Ok(())
    }

    fn append(&mut self, product_id: &str, product_name: &str, image_url: &str, vector: &[f32]) -> usize {
        let ordinal = self.len();
        self.vectors.extend_from_slice(vector);
        self.product_ids.push(product_id.to_string());
        self.product_names.push(product_name.to_string());
        self.image_urls.push(image_url.to_string());
        self.by_id.insert(product_id.to_string(), ordinal);
        ordinal
    }

    pub fn ordinal_of(&self, product_id: &str) -> Option<usize> {
        self.by_id.get(product_id).copied()
    }

    pub fn get(&self, ordinal: usize) -> Option<StoreEntry<'_>> {
        let start = ordinal.checked_mul(self.dimensions)?;
        Some(StoreEntry {
            ordinal,
            product_id: self.product_ids.get(ordinal)?,
            product_name: self.product_names.get(ordinal)?,
            image_url: self.image_urls.get(ordinal)?,
            vector: self.vectors.get(start..start + self.dimensions)?,
        })
    }

    pub fn vector_for(&self, product_id: &str) -> Option<&[f32]> {
        self.ordinal_of(product_id)
            .and_then(|ordinal| self.get(ordinal))
            .map(|entry| entry.vector)
    }

    pub fn iter(&self) -> impl Iterator<Item = StoreEntry<'_>> {
        (0..self.len()).filter_map(move |ordinal| self.get(ordinal))
    }

    pub fn product_ids(&self) -> &[String] {
        &self.product_ids
    }

    /// CRC32 over the ordered product ids and their vectors; ties an index
    /// file to this store.
    pub fn fingerprint(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for entry in self.iter() {
            hasher.update(entry.product_id.as_bytes());
            hasher.update(&[0]);
            for value in entry.vector {
                hasher.update(&value.to_le_bytes());
            }
        }
        hasher.finalize()
    }

    /// Index over this store's vectors; shares its ordinal space.
    pub fn build_index(&self) -> FlatIndex {
        let mut index = FlatIndex::with_capacity(self.dimensions, self.len());
        for entry in self.iter() {
            // rows were validated on push
            let _ = index.push(entry.vector);
        }
        index
    }
}
