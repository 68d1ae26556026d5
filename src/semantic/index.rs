//! Exact inner-product index.
//!
//! Vectors are stored row-major in one contiguous buffer; the row number is
//! the ordinal shared with the [`EmbeddingStore`](super::EmbeddingStore).
//! Search scores every row and keeps the top `k` under the total order
//! (score descending, ordinal ascending), so results are reproducible.

use std::cmp::Ordering;

use rayon::prelude::*;

/// Rows below this are scored on the calling thread.
const PARALLEL_THRESHOLD: usize = 4096;

/// A search hit: ordinal into the index and its inner-product score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub ordinal: usize,
    pub score: f32,
}

impl Hit {
    /// Higher score first, lower ordinal on ties.
    pub fn rank_cmp(&self, other: &Hit) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then(self.ordinal.cmp(&other.ordinal))
    }
}

#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimensions: usize,
    vectors: Vec<f32>,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Vector contains non-finite values")]
    NonFinite,

    #[error("Duplicate product id {0}")]
    Duplicate(String),
}

impl FlatIndex {
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            dimensions,
            vectors: Vec::with_capacity(dimensions * capacity),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.vectors.len() / self.dimensions
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Append a row, returning its ordinal.
    pub fn push(&mut self, vector: &[f32]) -> Result<usize, IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        check_vector(vector)?;

        let ordinal = self.len();
        self.vectors.extend_from_slice(vector);
        Ok(ordinal)
    }

    pub fn vector(&self, ordinal: usize) -> Option<&[f32]> {
        let start = ordinal.checked_mul(self.dimensions)?;
        self.vectors.get(start..start + self.dimensions)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.vectors.chunks_exact(self.dimensions.max(1))
    }

    /// Top `k` rows by inner product with `query`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        check_vector(query)?;

        if k == 0 || self.is_empty() {
            return Ok(vec![]);
        }

        let scores: Vec<f32> = if self.len() >= PARALLEL_THRESHOLD {
            self.vectors
                .par_chunks_exact(self.dimensions)
                .map(|row| dot(query, row))
                .collect()
        } else {
            self.rows().map(|row| dot(query, row)).collect()
        };

        let mut hits: Vec<Hit> = scores
            .into_iter()
            .enumerate()
            .map(|(ordinal, score)| Hit { ordinal, score })
            .collect();

        if hits.len() > k {
            hits.select_nth_unstable_by(k - 1, Hit::rank_cmp);
            hits.truncate(k);
        }
        hits.sort_unstable_by(Hit::rank_cmp);

        Ok(hits)
    }
}

fn check_vector(v: &[f32]) -> Result<(), IndexError> {
    if v.iter().any(|x| !x.is_finite()) {
        return Err(IndexError::NonFinite);
    }
    if super::l2_norm(v) < f32::EPSILON {
        return Err(IndexError::ZeroNormVector);
    }
    Ok(())
}

/// Inner product. Equals cosine similarity for unit vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::l2_normalize;

    fn unit(v: &[f32]) -> Vec<f32> {
        let mut v = v.to_vec();
        l2_normalize(&mut v).unwrap();
        v
    }

    #[test]
    fn test_new_index() {
        let index = FlatIndex::with_capacity(256, 0);
        assert_eq!(index.dimensions(), 256);
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_push_returns_ordinals() {
        let mut index = FlatIndex::with_capacity(3, 0);
        assert_eq!(index.push(&[1.0, 0.0, 0.0]).unwrap(), 0);
        assert_eq!(index.push(&[0.0, 1.0, 0.0]).unwrap(), 1);
        assert_eq!(index.vector(1).unwrap(), &[0.0, 1.0, 0.0]);
        assert!(index.vector(2).is_none());
    }

    #[test]
    fn test_push_rejects_bad_vectors() {
        let mut index = FlatIndex::with_capacity(3, 0);
        assert!(matches!(
            index.push(&[1.0, 0.0]),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert_eq!(index.push(&[0.0, 0.0, 0.0]), Err(IndexError::ZeroNormVector));
        assert_eq!(index.push(&[f32::INFINITY, 0.0, 0.0]), Err(IndexError::NonFinite));
    }

    #[test]
    fn test_search_orders_by_score() {
        let mut index = FlatIndex::with_capacity(3, 0);
        index.push(&unit(&[0.0, 1.0, 0.0])).unwrap();
        index.push(&unit(&[1.0, 0.0, 0.0])).unwrap();
        index.push(&unit(&[1.0, 1.0, 0.0])).unwrap();

        let hits = index.search(&unit(&[1.0, 0.1, 0.0]), 10).unwrap();
        let ordinals: Vec<usize> = hits.iter().map(|h| h.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 0]);
        assert!(hits[0].score <= 1.0 + 1e-6);
    }

    #[test]
    fn test_self_similarity_is_one() {
        let v = unit(&[0.3, -0.2, 0.9]);
        let mut index = FlatIndex::with_capacity(3, 0);
        index.push(&v).unwrap();

        let hits = index.search(&v, 1).unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_ties_break_by_ordinal() {
        let mut index = FlatIndex::with_capacity(2, 0);
        for _ in 0..5 {
            index.push(&[1.0, 0.0]).unwrap();
        }

        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        let ordinals: Vec<usize> = hits.iter().map(|h| h.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn test_search_with_limit() {
        let mut index = FlatIndex::with_capacity(3, 0);
        for i in 0..10 {
            index.push(&unit(&[1.0, i as f32 * 0.1, 0.0])).unwrap();
        }

        let hits = index.search(&[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].ordinal, 0);
        assert!(index.search(&[1.0, 0.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_parallel_path_matches_serial() {
        let dims = 8;
        let mut index = FlatIndex::with_capacity(dims, 0);
        for i in 0..(PARALLEL_THRESHOLD + 10) {
            let v: Vec<f32> = (0..dims).map(|d| ((i * 31 + d * 7) % 17) as f32 + 1.0).collect();
            index.push(&unit(&v)).unwrap();
        }
        let query = unit(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        let hits = index.search(&query, 20).unwrap();

        let mut expected: Vec<Hit> = index
            .rows()
            .enumerate()
            .map(|(ordinal, row)| Hit {
                ordinal,
                score: dot(&query, row),
            })
            .collect();
        expected.sort_by(Hit::rank_cmp);
        expected.truncate(20);

        assert_eq!(hits, expected);
    }
}
