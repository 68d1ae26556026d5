//! Visual embedding infrastructure.
//!
//! # Architecture
//!
//! - `embeddings`: CLIP image/text encoder with a 512→256 projection head
//! - `store`: ordinal-aligned vectors + product id/name/url arrays
//! - `index`: exact inner-product index over the store's vectors
//! - `storage`: binary persistence for embeddings.bin and index.bin
//! - `snapshot`: immutable store+index pair behind an atomically swapped `Arc`
//! - `pool`: bounded worker pool for fetch + encode with deadlines
//! - `build`: offline store/index build

pub mod build;
pub mod embeddings;
mod index;
pub mod pool;
pub mod snapshot;
mod storage;
mod store;

pub use embeddings::{ClipEncoder, Encoder, EncodingError};
pub use index::{dot, FlatIndex, Hit, IndexError};
pub use pool::EncoderPool;
pub use snapshot::{RetrievalMode, Snapshot, SnapshotHandle};
pub use storage::{IndexFile, StoreFile, VectorStorageError, EMBEDDINGS_FILE, INDEX_FILE};
pub use store::{EmbeddingStore, StoreEntry};

/// Dimension of every embedding served by the engine
pub const EMBEDDING_DIM: usize = 256;

/// Scale `v` to unit length in place. Fails on zero or non-finite norms.
pub fn l2_normalize(v: &mut [f32]) -> Result<(), IndexError> {
    let norm = l2_norm(v);
    if !norm.is_finite() {
        return Err(IndexError::NonFinite);
    }
    if norm < f32::EPSILON {
        return Err(IndexError::ZeroNormVector);
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Ok(())
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);

        assert!(matches!(
            l2_normalize(&mut [0.0, 0.0]),
            Err(IndexError::ZeroNormVector)
        ));
        assert!(matches!(
            l2_normalize(&mut [f32::NAN, 1.0]),
            Err(IndexError::NonFinite)
        ));
    }
}
