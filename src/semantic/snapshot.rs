use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::index::FlatIndex;
use super::storage::{IndexFile, StoreFile, VectorStorageError};
use super::store::EmbeddingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetrievalMode {
    /// Persisted index over the loaded store
    Indexed,
    /// Candidate pool encoded at query time
    OnTheFly,
}

/// An immutable store + index pair.
///
/// `index`, when present, shares the store's ordinal space.
#[derive(Debug)]
pub struct Snapshot {
    store: Option<EmbeddingStore>,
    index: Option<FlatIndex>,
    loaded_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            store: None,
            index: None,
            loaded_at: Utc::now(),
        }
    }

    pub fn new(store: EmbeddingStore, index: Option<FlatIndex>) -> Self {
        let index = index.filter(|index| {
            let aligned = index.len() == store.len() && index.dimensions() == store.dimensions();
            if !aligned {
                log::warn!(
                    "index ({} rows) does not match store ({} entries), ignoring it",
                    index.len(),
                    store.len()
                );
            }
            aligned
        });

        Self {
            store: Some(store),
            index,
            loaded_at: Utc::now(),
        }
    }

    /// Read embeddings.bin and index.bin from `dir`.
    ///
    /// A missing or unreadable store yields an empty snapshot; a missing,
    /// stale or corrupt index leaves the store loaded without one.
    pub fn load_from_dir(dir: &Path, model_id: &[u8; 32], dimensions: usize) -> Self {
        let store_file = StoreFile::in_dir(dir);
        if !store_file.exists() {
            log::info!("no embedding store at {}", store_file.path().display());
            return Self::empty();
        }

        let store = match store_file.load(model_id, dimensions) {
            Ok(store) => store,
            Err(err) => {
                log::error!("failed to load {}: {err}", store_file.path().display());
                return Self::empty();
            }
        };

        let index_file = IndexFile::in_dir(dir);
        let index = if index_file.exists() {
            match index_file.load(&store) {
                Ok(index) => Some(index),
                Err(VectorStorageError::StaleIndex) => {
                    log::warn!("{} is stale, rebuild required", index_file.path().display());
                    None
                }
                Err(err) => {
                    log::error!("failed to load {}: {err}", index_file.path().display());
                    None
                }
            }
        } else {
            log::info!("no similarity index at {}", index_file.path().display());
            None
        };

        log::info!(
            "loaded snapshot: {} embeddings, index {}",
            store.len(),
            if index.is_some() { "present" } else { "absent" }
        );

        Self::new(store, index)
    }

    pub fn store(&self) -> Option<&EmbeddingStore> {
        self.store.as_ref()
    }

    /// Store and index, only when both are usable.
    pub fn indexed(&self) -> Option<(&EmbeddingStore, &FlatIndex)> {
        match (&self.store, &self.index) {
            (Some(store), Some(index)) => Some((store, index)),
            _ => None,
        }
    }

    pub fn mode(&self) -> RetrievalMode {
        if self.indexed().is_some() {
            RetrievalMode::Indexed
        } else {
            RetrievalMode::OnTheFly
        }
    }

    pub fn store_len(&self) -> usize {
        self.store.as_ref().map(EmbeddingStore::len).unwrap_or(0)
    }

    pub fn index_len(&self) -> usize {
        self.index.as_ref().map(FlatIndex::len).unwrap_or(0)
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// The active snapshot. Readers clone the `Arc` and keep using it even if
/// a reload swaps in a newer one mid-request.
pub struct SnapshotHandle {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotHandle {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Install `snapshot`, returning the one it replaced.
    pub fn swap(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let next = Arc::new(snapshot);
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, next)
    }
}
