//! Binary storage for the embedding store and its index.
//!
//! File format: embeddings.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 of the encoder descriptor)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, in ordinal order):
//! - embedding: [f32; dimensions] (little-endian)
//! - product_id, product_name, image_url: u32 length + UTF-8 bytes
//!
//! File format: index.bin
//!
//! Header (19 bytes):
//! - version: u8 (1)
//! - dimensions: u16
//! - entry_count: u64
//! - store_fingerprint: u32 (CRC32 of the store's ordered ids and vectors)
//! - checksum: u32
//!
//! Rows: [f32; dimensions] per entry, same ordinal order as the store.
//! Each row must equal the store vector at its ordinal; an index written
//! for another store is rejected as stale even when the ids match.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::index::FlatIndex;
use super::store::EmbeddingStore;

pub const EMBEDDINGS_FILE: &str = "embeddings.bin";
pub const INDEX_FILE: &str = "index.bin";

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const STORE_HEADER_SIZE: usize = 47;

/// version(1) + dimensions(2) + entry_count(8) + fingerprint(4) + checksum(4)
const INDEX_HEADER_SIZE: usize = 19;

/// Longest string accepted in an entry
const MAX_STRING_LEN: u32 = 64 * 1024;

/// Stored vectors must be unit length within this tolerance
const NORM_TOLERANCE: f32 = 1e-3;

/// Largest per-component difference between an index row and its store vector
const ROW_TOLERANCE: f32 = 1e-6;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Index does not belong to the loaded embedding store")]
    StaleIndex,
}

/// embeddings.bin reader/writer.
pub struct StoreFile {
    path: PathBuf,
}

impl StoreFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(EMBEDDINGS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<EmbeddingStore, VectorStorageError> {
        let mut reader = BufReader::new(File::open(&self.path)?);

        let mut header = [0u8; STORE_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        check_version(header[0])?;
        verify_checksum(&header)?;

        if header[1..33] != expected_model_id[..] {
            return Err(VectorStorageError::ModelMismatch);
        }
        let dimensions = u16::from_le_bytes([header[33], header[34]]) as usize;
        check_dimensions(dimensions, expected_dimensions)?;
        let entry_count = read_u64(&header[35..43]);

        let mut store = EmbeddingStore::with_capacity(dimensions, capacity_hint(entry_count));
        for ordinal in 0..entry_count {
            let vector = read_vector(&mut reader, dimensions)?;
            check_unit_norm(&vector, ordinal)?;
            let product_id = read_string(&mut reader)?;
            let product_name = read_string(&mut reader)?;
            let image_url = read_string(&mut reader)?;

            store
                .push_unit(&product_id, &product_name, &image_url, &vector)
                .map_err(|e| VectorStorageError::InvalidFormat(format!("entry {ordinal}: {e}")))?;
        }

        Ok(store)
    }

    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, store: &EmbeddingStore, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        write_atomic(&self.path, |writer| {
            let mut header = [0u8; STORE_HEADER_SIZE];
            header[0] = FORMAT_VERSION;
            header[1..33].copy_from_slice(model_id);
            header[33..35].copy_from_slice(&dimensions_u16(store.dimensions())?.to_le_bytes());
            header[35..43].copy_from_slice(&(store.len() as u64).to_le_bytes());
            seal_header(&mut header);
            writer.write_all(&header)?;

            for entry in store.iter() {
                write_vector(writer, entry.vector)?;
                write_string(writer, entry.product_id)?;
                write_string(writer, entry.product_name)?;
                write_string(writer, entry.image_url)?;
            }
            Ok(())
        })
    }
}

/// index.bin reader/writer.
pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(INDEX_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load an index and verify it was built from `store`.
    pub fn load(&self, store: &EmbeddingStore) -> Result<FlatIndex, VectorStorageError> {
        let mut reader = BufReader::new(File::open(&self.path)?);

        let mut header = [0u8; INDEX_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        check_version(header[0])?;
        verify_checksum(&header)?;

        let dimensions = u16::from_le_bytes([header[1], header[2]]) as usize;
        check_dimensions(dimensions, store.dimensions())?;
        let entry_count = read_u64(&header[3..11]);
        let fingerprint = u32::from_le_bytes([header[11], header[12], header[13], header[14]]);

        if entry_count != store.len() as u64 || fingerprint != store.fingerprint() {
            return Err(VectorStorageError::StaleIndex);
        }

        let mut index = FlatIndex::with_capacity(dimensions, capacity_hint(entry_count));
        for ordinal in 0..entry_count {
            let vector = read_vector(&mut reader, dimensions)?;
            check_unit_norm(&vector, ordinal)?;
            if !matches_store_row(store, ordinal, &vector) {
                log::debug!("index row {ordinal} differs from the store vector");
                return Err(VectorStorageError::StaleIndex);
            }
            index
                .push(&vector)
                .map_err(|e| VectorStorageError::InvalidFormat(format!("row {ordinal}: {e}")))?;
        }

        Ok(index)
    }

    pub fn save(&self, index: &FlatIndex, store_fingerprint: u32) -> Result<(), VectorStorageError> {
        write_atomic(&self.path, |writer| {
            let mut header = [0u8; INDEX_HEADER_SIZE];
            header[0] = FORMAT_VERSION;
            header[1..3].copy_from_slice(&dimensions_u16(index.dimensions())?.to_le_bytes());
            header[3..11].copy_from_slice(&(index.len() as u64).to_le_bytes());
            header[11..15].copy_from_slice(&store_fingerprint.to_le_bytes());
            seal_header(&mut header);
            writer.write_all(&header)?;

            for row in index.rows() {
                write_vector(writer, row)?;
            }
            Ok(())
        })
    }
}

fn matches_store_row(store: &EmbeddingStore, ordinal: u64, row: &[f32]) -> bool {
    let Some(entry) = usize::try_from(ordinal).ok().and_then(|o| store.get(o)) else {
        return false;
    };
    entry
        .vector
        .iter()
        .zip(row)
        .all(|(a, b)| (a - b).abs() <= ROW_TOLERANCE)
}

fn write_atomic<F>(path: &Path, write: F) -> Result<(), VectorStorageError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), VectorStorageError>,
{
    let temp_path = path.with_extension("tmp");

    let result = (|| -> Result<(), VectorStorageError> {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        write(&mut writer)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
        return result;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn check_version(version: u8) -> Result<(), VectorStorageError> {
    if version != FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }
    Ok(())
}

fn check_dimensions(got: usize, expected: usize) -> Result<(), VectorStorageError> {
    if got != expected {
        return Err(VectorStorageError::DimensionMismatch { expected, got });
    }
    Ok(())
}

fn dimensions_u16(dimensions: usize) -> Result<u16, VectorStorageError> {
    u16::try_from(dimensions)
        .map_err(|_| VectorStorageError::InvalidFormat(format!("{dimensions} dimensions")))
}

/// Checksum covers every header byte except the trailing 4.
fn seal_header(header: &mut [u8]) {
    let split = header.len() - 4;
    let checksum = crc32fast::hash(&header[..split]);
    header[split..].copy_from_slice(&checksum.to_le_bytes());
}

fn verify_checksum(header: &[u8]) -> Result<(), VectorStorageError> {
    let split = header.len() - 4;
    let stored = u32::from_le_bytes([
        header[split],
        header[split + 1],
        header[split + 2],
        header[split + 3],
    ]);
    if stored != crc32fast::hash(&header[..split]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }
    Ok(())
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn capacity_hint(entry_count: u64) -> usize {
    // a corrupt count must not trigger a huge allocation
    entry_count.min(1 << 20) as usize
}

fn check_unit_norm(vector: &[f32], ordinal: u64) -> Result<(), VectorStorageError> {
    let norm = super::l2_norm(vector);
    if !norm.is_finite() || (norm - 1.0).abs() > NORM_TOLERANCE {
        return Err(VectorStorageError::InvalidFormat(format!(
            "entry {ordinal} is not unit length (norm {norm})"
        )));
    }
    Ok(())
}

fn read_vector<R: Read>(reader: &mut R, dimensions: usize) -> Result<Vec<f32>, VectorStorageError> {
    let mut bytes = vec![0u8; dimensions * 4];
    reader.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn write_vector<W: Write>(writer: &mut W, vector: &[f32]) -> Result<(), VectorStorageError> {
    for &value in vector {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, VectorStorageError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len);
    if len > MAX_STRING_LEN {
        return Err(VectorStorageError::InvalidFormat(format!(
            "string length {len} exceeds limit"
        )));
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<(), VectorStorageError> {
    let len = u32::try_from(value.len())
        .ok()
        .filter(|len| *len <= MAX_STRING_LEN)
        .ok_or_else(|| VectorStorageError::InvalidFormat("string too long".into()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}
