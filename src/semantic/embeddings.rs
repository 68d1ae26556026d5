//! Image and text encoders.
//!
//! [`ClipEncoder`] runs CLIP ViT-B/32 through fastembed (vision tower for
//! images, paired text tower for queries), then maps the 512-d joint space
//! to 256-d with a [`ProjectionHead`] (Linear + LayerNorm) and
//! L2-normalizes the result.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions, TextEmbedding};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::EncoderConfig;
use crate::images::{self, FetchError};

use super::{l2_normalize, EMBEDDING_DIM};

/// Width of CLIP ViT-B/32's joint embedding space
pub const CLIP_DIM: usize = 512;

const LAYER_NORM_EPS: f32 = 1e-5;

/// Longest text query accepted, in characters
const MAX_TEXT_CHARS: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Image fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Product {0} has no image")]
    NoImage(String),

    #[error("Image could not be decoded: {0}")]
    Decode(String),

    #[error("Embedding generation failed: {0}")]
    Inference(String),

    #[error("Encoding timed out after {0:?}")]
    Timeout(Duration),

    #[error("Encoder produced a zero or non-finite vector")]
    Degenerate,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Text query is empty")]
    EmptyText,

    #[error("Encoder worker stopped before returning a result")]
    WorkerLost,
}

/// Maps images and text into the shared 256-d space.
///
/// Implementations hold only read-only weights; every call is independent.
pub trait Encoder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// SHA256 of everything that determines the output space.
    fn model_id(&self) -> [u8; 32];

    fn encode_image(&self, image: &[u8]) -> Result<Vec<f32>, EncodingError>;

    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodingError>;
}

/// Linear(in→out) followed by LayerNorm.
#[derive(Debug, Clone)]
pub struct ProjectionHead {
    in_dim: usize,
    out_dim: usize,
    /// Row-major [out_dim, in_dim]
    weight: Vec<f32>,
    bias: Vec<f32>,
    ln_weight: Vec<f32>,
    ln_bias: Vec<f32>,
    eps: f32,
    descriptor: String,
}

/// On-disk projection weights (PyTorch state dict exported as JSON).
#[derive(Debug, Deserialize)]
struct ProjectionWeights {
    weight: Vec<Vec<f32>>,
    bias: Vec<f32>,
    ln_weight: Vec<f32>,
    ln_bias: Vec<f32>,
    #[serde(default)]
    eps: Option<f32>,
}

impl ProjectionHead {
    /// Seeded random projection with an identity LayerNorm.
    pub fn random(in_dim: usize, out_dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = (3.0 / in_dim as f32).sqrt();
        let weight = (0..in_dim * out_dim)
            .map(|_| rng.random_range(-bound..bound))
            .collect();

        Self {
            in_dim,
            out_dim,
            weight,
            bias: vec![0.0; out_dim],
            ln_weight: vec![1.0; out_dim],
            ln_bias: vec![0.0; out_dim],
            eps: LAYER_NORM_EPS,
            descriptor: format!("random:{in_dim}x{out_dim}:{seed}"),
        }
    }

    pub fn from_json_file(path: &Path, in_dim: usize, out_dim: usize) -> Result<Self, EncodingError> {
        let data = std::fs::read(path).map_err(|e| {
            EncodingError::InitFailed(format!("failed to read {}: {e}", path.display()))
        })?;
        let weights: ProjectionWeights = serde_json::from_slice(&data)
            .map_err(|e| EncodingError::InitFailed(format!("malformed projection weights: {e}")))?;

        let shape_ok = weights.weight.len() == out_dim
            && weights.weight.iter().all(|row| row.len() == in_dim)
            && weights.bias.len() == out_dim
            && weights.ln_weight.len() == out_dim
            && weights.ln_bias.len() == out_dim;
        if !shape_ok {
            return Err(EncodingError::InitFailed(format!(
                "projection weights must be [{out_dim}x{in_dim}] with {out_dim}-d bias and norm"
            )));
        }

        let digest = Sha256::digest(&data);
        let descriptor = format!("weights:{}", hex(&digest));

        Ok(Self {
            in_dim,
            out_dim,
            weight: weights.weight.into_iter().flatten().collect(),
            bias: weights.bias,
            ln_weight: weights.ln_weight,
            ln_bias: weights.ln_bias,
            eps: weights.eps.unwrap_or(LAYER_NORM_EPS),
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Project, layer-normalize and L2-normalize one backbone vector.
    pub fn apply(&self, input: &[f32]) -> Result<Vec<f32>, EncodingError> {
        if input.len() != self.in_dim {
            return Err(EncodingError::DimensionMismatch {
                expected: self.in_dim,
                got: input.len(),
            });
        }

        let mut out: Vec<f32> = self
            .weight
            .chunks_exact(self.in_dim)
            .zip(self.bias.iter())
            .map(|(row, b)| super::dot(row, input) + b)
            .collect();

        let n = self.out_dim as f32;
        let mean = out.iter().sum::<f32>() / n;
        let var = out.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
        let denom = (var + self.eps).sqrt();
        for ((x, g), b) in out.iter_mut().zip(&self.ln_weight).zip(&self.ln_bias) {
            *x = (*x - mean) / denom * g + b;
        }

        l2_normalize(&mut out).map_err(|_| EncodingError::Degenerate)?;
        Ok(out)
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// fastembed CLIP backbone + projection head.
/// Sessions sit behind Mutexes because fastembed's embed calls require &mut self.
pub struct ClipEncoder {
    image_model: Mutex<ImageEmbedding>,
    text_model: Mutex<TextEmbedding>,
    head: ProjectionHead,
    model_id: [u8; 32],
}

impl ClipEncoder {
    /// Loads both CLIP towers, downloading them into `cache_dir` on first use.
    pub fn new(config: &EncoderConfig, cache_dir: PathBuf) -> Result<Self, EncodingError> {
        let image_enum = parse_image_model(&config.image_model)?;
        let text_enum = parse_text_model(&config.text_model)?;

        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EncodingError::InitFailed(format!("Failed to create models directory: {e}"))
        })?;

        log::info!("loading image model {}", config.image_model);
        let image_model = ImageEmbedding::try_new(
            ImageInitOptions::new(image_enum)
                .with_cache_dir(cache_dir.clone())
                .with_show_download_progress(true),
        )
        .map_err(|e| EncodingError::InitFailed(e.to_string()))?;

        log::info!("loading text model {}", config.text_model);
        let text_model = TextEmbedding::try_new(
            InitOptions::new(text_enum)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(true),
        )
        .map_err(|e| EncodingError::InitFailed(e.to_string()))?;

        let head = match &config.projection_weights {
            Some(path) => ProjectionHead::from_json_file(path, CLIP_DIM, EMBEDDING_DIM)?,
            None => {
                log::warn!(
                    "no projection weights configured, using seeded random projection (seed {})",
                    config.projection_seed
                );
                ProjectionHead::random(CLIP_DIM, EMBEDDING_DIM, config.projection_seed)
            }
        };

        let model_id = model_id_hash(&[&config.image_model, &config.text_model, head.descriptor()]);

        Ok(Self {
            image_model: Mutex::new(image_model),
            text_model: Mutex::new(text_model),
            head,
            model_id,
        })
    }
}

impl Encoder for ClipEncoder {
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    fn model_id(&self) -> [u8; 32] {
        self.model_id
    }

    fn encode_image(&self, image: &[u8]) -> Result<Vec<f32>, EncodingError> {
        images::decode(image).map_err(|e| EncodingError::Decode(e.to_string()))?;

        let mut model = self.image_model.lock().map_err(|e| {
            EncodingError::Inference(format!("Failed to acquire model lock: {e}"))
        })?;
        let embeddings = model
            .embed_bytes(&[image], None)
            .map_err(|e| EncodingError::Inference(e.to_string()))?;
        drop(model);

        let backbone = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EncodingError::Inference("No embedding returned".to_string()))?;
        self.head.apply(&backbone)
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EncodingError::EmptyText);
        }
        let text: String = text.chars().take(MAX_TEXT_CHARS).collect();

        let mut model = self.text_model.lock().map_err(|e| {
            EncodingError::Inference(format!("Failed to acquire model lock: {e}"))
        })?;
        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EncodingError::Inference(e.to_string()))?;
        drop(model);

        let backbone = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EncodingError::Inference("No embedding returned".to_string()))?;
        self.head.apply(&backbone)
    }
}

/// SHA256 over the given descriptor parts.
pub fn model_id_hash(parts: &[&str]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hasher.finalize().into()
}

fn parse_image_model(name: &str) -> Result<ImageEmbeddingModel, EncodingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32-vision" | "clip-vit-b-32" | "clipvitb32" => Ok(ImageEmbeddingModel::ClipVitB32),
        _ => Err(EncodingError::InvalidModel(format!(
            "Unknown image model: {name}. Supported models: clip-vit-b-32-vision"
        ))),
    }
}

fn parse_text_model(name: &str) -> Result<fastembed::EmbeddingModel, EncodingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32-text" | "clip-vit-b-32" | "clipvitb32" => {
            Ok(fastembed::EmbeddingModel::ClipVitB32)
        }
        _ => Err(EncodingError::InvalidModel(format!(
            "Unknown text model: {name}. Supported models: clip-vit-b-32-text"
        ))),
    }
}
