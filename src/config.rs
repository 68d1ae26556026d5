use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

/// Default image model (CLIP ViT-B/32 vision tower)
const DEFAULT_IMAGE_MODEL: &str = "clip-vit-b-32-vision";
/// Default text model sharing CLIP's joint space
const DEFAULT_TEXT_MODEL: &str = "clip-vit-b-32-text";
const DEFAULT_PROJECTION_SEED: u64 = 42;
const DEFAULT_ENCODE_TIMEOUT_MS: u64 = 10_000;

const DEFAULT_CATALOG_URL: &str = "http://localhost:3002";
const DEFAULT_CATALOG_TIMEOUT_SECS: u64 = 10;
const DEFAULT_POOL_SIZE: usize = 200;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LOOKUP_THREADS: usize = 8;
const DEFAULT_LOOKUP_BUDGET_MS: u64 = 3_000;

const DEFAULT_CANDIDATE_K: usize = 50;
const DEFAULT_MAX_SEEDS: usize = 10;
const DEFAULT_MAX_BATCH: usize = 10;
const DEFAULT_MAX_LIMIT: usize = 50;
const DEFAULT_LIMIT: usize = 6;
const DEFAULT_CACHE_CAPACITY: usize = 1024;

const DEFAULT_PRICE_TOLERANCE: f32 = 0.5;
const DEFAULT_BRAND_BOOST: f32 = 0.05;

const DEFAULT_LISTEN: &str = "0.0.0.0:5002";

/// Image/text encoder settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_image_model")]
    pub image_model: String,

    #[serde(default = "default_text_model")]
    pub text_model: String,

    /// JSON file with the 512→256 projection head weights.
    /// A seeded random projection is used when unset.
    #[serde(default)]
    pub projection_weights: Option<PathBuf>,

    #[serde(default = "default_projection_seed")]
    pub projection_seed: u64,

    /// Worker threads for fetch + encode: "auto" or a positive integer
    #[serde(default = "default_worker_threads")]
    pub worker_threads: String,

    /// Deadline for a single fetch + encode job
    #[serde(default = "default_encode_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            image_model: default_image_model(),
            text_model: default_text_model(),
            projection_weights: None,
            projection_seed: DEFAULT_PROJECTION_SEED,
            worker_threads: default_worker_threads(),
            timeout_ms: DEFAULT_ENCODE_TIMEOUT_MS,
        }
    }
}

impl EncoderConfig {
    pub fn worker_count(&self) -> usize {
        match self.worker_threads.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

fn default_image_model() -> String {
    DEFAULT_IMAGE_MODEL.to_string()
}

fn default_text_model() -> String {
    DEFAULT_TEXT_MODEL.to_string()
}

fn default_projection_seed() -> u64 {
    DEFAULT_PROJECTION_SEED
}

fn default_worker_threads() -> String {
    "auto".to_string()
}

fn default_encode_timeout_ms() -> u64 {
    DEFAULT_ENCODE_TIMEOUT_MS
}

/// Product catalog source
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub base_url: String,

    #[serde(default = "default_catalog_timeout_secs")]
    pub timeout_secs: u64,

    /// Image download timeout
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Products encoded per query when no index is available
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Concurrent metadata lookups when enriching results
    #[serde(default = "default_lookup_threads")]
    pub lookup_threads: usize,

    /// Time allowed for all metadata lookups of one request; late ones fall
    /// back to the stored name and image
    #[serde(default = "default_lookup_budget_ms")]
    pub lookup_budget_ms: u64,

    /// Image URL template for CSV exports, `{id}` is replaced with the product id
    #[serde(default)]
    pub image_url_template: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_catalog_url(),
            timeout_secs: DEFAULT_CATALOG_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            pool_size: DEFAULT_POOL_SIZE,
            lookup_threads: DEFAULT_LOOKUP_THREADS,
            lookup_budget_ms: DEFAULT_LOOKUP_BUDGET_MS,
            image_url_template: None,
        }
    }
}

fn default_catalog_url() -> String {
    DEFAULT_CATALOG_URL.to_string()
}

fn default_catalog_timeout_secs() -> u64 {
    DEFAULT_CATALOG_TIMEOUT_SECS
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_lookup_threads() -> usize {
    DEFAULT_LOOKUP_THREADS
}

fn default_lookup_budget_ms() -> u64 {
    DEFAULT_LOOKUP_BUDGET_MS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_max_seeds")]
    pub max_seeds: usize,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Serve same-category products when retrieval finds nothing
    #[serde(default = "default_true")]
    pub category_fallback: bool,
    /// Encode the candidate pool per query when no index is loaded
    #[serde(default = "default_true")]
    pub on_the_fly: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: DEFAULT_CANDIDATE_K,
            max_seeds: DEFAULT_MAX_SEEDS,
            max_batch: DEFAULT_MAX_BATCH,
            max_limit: DEFAULT_MAX_LIMIT,
            default_limit: DEFAULT_LIMIT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            category_fallback: true,
            on_the_fly: true,
        }
    }
}

fn default_candidate_k() -> usize {
    DEFAULT_CANDIDATE_K
}

fn default_max_seeds() -> usize {
    DEFAULT_MAX_SEEDS
}

fn default_max_batch() -> usize {
    DEFAULT_MAX_BATCH
}

fn default_max_limit() -> usize {
    DEFAULT_MAX_LIMIT
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_true() -> bool {
    true
}

/// Rule engine defaults, overridable per request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub min_similarity: f32,
    #[serde(default = "default_true")]
    pub same_category_only: bool,
    #[serde(default = "default_price_tolerance")]
    pub price_tolerance: f32,
    #[serde(default = "default_true")]
    pub filter_gender: bool,
    #[serde(default = "default_true")]
    pub filter_usage: bool,
    #[serde(default = "default_brand_boost")]
    pub brand_boost: f32,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.0,
            same_category_only: true,
            price_tolerance: DEFAULT_PRICE_TOLERANCE,
            filter_gender: true,
            filter_usage: true,
            brand_boost: DEFAULT_BRAND_BOOST,
        }
    }
}

fn default_price_tolerance() -> f32 {
    DEFAULT_PRICE_TOLERANCE
}

fn default_brand_boost() -> f32 {
    DEFAULT_BRAND_BOOST
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub server: ServerConfig,

    /// Directory holding embeddings.bin / index.bin; `<base>/data` when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

/// `LOOKALIKE_BASE_PATH`, or `~/.local/share/lookalike`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("LOOKALIKE_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;

    Ok(home.join(".local/share/lookalike"))
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let rules = &self.rules;
        if !(0.0..=1.0).contains(&rules.min_similarity) {
            bail!(
                "rules.min_similarity must be between 0.0 and 1.0, got {}",
                rules.min_similarity
            );
        }
        if rules.price_tolerance < 0.0 || !rules.price_tolerance.is_finite() {
            bail!(
                "rules.price_tolerance must be a non-negative number, got {}",
                rules.price_tolerance
            );
        }
        if !(0.0..=1.0).contains(&rules.brand_boost) {
            bail!(
                "rules.brand_boost must be between 0.0 and 1.0, got {}",
                rules.brand_boost
            );
        }

        let enc = &self.encoder;
        if enc.worker_threads != "auto" {
            match enc.worker_threads.parse::<u32>() {
                Ok(0) | Err(_) => bail!(
                    "encoder.worker_threads must be 'auto' or a positive integer, got '{}'",
                    enc.worker_threads
                ),
                Ok(_) => {}
            }
        }
        if enc.timeout_ms == 0 {
            bail!("encoder.timeout_ms must be greater than 0");
        }

        if self.catalog.timeout_secs == 0 || self.catalog.fetch_timeout_secs == 0 {
            bail!("catalog timeouts must be greater than 0");
        }
        if self.catalog.lookup_threads == 0 || self.catalog.lookup_budget_ms == 0 {
            bail!("catalog.lookup_threads and catalog.lookup_budget_ms must be greater than 0");
        }

        let ret = &self.retrieval;
        if ret.candidate_k == 0 || ret.max_limit == 0 || ret.max_seeds == 0 || ret.max_batch == 0
        {
            bail!("retrieval limits must be greater than 0");
        }
        if ret.default_limit == 0 || ret.default_limit > ret.max_limit {
            bail!(
                "retrieval.default_limit must be within 1..={}, got {}",
                ret.max_limit,
                ret.default_limit
            );
        }

        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("LOOKALIKE_CATALOG_URL") {
            self.catalog.base_url = url;
        }
        if let Ok(listen) = std::env::var("LOOKALIKE_LISTEN") {
            self.server.listen = listen;
        }
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(&base_path()?)
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            std::fs::write(&path, serde_yml::to_string(&Self::default())?)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;
        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        config.apply_env();

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(self.base_path.join(CONFIG_FILE), config_str)?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join("data"))
    }

    /// Model cache lives next to the config so downloads survive rebuilds.
    pub fn models_dir(&self) -> PathBuf {
        self.base_path.join("models")
    }
}
