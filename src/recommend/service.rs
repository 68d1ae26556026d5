use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::catalog::{self, Catalog, Product};
use crate::config::{Config, RetrievalConfig, RulesConfig};
use crate::lock::FileLock;
use crate::semantic::embeddings::hex;
use crate::semantic::{EncoderPool, RetrievalMode, Snapshot, SnapshotHandle};

use super::aggregator;
use super::errors::{ErrorKind, RecommendError};
use super::retriever::{Candidate, Retriever};
use super::rules::{self, RecommendOptions, RuleSettings, RuleTarget, ScoredCandidate};

/// Score given to category fallback items.
pub const FALLBACK_SCORE: f32 = 0.5;

/// What to search with in [`RecommendationService::similar_by_image`].
#[derive(Debug, Clone)]
pub enum VisualQuery {
    Image(Vec<u8>),
    ImageUrl(String),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    Visual,
    Text,
    Personalized,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Product>,
    pub items: Vec<ScoredCandidate>,
    pub method: Method,
    pub mode: RetrievalMode,
}

impl Recommendations {
    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|c| c.product.id.as_str()).collect()
    }
}

/// Per-id outcome of a batch call.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchItem {
    Ok { ok: Recommendations },
    Failed { error: String, kind: ErrorKind },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub mode: RetrievalMode,
    pub store_size: usize,
    pub index_size: usize,
    pub loaded_at: DateTime<Utc>,
    pub cached_embeddings: usize,
    pub encoder_threads: usize,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub mode: RetrievalMode,
    pub indexed_products: usize,
}

pub struct RecommendationService {
    catalog: Arc<dyn Catalog>,
    pool: Arc<EncoderPool>,
    lookups: rayon::ThreadPool,
    lookup_budget: Duration,
    retriever: Retriever,
    snapshot: SnapshotHandle,
    retrieval: RetrievalConfig,
    rules: RulesConfig,
    data_dir: PathBuf,
}

impl RecommendationService {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        pool: Arc<EncoderPool>,
        snapshot: Snapshot,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let lookups = rayon::ThreadPoolBuilder::new()
            .num_threads(config.catalog.lookup_threads.max(1))
            .thread_name(|i| format!("lookup-{i}"))
            .build()?;

        let retriever = Retriever::new(
            catalog.clone(),
            pool.clone(),
            config.catalog.pool_size,
            config.retrieval.on_the_fly,
        );

        Ok(Self {
            catalog,
            pool,
            lookups,
            lookup_budget: Duration::from_millis(config.catalog.lookup_budget_ms),
            retriever,
            snapshot: SnapshotHandle::new(snapshot),
            retrieval: config.retrieval.clone(),
            rules: config.rules.clone(),
            data_dir: config.data_dir(),
        })
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load()
    }

    fn resolve_limit(&self, limit: Option<usize>, options: &RecommendOptions) -> Result<usize, RecommendError> {
        let limit = limit.or(options.limit).unwrap_or(self.retrieval.default_limit);
        if limit == 0 || limit > self.retrieval.max_limit {
            return Err(RecommendError::Validation(format!(
                "limit must be between 1 and {}",
                self.retrieval.max_limit
            )));
        }
        Ok(limit)
    }

    /// Candidates paired with catalog records. Failed or late lookups keep
    /// the stored id, name and image only.
    fn enrich(&self, candidates: Vec<Candidate>) -> Vec<(Product, f32)> {
        let missing: Vec<String> = candidates
            .iter()
            .filter(|c| c.product.is_none())
            .map(|c| c.product_id.clone())
            .collect();
        let mut found = catalog::lookup_many(&self.catalog, &self.lookups, &missing, self.lookup_budget);

        candidates
            .into_iter()
            .map(|mut c| {
                if c.product.is_none() {
                    c.product = found.remove(&c.product_id);
                }
                let similarity = c.similarity;
                (c.into_product(), similarity)
            })
            .collect()
    }

    /// Visually similar products to catalog product `id`.
    pub fn similar_by_product(
        &self,
        id: &str,
        limit: Option<usize>,
        options: &RecommendOptions,
    ) -> Result<Recommendations, RecommendError> {
        let limit = self.resolve_limit(limit, options)?;
        let settings = RuleSettings::resolve(&self.rules, options)?;

        let target = self.catalog.product(id)?;
        let snapshot = self.snapshot.load();
        let query = self.retriever.query_vector(&snapshot, &target)?;

        let exclude: HashSet<String> = [id.to_string(), target.id.clone()].into();
        let k = self.retrieval.candidate_k.max(limit);
        let candidates = self.retriever.retrieve(&snapshot, &query, k, &exclude)?;

        let rule_target = RuleTarget::from(&target);
        let admitted = |items: &[(Product, f32)]| {
            items
                .iter()
                .any(|(p, _)| rules::passes_category(&settings, Some(&rule_target), p))
        };
        let mut enriched = self.enrich(candidates);

        if !admitted(&enriched) && settings.same_category_only {
            log::info!("no top-{k} match for {id} in its category, searching the category");
            enriched = match self
                .retriever
                .retrieve_within(&snapshot, &query, &target.category, k, &exclude)
            {
                Ok(within) => self.enrich(within),
                Err(err) => {
                    log::warn!("category search for {id} failed: {err}");
                    vec![]
                }
            };
        }

        if !admitted(&enriched) && self.retrieval.category_fallback {
            log::warn!("no similar products for {id}, serving category fallback");
            let items = self.category_fallback(&target, &exclude, limit);
            return Ok(Recommendations {
                target: Some(target),
                items,
                method: Method::Fallback,
                mode: snapshot.mode(),
            });
        }

        let mut items = rules::apply(&settings, Some(&rule_target), enriched);
        items.truncate(limit);

        Ok(Recommendations {
            target: Some(target),
            items,
            method: Method::Visual,
            mode: snapshot.mode(),
        })
    }

    fn category_fallback(&self, target: &Product, exclude: &HashSet<String>, limit: usize) -> Vec<ScoredCandidate> {
        let members = match self.catalog.category_members(&target.category, limit + exclude.len()) {
            Ok(members) => members,
            Err(err) => {
                log::warn!("category fallback for {} failed: {err}", target.id);
                return vec![];
            }
        };

        members
            .into_iter()
            .filter(|p| !exclude.contains(&p.id))
            .take(limit)
            .enumerate()
            .map(|(rank, product)| ScoredCandidate {
                product,
                similarity: FALLBACK_SCORE,
                score: FALLBACK_SCORE,
                rank,
            })
            .collect()
    }

    /// Products resembling an uploaded image, an image URL or a text query.
    ///
    /// Rules that need a target only run when `reference` is given.
    pub fn similar_by_image(
        &self,
        query: VisualQuery,
        reference: Option<&RuleTarget>,
        limit: Option<usize>,
        options: &RecommendOptions,
    ) -> Result<Recommendations, RecommendError> {
        let limit = self.resolve_limit(limit, options)?;
        let settings = RuleSettings::resolve(&self.rules, options)?;

        let (vector, method) = match query {
            VisualQuery::Image(bytes) => {
                if bytes.is_empty() {
                    return Err(RecommendError::Validation("image is empty".into()));
                }
                (self.pool.encode_bytes(bytes)?, Method::Visual)
            }
            VisualQuery::ImageUrl(url) => (self.pool.encode_url(&url)?, Method::Visual),
            VisualQuery::Text(text) => {
                if text.trim().is_empty() {
                    return Err(RecommendError::Validation("text query is empty".into()));
                }
                (self.pool.encode_text(&text)?, Method::Text)
            }
        };

        let snapshot = self.snapshot.load();
        let candidates = self.retriever.retrieve(
            &snapshot,
            &vector,
            self.retrieval.candidate_k.max(limit),
            &HashSet::new(),
        )?;

        let mut items = rules::apply(&settings, reference, self.enrich(candidates));
        items.truncate(limit);

        Ok(Recommendations {
            target: None,
            items,
            method,
            mode: snapshot.mode(),
        })
    }

    /// Recommendations from a user's recently viewed products.
    ///
    /// No seeds gives an empty list. Unknown or failing seeds are skipped.
    pub fn personalized(
        &self,
        seeds: &[String],
        reference: Option<&RuleTarget>,
        limit: Option<usize>,
        options: &RecommendOptions,
    ) -> Result<Recommendations, RecommendError> {
        if seeds.len() > self.retrieval.max_seeds {
            return Err(RecommendError::Validation(format!(
                "at most {} seed items are allowed",
                self.retrieval.max_seeds
            )));
        }
        let limit = self.resolve_limit(limit, options)?;
        let settings = RuleSettings::resolve(&self.rules, options)?;

        let snapshot = self.snapshot.load();
        if seeds.is_empty() {
            return Ok(Recommendations {
                target: None,
                items: vec![],
                method: Method::Personalized,
                mode: snapshot.mode(),
            });
        }

        let merged = aggregator::personalize(
            &self.retriever,
            self.catalog.as_ref(),
            &snapshot,
            seeds,
            self.retrieval.candidate_k.max(limit),
        );

        let mut items = rules::apply(&settings, reference, self.enrich(merged));
        items.truncate(limit);

        Ok(Recommendations {
            target: None,
            items,
            method: Method::Personalized,
            mode: snapshot.mode(),
        })
    }

    /// [`similar_by_product`](Self::similar_by_product) for several ids.
    /// A failing id is reported in place and never fails the call.
    pub fn batch(
        &self,
        ids: &[String],
        limit: Option<usize>,
        options: &RecommendOptions,
    ) -> Result<BTreeMap<String, BatchItem>, RecommendError> {
        if ids.is_empty() || ids.len() > self.retrieval.max_batch {
            return Err(RecommendError::Validation(format!(
                "batch must contain between 1 and {} product ids",
                self.retrieval.max_batch
            )));
        }
        let limit = self.resolve_limit(limit, options)?;
        RuleSettings::resolve(&self.rules, options)?;

        let ids = aggregator::dedup_seeds(ids);
        let results: BTreeMap<String, BatchItem> = ids
            .par_iter()
            .map(|id| {
                let item = match self.similar_by_product(id, Some(limit), options) {
                    Ok(ok) => BatchItem::Ok { ok },
                    Err(err) => {
                        log::warn!("batch item {id} failed: {err}");
                        BatchItem::Failed {
                            error: err.to_string(),
                            kind: err.kind(),
                        }
                    }
                };
                (id.clone(), item)
            })
            .collect();

        Ok(results)
    }

    pub fn stats(&self) -> Stats {
        let snapshot = self.snapshot.load();
        Stats {
            mode: snapshot.mode(),
            store_size: snapshot.store_len(),
            index_size: snapshot.index_len(),
            loaded_at: snapshot.loaded_at(),
            cached_embeddings: self.pool.cache().len(),
            encoder_threads: self.pool.threads(),
            model_id: hex(&self.pool.encoder().model_id()),
        }
    }

    pub fn health(&self) -> Health {
        let snapshot = self.snapshot.load();
        Health {
            status: "ok",
            mode: snapshot.mode(),
            indexed_products: snapshot.index_len(),
        }
    }

    /// Re-read the artifacts from the data directory and swap them in.
    /// Requests already running finish on the snapshot they started with.
    ///
    /// Refused while a build holds the data directory lock, so a half
    /// written store/index pair is never loaded.
    pub fn reload(&self) -> Result<Stats, RecommendError> {
        let _lock = match FileLock::try_acquire(&self.data_dir) {
            Ok(lock) => Some(lock),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                log::warn!("reload refused: {err}");
                return Err(RecommendError::Busy(err.to_string()));
            }
            Err(err) => {
                log::debug!("reloading without the data directory lock: {err}");
                None
            }
        };

        let encoder = self.pool.encoder();
        let next = Snapshot::load_from_dir(&self.data_dir, &encoder.model_id(), encoder.dimensions());
        let previous = self.snapshot.swap(next);
        self.pool.cache().clear();

        let stats = self.stats();
        log::info!(
            "snapshot swapped: {} -> {} embeddings ({:?})",
            previous.store_len(),
            stats.store_size,
            stats.mode
        );
        Ok(stats)
    }
}
