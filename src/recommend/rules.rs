//! Business rules applied after retrieval.
//!
//! Category is the only hard filter. Price, gender, usage and brand nudge
//! the similarity score; the adjustments are summed, added to the base
//! score and the total is clamped to [0, 1] and rounded to four decimals.
//! Ordering is by that rounded score, ties keep the retrieval order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::catalog::{Category, Product};
use crate::config::RulesConfig;

use super::errors::RecommendError;

pub const PRICE_IN_RANGE_BONUS: f32 = 0.10;
pub const PRICE_OUT_OF_RANGE_PENALTY: f32 = -0.05;
pub const GENDER_MATCH_BONUS: f32 = 0.08;
pub const GENDER_UNISEX_BONUS: f32 = 0.05;
pub const GENDER_MISMATCH_PENALTY: f32 = -0.10;
pub const USAGE_MATCH_BONUS: f32 = 0.08;
pub const USAGE_CASUAL_BONUS: f32 = 0.03;
pub const USAGE_MISMATCH_PENALTY: f32 = -0.08;

/// Adjusted scores are kept to this many steps per unit (four decimals).
const SCORE_STEPS: f32 = 10_000.0;

const UNISEX: &str = "unisex";
const CASUAL: &str = "casual";

/// Per-request overrides. Unset fields fall back to the configured rules.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendOptions {
    pub min_similarity: Option<f32>,
    pub same_category_only: Option<bool>,
    pub price_tolerance: Option<f32>,
    pub filter_gender: Option<bool>,
    pub filter_usage: Option<bool>,
    pub brand_boost: Option<f32>,
    pub limit: Option<usize>,
}

/// Fully resolved rule settings for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSettings {
    pub min_similarity: f32,
    pub same_category_only: bool,
    pub price_tolerance: f32,
    pub filter_gender: bool,
    pub filter_usage: bool,
    pub brand_boost: f32,
}

impl RuleSettings {
    pub fn resolve(defaults: &RulesConfig, options: &RecommendOptions) -> Result<Self, RecommendError> {
        let settings = Self {
            min_similarity: options.min_similarity.unwrap_or(defaults.min_similarity),
            same_category_only: options
                .same_category_only
                .unwrap_or(defaults.same_category_only),
            price_tolerance: options.price_tolerance.unwrap_or(defaults.price_tolerance),
            filter_gender: options.filter_gender.unwrap_or(defaults.filter_gender),
            filter_usage: options.filter_usage.unwrap_or(defaults.filter_usage),
            brand_boost: options.brand_boost.unwrap_or(defaults.brand_boost),
        };

        if !(0.0..=1.0).contains(&settings.min_similarity) {
            return Err(RecommendError::Validation(
                "minSimilarity must be between 0 and 1".into(),
            ));
        }
        if !settings.price_tolerance.is_finite() || settings.price_tolerance < 0.0 {
            return Err(RecommendError::Validation(
                "priceTolerance must be a non-negative number".into(),
            ));
        }
        if !(0.0..=1.0).contains(&settings.brand_boost) {
            return Err(RecommendError::Validation(
                "brandBoost must be between 0 and 1".into(),
            ));
        }

        Ok(settings)
    }
}

/// The reference product's rule-relevant attributes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleTarget {
    #[serde(flatten)]
    pub category: Category,
    pub price: Option<f64>,
    pub gender: Option<String>,
    pub usage: Option<String>,
    pub brand: Option<String>,
}

impl From<&Product> for RuleTarget {
    fn from(product: &Product) -> Self {
        Self {
            category: product.category.clone(),
            price: product.price,
            gender: product.gender.clone(),
            usage: product.usage.clone(),
            brand: product.brand.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub product: Product,
    /// Raw inner-product similarity
    pub similarity: f32,
    /// Similarity after rule adjustments, in [0, 1]
    pub score: f32,
    /// Position before adjustment
    #[serde(skip)]
    pub rank: usize,
}

impl ScoredCandidate {
    /// Score in basis points; equal adjusted scores compare equal.
    fn score_key(&self) -> i32 {
        score_steps(self.score)
    }

    fn order(&self, other: &Self) -> Ordering {
        other
            .score_key()
            .cmp(&self.score_key())
            .then(self.rank.cmp(&other.rank))
    }
}

fn score_steps(score: f32) -> i32 {
    (score * SCORE_STEPS).round() as i32
}

/// `similarity + delta`, clamped to [0, 1] and rounded to four decimals.
fn adjusted_score(similarity: f32, delta: f32) -> f32 {
    score_steps((similarity + delta).clamp(0.0, 1.0)) as f32 / SCORE_STEPS
}

/// Hard category filter: candidates must match every populated target field.
pub fn passes_category(settings: &RuleSettings, target: Option<&RuleTarget>, product: &Product) -> bool {
    match target {
        Some(target) if settings.same_category_only => target.category.admits(&product.category),
        _ => true,
    }
}

/// Sum of the soft adjustments for `product` against `target`.
pub fn adjustment(settings: &RuleSettings, target: &RuleTarget, product: &Product) -> f32 {
    let mut delta = 0.0;

    if let (Some(target_price), Some(price)) = (target.price, product.price) {
        if target_price > 0.0 && price > 0.0 {
            let tolerance = settings.price_tolerance as f64;
            let low = target_price * (1.0 - tolerance);
            let high = target_price * (1.0 + tolerance);
            delta += if (low..=high).contains(&price) {
                PRICE_IN_RANGE_BONUS
            } else {
                PRICE_OUT_OF_RANGE_PENALTY
            };
        }
    }

    if settings.filter_gender {
        if let (Some(want), Some(got)) = (&target.gender, &product.gender) {
            delta += if want.eq_ignore_ascii_case(got) {
                GENDER_MATCH_BONUS
            } else if want.eq_ignore_ascii_case(UNISEX) || got.eq_ignore_ascii_case(UNISEX) {
                GENDER_UNISEX_BONUS
            } else {
                GENDER_MISMATCH_PENALTY
            };
        }
    }

    if settings.filter_usage {
        if let (Some(want), Some(got)) = (&target.usage, &product.usage) {
            delta += if want.eq_ignore_ascii_case(got) {
                USAGE_MATCH_BONUS
            } else if want.eq_ignore_ascii_case(CASUAL) || got.eq_ignore_ascii_case(CASUAL) {
                USAGE_CASUAL_BONUS
            } else {
                USAGE_MISMATCH_PENALTY
            };
        }
    }

    if settings.brand_boost > 0.0 {
        if let (Some(want), Some(got)) = (&target.brand, &product.brand) {
            if want.eq_ignore_ascii_case(got) {
                delta += settings.brand_boost;
            }
        }
    }

    delta
}

/// Filter, adjust and reorder `candidates` (given in retrieval order).
pub fn apply(
    settings: &RuleSettings,
    target: Option<&RuleTarget>,
    candidates: Vec<(Product, f32)>,
) -> Vec<ScoredCandidate> {
    let before = candidates.len();

    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .enumerate()
        .filter(|(_, (product, _))| passes_category(settings, target, product))
        .map(|(rank, (product, similarity))| {
            let delta = target
                .map(|target| adjustment(settings, target, &product))
                .unwrap_or(0.0);
            ScoredCandidate {
                score: adjusted_score(similarity, delta),
                product,
                similarity,
                rank,
            }
        })
        .filter(|c| c.score_key() >= score_steps(settings.min_similarity))
        .collect();

    scored.sort_by(ScoredCandidate::order);

    log::debug!("business rules: {before} -> {} candidates", scored.len());
    scored
}
