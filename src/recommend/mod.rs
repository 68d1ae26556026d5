//! Query-time recommendation pipeline: retrieve, aggregate, apply rules.

mod aggregator;
mod errors;
mod retriever;
pub mod rules;
mod service;

pub use errors::{ErrorKind, RecommendError};
pub use rules::{RecommendOptions, RuleTarget, ScoredCandidate};
pub use service::{
    BatchItem, Health, Method, RecommendationService, Recommendations, Stats, VisualQuery,
    FALLBACK_SCORE,
};
