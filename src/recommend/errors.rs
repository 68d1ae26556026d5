use serde::Serialize;

use crate::catalog::CatalogError;
use crate::semantic::{EncodingError, IndexError};

#[derive(thiserror::Error, Debug)]
pub enum RecommendError {
    #[error("product {0} not found")]
    NotFound(String),

    #[error("product catalog unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("similarity index unavailable")]
    IndexUnavailable,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("data directory busy: {0}")]
    Busy(String),
}

/// Stable error kind names, used in batch failure markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    UpstreamUnavailable,
    EncodingFailure,
    IndexUnavailable,
    ValidationError,
    Internal,
}

impl RecommendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecommendError::NotFound(_) => ErrorKind::NotFound,
            RecommendError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            RecommendError::Encoding(_) => ErrorKind::EncodingFailure,
            RecommendError::IndexUnavailable => ErrorKind::IndexUnavailable,
            RecommendError::Validation(_) => ErrorKind::ValidationError,
            RecommendError::Index(_) | RecommendError::Busy(_) => ErrorKind::Internal,
        }
    }
}

impl From<CatalogError> for RecommendError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(id) => RecommendError::NotFound(id),
            CatalogError::Unavailable(reason) => RecommendError::UpstreamUnavailable(reason),
        }
    }
}
