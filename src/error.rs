//! Error taxonomy for enrichment, storage and release-notes parsing

use thiserror::Error;

use crate::models::{BucketState, DocKind};

/// Result alias used across the enrichment pipeline
pub type Result<T> = std::result::Result<T, EnrichError>;

#[derive(Error, Debug)]
pub enum EnrichError {
    /// Document is not present in the local cache
    #[error("{kind} document not found: {id}")]
    NotFound { kind: DocKind, id: String },

    /// AutoFocus refused the request because a point bucket is exhausted
    #[error("AutoFocus rate limited: {message}")]
    UpstreamRateLimited {
        message: String,
        bucket: Option<BucketState>,
    },

    /// Malformed or unexpected response, or the request never completed
    #[error("AutoFocus error: {0}")]
    Upstream(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The release notes no longer have the structure we extract from
    #[error("release notes format changed: {0}")]
    ParseFormatChange(String),

    #[error("budget suspension cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnrichError {
    /// Returns true if waiting on the point budget may let the request succeed
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::UpstreamRateLimited { .. })
    }
}

impl From<reqwest::Error> for EnrichError {
    fn from(e: reqwest::Error) -> Self {
        Self::Upstream(e.to_string())
    }
}

impl From<sqlx::Error> for EnrichError {
    fn from(e: sqlx::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
