//! Domain collectors feeding the enrichment pipeline

pub mod release_notes;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainAction {
    Added,
    Removed,
}

impl fmt::Display for DomainAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DomainAction::Added => write!(f, "added"),
            DomainAction::Removed => write!(f, "removed"),
        }
    }
}

/// A domain extracted from a release-notes signature cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedDomain {
    pub domain: String,
    pub action: DomainAction,
    /// Signature text the domain was taken from, e.g. `Backdoor.simda:gahyraw.com`
    pub raw: String,
}

/// Trait for domain sources
#[async_trait]
pub trait DomainCollector: Send + Sync {
    /// Collector name
    fn name(&self) -> &'static str;

    /// Extract every domain the source currently lists
    async fn collect(&self) -> Result<Vec<ParsedDomain>>;
}
