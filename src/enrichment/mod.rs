//! AutoFocus enrichment: tag assessment, point budget and domain lookups

pub mod assessor;
pub mod autofocus;
pub mod budget;
pub mod domain;
pub mod tags;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::models::{BucketState, TagGroup, TagInfo};

/// Response of the tag endpoint; `message` replaces the data on errors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagResponse {
    #[serde(default)]
    pub tag: Option<TagInfo>,
    #[serde(default, deserialize_with = "groups_or_empty")]
    pub tag_groups: Vec<TagGroup>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub bucket_info: Option<BucketState>,
}

/// AutoFocus sends `""` instead of an empty list for ungrouped tags
fn groups_or_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<TagGroup>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    match raw {
        Value::Array(_) => serde_json::from_value(raw).map_err(serde::de::Error::custom),
        _ => Ok(vec![]),
    }
}

/// Domain search body, minus the API key
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DomainQuery {
    pub query: Value,
    pub size: u32,
    pub from: u32,
    pub sort: Value,
    pub scope: String,
    #[serde(rename = "artifactSource")]
    pub artifact_source: String,
}

impl DomainQuery {
    /// Newest-first global search for samples whose domain alias contains `domain`
    pub fn contains(domain: &str, size: u32) -> Self {
        Self {
            query: json!({
                "operator": "all",
                "children": [{
                    "field": "alias.domain",
                    "operator": "contains",
                    "value": domain,
                }],
            }),
            size,
            from: 0,
            sort: json!({ "create_date": { "order": "desc" } }),
            scope: "global".to_string(),
            artifact_source: "af".to_string(),
        }
    }
}

/// Outcome of submitting a search
#[derive(Debug, Clone, PartialEq)]
pub enum SearchSubmission {
    /// The search is running; poll results with the cookie
    Accepted { cookie: String },
    Rejected {
        message: String,
        bucket: Option<BucketState>,
    },
}

impl SearchSubmission {
    /// True for "Daily Bucket Exceeded" and "Minute Bucket Exceeded" rejections
    pub fn is_bucket_exceeded(&self) -> bool {
        matches!(self, Self::Rejected { message, .. } if message.contains("Bucket Exceeded"))
    }
}

/// One poll of a running search
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub af_complete_percentage: f64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub hits: Vec<SearchHit>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_source")]
    pub source: HitSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitSource {
    #[serde(default)]
    pub finish_date: Option<String>,
    #[serde(default)]
    pub filetype: Option<String>,
    #[serde(default)]
    pub tag: Vec<String>,
}

/// Threat-intel endpoints the enrichment pipeline depends on
#[async_trait]
pub trait ThreatIntelApi: Send + Sync {
    /// Tag metadata (2 API points)
    async fn tag_info(&self, tag_name: &str) -> Result<TagResponse>;

    /// Start a domain search (10 API points)
    async fn submit_search(&self, query: &DomainQuery) -> Result<SearchSubmission>;

    /// Poll a running search (2 API points)
    async fn search_results(&self, cookie: &str) -> Result<SearchResults>;
}
