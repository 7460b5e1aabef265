//! AutoFocus REST client

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::enrichment::budget::BudgetProbe;
use crate::enrichment::{DomainQuery, SearchResults, SearchSubmission, TagResponse, ThreatIntelApi};
use crate::error::{EnrichError, Result};
use crate::models::BucketState;

pub const DEFAULT_SEARCH_URL: &str = "https://autofocus.paloaltonetworks.com/api/v1.0/samples/search/";
pub const DEFAULT_RESULTS_URL: &str = "https://autofocus.paloaltonetworks.com/api/v1.0/samples/results/";
pub const DEFAULT_TAG_URL: &str = "https://autofocus.paloaltonetworks.com/api/v1.0/tag/";

/// Public tag queried only for the `bucket_info` it comes back with
const PROBE_TAG: &str = "WildFireTest";

#[derive(Debug, Clone)]
pub struct AutoFocusConfig {
    pub api_key: String,
    pub search_url: Url,
    /// Prefix the search cookie is appended to
    pub results_url: Url,
    /// Prefix the tag name is appended to
    pub tag_url: Url,
    pub requests_per_minute: u32,
    pub timeout: Duration,
}

impl AutoFocusConfig {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api_key: api_key.into(),
            search_url: parse_url(DEFAULT_SEARCH_URL)?,
            results_url: parse_url(DEFAULT_RESULTS_URL)?,
            tag_url: parse_url(DEFAULT_TAG_URL)?,
            requests_per_minute: 60,
            timeout: Duration::from_secs(30),
        })
    }
}

/// Parse an endpoint URL, making sure it can be used as a join base
pub fn parse_url(raw: &str) -> Result<Url> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };

    Url::parse(&with_slash).map_err(|e| EnrichError::Config(format!("invalid URL {}: {}", raw, e)))
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    af_cookie: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    bucket_info: Option<BucketState>,
}

pub struct AutoFocusClient {
    http: Client,
    config: AutoFocusConfig,
    rate_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl AutoFocusClient {
    pub fn new(config: AutoFocusConfig) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;

        let quota = Quota::per_minute(
            NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN),
        );

        Ok(Self {
            http,
            config,
            rate_limiter: RateLimiter::direct(quota),
        })
    }

    fn endpoint(base: &Url, segment: &str) -> Result<Url> {
        base.join(segment)
            .map_err(|e| EnrichError::Upstream(format!("cannot build URL for {}: {}", segment, e)))
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &'static str, url: Url, mut body: Value) -> Result<T> {
        body["apiKey"] = Value::String(self.config.api_key.clone());

        self.rate_limiter.until_ready().await;
        metrics::counter!("domainforge_autofocus_requests_total", "endpoint" => endpoint).increment(1);

        debug!(endpoint, url = %url, "AutoFocus request");

        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        // Refusals carry a JSON message with a non-2xx status, so the body
        // is decoded regardless of the status code
        serde_json::from_str(&text).map_err(|e| {
            warn!(endpoint, %status, error = %e, "Unreadable AutoFocus response");
            EnrichError::Upstream(format!("{} returned {}: {}", endpoint, status, e))
        })
    }
}

#[async_trait]
impl ThreatIntelApi for AutoFocusClient {
    async fn tag_info(&self, tag_name: &str) -> Result<TagResponse> {
        let url = Self::endpoint(&self.config.tag_url, tag_name)?;
        self.post("tag", url, json!({})).await
    }

    async fn submit_search(&self, query: &DomainQuery) -> Result<SearchSubmission> {
        let body = serde_json::to_value(query).map_err(|e| EnrichError::Upstream(e.to_string()))?;
        let response: SearchResponse = self.post("search", self.config.search_url.clone(), body).await?;

        match (response.af_cookie, response.message) {
            (Some(cookie), _) => Ok(SearchSubmission::Accepted { cookie }),
            (None, Some(message)) => Ok(SearchSubmission::Rejected {
                message,
                bucket: response.bucket_info,
            }),
            (None, None) => Err(EnrichError::Upstream(
                "search response has neither a cookie nor a message".to_string(),
            )),
        }
    }

    async fn search_results(&self, cookie: &str) -> Result<SearchResults> {
        let url = Self::endpoint(&self.config.results_url, cookie)?;
        self.post("results", url, json!({})).await
    }
}

#[async_trait]
impl BudgetProbe for AutoFocusClient {
    async fn probe(&self) -> Result<BucketState> {
        let response = self.tag_info(PROBE_TAG).await?;

        response.bucket_info.ok_or_else(|| {
            EnrichError::Upstream(format!(
                "probe returned no bucket_info: {}",
                response.message.unwrap_or_default()
            ))
        })
    }
}
