//! Domain lookups against AutoFocus and the domain document cache

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::{LookupSettings, Settings};
use crate::enrichment::assessor::assess;
use crate::enrichment::budget::{BudgetGovernor, Sleeper};
use crate::enrichment::tags::TagCache;
use crate::enrichment::{DomainQuery, SearchResults, SearchSubmission, ThreatIntelApi};
use crate::error::{EnrichError, Result};
use crate::models::domain_utils::normalize_domain;
use crate::models::{
    BucketState, DocKind, DomainDoc, DomainEnrichment, SampleRecord, StoredDocument,
};
use crate::storage::DocumentStore;

/// Runs a domain search: submit, poll by cookie, convert hits to samples
pub struct DomainSearch {
    api: Arc<dyn ThreatIntelApi>,
    governor: Arc<BudgetGovernor>,
    sleeper: Arc<dyn Sleeper>,
    tags: TagCache,
    settings: LookupSettings,
}

impl DomainSearch {
    pub fn new(
        api: Arc<dyn ThreatIntelApi>,
        governor: Arc<BudgetGovernor>,
        sleeper: Arc<dyn Sleeper>,
        tags: TagCache,
        settings: LookupSettings,
    ) -> Self {
        Self {
            api,
            governor,
            sleeper,
            tags,
            settings,
        }
    }

    /// Samples referencing `domain`, newest first.
    ///
    /// Whenever AutoFocus reports an exhausted point bucket (on submit, on a
    /// poll, or while fetching tag details) the budget governor decides how
    /// to continue and the refused step is retried exactly once.
    pub async fn search(&self, domain: &str) -> Result<Vec<SampleRecord>> {
        let query = DomainQuery::contains(domain, self.settings.page_size);

        debug!(domain, "Gathering domain info (10 API-points)");
        let cookie = match self.submit(domain, &query).await {
            Err(EnrichError::UpstreamRateLimited { message, bucket }) => {
                self.throttle(domain, &message, bucket).await?;
                debug!(domain, "Resubmitting domain query");
                self.submit(domain, &query).await?
            }
            other => other?,
        };

        debug!(domain, cookie = %cookie, "Cookie returned for domain query");

        let results = match self.poll(domain, &cookie).await? {
            Some(results) if results.total > 0 => results,
            _ => {
                info!(domain, "No samples found for domain in time allotted");
                return Ok(vec![]);
            }
        };

        // Tags fetched before the refusal are cached, so the retry only
        // spends points on the remainder
        match self.tags.build_samples(&results.hits).await {
            Err(EnrichError::UpstreamRateLimited { message, bucket }) => {
                self.throttle(domain, &message, bucket).await?;
                debug!(domain, "Rebuilding samples");
                self.tags.build_samples(&results.hits).await
            }
            other => other,
        }
    }

    async fn submit(&self, domain: &str, query: &DomainQuery) -> Result<String> {
        let submission = self.api.submit_search(query).await?;
        let exceeded = submission.is_bucket_exceeded();

        match submission {
            SearchSubmission::Accepted { cookie } => Ok(cookie),
            SearchSubmission::Rejected { message, bucket } if exceeded => {
                Err(EnrichError::UpstreamRateLimited { message, bucket })
            }
            SearchSubmission::Rejected { message, .. } => {
                error!(domain, message = %message, "Return from AutoFocus is in error");
                Err(EnrichError::Upstream(message))
            }
        }
    }

    /// Let the budget governor act on an exhausted bucket, probing for the
    /// bucket state when the refusal did not carry one
    async fn throttle(
        &self,
        domain: &str,
        message: &str,
        bucket: Option<BucketState>,
    ) -> Result<()> {
        warn!(
            domain,
            reply = message,
            "Exceeded AutoFocus point allotment, consulting budget governor"
        );

        let bucket = match bucket {
            Some(bucket) => bucket,
            None => self.governor.probe().await?,
        };
        let decision = self.governor.check_budget(&bucket).await?;

        debug!(domain, decision = decision.label(), "Budget governor returned");
        Ok(())
    }

    /// Poll at most `timeout_polls` times; the last poll is final even if
    /// the search has not reached the accepted completion percentage
    async fn poll(&self, domain: &str, cookie: &str) -> Result<Option<SearchResults>> {
        let accept_at = f64::from(self.settings.max_percentage);
        let context = self.governor.context();
        let mut latest = None;

        for attempt in 1..=self.settings.timeout_polls {
            context
                .sleep_or_cancel(self.sleeper.as_ref(), self.settings.poll_interval)
                .await?;

            let results = match self.fetch_results(domain, cookie).await {
                Err(EnrichError::UpstreamRateLimited { message, bucket }) => {
                    self.throttle(domain, &message, bucket).await?;
                    self.fetch_results(domain, cookie).await?
                }
                other => other?,
            };

            let complete = results.af_complete_percentage;
            latest = Some(results);

            if complete >= accept_at {
                break;
            }

            info!(domain, complete, attempt, "Search still running");
        }

        Ok(latest)
    }

    async fn fetch_results(&self, domain: &str, cookie: &str) -> Result<SearchResults> {
        debug!(domain, cookie, "Checking cookie (2 API-points)");
        let mut results = self.api.search_results(cookie).await?;

        match results.message.take() {
            None => Ok(results),
            Some(message) if message.contains("Bucket Exceeded") => {
                Err(EnrichError::UpstreamRateLimited {
                    message,
                    bucket: None,
                })
            }
            Some(message) => {
                error!(domain, message = %message, "Search results are in error");
                Err(EnrichError::Upstream(message))
            }
        }
    }
}

/// Domain enrichment entry point used by the CLI and the HTTP API
pub struct DomainEnricher {
    search: DomainSearch,
    store: Arc<dyn DocumentStore>,
    governor: Arc<BudgetGovernor>,
    settings: Settings,
}

impl DomainEnricher {
    pub fn new(
        api: Arc<dyn ThreatIntelApi>,
        store: Arc<dyn DocumentStore>,
        governor: Arc<BudgetGovernor>,
        sleeper: Arc<dyn Sleeper>,
        settings: Settings,
    ) -> Self {
        let tags = TagCache::new(api.clone(), store.clone(), settings.cache.tag_max_age);
        let search = DomainSearch::new(
            api,
            governor.clone(),
            sleeper,
            tags,
            settings.lookup.clone(),
        );

        Self {
            search,
            store,
            governor,
            settings,
        }
    }

    pub fn governor(&self) -> &Arc<BudgetGovernor> {
        &self.governor
    }

    /// Cached domain doc without touching AutoFocus
    pub async fn cached_doc(&self, domain: &str) -> Result<Option<DomainDoc>> {
        let name = normalize_domain(domain);

        let Some(doc) = self.store.get(DocKind::Domain, &name).await? else {
            return Ok(None);
        };

        serde_json::from_value(doc.body)
            .map(Some)
            .map_err(|e| EnrichError::Persistence(format!("invalid domain doc {}: {}", name, e)))
    }

    /// Domain doc from the cache, refreshed from AutoFocus when missing,
    /// stale or unreadable. `None` when the refresh failed.
    pub async fn get_domain_doc(&self, domain: &str) -> Option<DomainDoc> {
        let name = normalize_domain(domain);

        match self.load_or_refresh(&name).await {
            Ok(doc) => Some(doc),
            Err(e) => {
                error!(domain = %name, error = %e, "Unable to work with domain doc");
                metrics::counter!("domainforge_enrichment_failures_total").increment(1);
                None
            }
        }
    }

    async fn load_or_refresh(&self, name: &str) -> Result<DomainDoc> {
        let now = Utc::now();
        let time_limit = now - self.settings.cache.domain_max_age;

        debug!(domain = name, "Querying local cache for domain");

        let cached = match self.store.get(DocKind::Domain, name).await? {
            Some(doc) => match serde_json::from_value::<DomainDoc>(doc.body) {
                Ok(domain_doc) => Some(domain_doc),
                Err(e) => {
                    error!(domain = name, error = %e, "Cached domain doc is invalid");
                    None
                }
            },
            None => None,
        };

        let doc_created = match cached {
            Some(domain_doc) if domain_doc.doc_updated >= time_limit => {
                debug!(
                    domain = name,
                    doc_updated = %domain_doc.doc_updated,
                    "Domain doc is current, not updating cache"
                );
                metrics::counter!("domainforge_cache_lookups_total", "kind" => "domain", "result" => "hit")
                    .increment(1);
                return Ok(domain_doc);
            }
            Some(domain_doc) => {
                info!(
                    domain = name,
                    doc_updated = %domain_doc.doc_updated,
                    %time_limit,
                    "Updating domain doc"
                );
                metrics::counter!("domainforge_cache_lookups_total", "kind" => "domain", "result" => "stale")
                    .increment(1);
                domain_doc.doc_created
            }
            None => {
                info!(domain = name, "Creating domain doc");
                metrics::counter!("domainforge_cache_lookups_total", "kind" => "domain", "result" => "miss")
                    .increment(1);
                now
            }
        };

        let samples = self.search.search(name).await?;

        let domain_doc = DomainDoc {
            name: name.to_string(),
            samples,
            doc_created,
            doc_updated: now,
        };

        let body = serde_json::to_value(&domain_doc)
            .map_err(|e| EnrichError::Persistence(e.to_string()))?;

        self.store
            .save(&StoredDocument {
                kind: DocKind::Domain,
                id: name.to_string(),
                body,
                doc_created,
                doc_updated: now,
            })
            .await?;

        Ok(domain_doc)
    }

    /// Domain doc plus its assessed tag
    pub async fn enrich_domain(&self, domain: &str) -> Option<DomainEnrichment> {
        let doc = self.get_domain_doc(domain).await?;
        let assessed = assess(&doc.samples, &self.settings.confidence_levels, Utc::now());

        if assessed.is_low_priority() {
            metrics::counter!("domainforge_low_priority_domains_total").increment(1);
        }

        debug!(
            domain = %doc.name,
            tag = %assessed.tag_name,
            confidence = assessed.confidence_level,
            "Assessed domain"
        );

        Some(DomainEnrichment {
            domain: doc.name,
            sample_count: doc.samples.len(),
            doc_updated: doc.doc_updated,
            assessed,
        })
    }

    /// Enrich every domain, in waves sized by the rate-limit context.
    ///
    /// A failed domain yields `None` and never aborts the batch.
    pub async fn enrich_batch(&self, domains: &[String]) -> Vec<(String, Option<DomainEnrichment>)> {
        let mut results = Vec::with_capacity(domains.len());
        let mut index = 0;

        while index < domains.len() {
            let limit = self
                .governor
                .context()
                .concurrency_limit(self.settings.lookup.max_concurrency);
            let wave = &domains[index..(index + limit).min(domains.len())];

            let enriched =
                futures::future::join_all(wave.iter().map(|domain| self.enrich_domain(domain)))
                    .await;

            results.extend(wave.iter().cloned().zip(enriched));
            index += wave.len();
        }

        let failed = results.iter().filter(|(_, r)| r.is_none()).count();
        info!(total = results.len(), failed, "Batch enrichment complete");

        results
    }
}
