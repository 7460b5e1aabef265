//! Tag details cache and sample tag-list building

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::enrichment::{SearchHit, ThreatIntelApi};
use crate::error::{EnrichError, Result};
use crate::models::{
    af_time, placeholder_date, DocKind, SampleRecord, StoredDocument, TagDoc, TagGroup, TagRecord,
};
use crate::storage::DocumentStore;

/// Serves tag metadata from the local cache, refreshing it from AutoFocus
/// once it is older than the configured maximum age
pub struct TagCache {
    api: Arc<dyn ThreatIntelApi>,
    store: Arc<dyn DocumentStore>,
    max_age: chrono::Duration,
}

impl TagCache {
    pub fn new(
        api: Arc<dyn ThreatIntelApi>,
        store: Arc<dyn DocumentStore>,
        max_age: chrono::Duration,
    ) -> Self {
        Self {
            api,
            store,
            max_age,
        }
    }

    /// Tag details for `tag_name`.
    ///
    /// `Ok(None)` when AutoFocus answered with a message instead of data.
    /// Exhausted point buckets are reported as `UpstreamRateLimited`.
    pub async fn process_tag(&self, tag_name: &str) -> Result<Option<TagRecord>> {
        let now = Utc::now();
        let time_limit = now - self.max_age;

        debug!(tag = tag_name, "Querying local cache for tag");

        let cached = match self.store.get(DocKind::Tag, tag_name).await? {
            Some(doc) => match serde_json::from_value::<TagDoc>(doc.body) {
                Ok(tag_doc) => Some(tag_doc),
                Err(e) => {
                    warn!(tag = tag_name, error = %e, "Cached tag doc is invalid, recreating");
                    None
                }
            },
            None => {
                info!(tag = tag_name, "No local cache found for tag - creating");
                None
            }
        };

        let doc_created = match cached {
            Some(tag_doc) if tag_doc.doc_updated >= time_limit => {
                metrics::counter!("domainforge_cache_lookups_total", "kind" => "tag", "result" => "hit")
                    .increment(1);
                return Ok(Some(tag_doc.to_record()));
            }
            Some(tag_doc) => {
                debug!(
                    tag = tag_name,
                    doc_updated = %tag_doc.doc_updated,
                    %time_limit,
                    "Tag doc is stale, updating cache"
                );
                metrics::counter!("domainforge_cache_lookups_total", "kind" => "tag", "result" => "stale")
                    .increment(1);
                tag_doc.doc_created
            }
            None => {
                metrics::counter!("domainforge_cache_lookups_total", "kind" => "tag", "result" => "miss")
                    .increment(1);
                now
            }
        };

        let response = self.api.tag_info(tag_name).await?;

        if let Some(message) = response.message {
            if message.contains("Bucket Exceeded") {
                return Err(EnrichError::UpstreamRateLimited {
                    message,
                    bucket: response.bucket_info,
                });
            }
            warn!(tag = tag_name, message = %message, "AutoFocus returned no tag details");
            return Ok(None);
        }

        let tag = response.tag.ok_or_else(|| {
            EnrichError::Upstream(format!("tag response for {} has no tag details", tag_name))
        })?;

        let tag_groups = if response.tag_groups.is_empty() {
            debug!(tag = tag_name, "No tag group found, setting to undefined");
            vec![TagGroup::undefined()]
        } else {
            response.tag_groups
        };

        let tag_doc = TagDoc {
            name: tag_name.to_string(),
            tag,
            tag_groups,
            doc_created,
            doc_updated: now,
        };

        let body =
            serde_json::to_value(&tag_doc).map_err(|e| EnrichError::Persistence(e.to_string()))?;

        self.store
            .save(&StoredDocument {
                kind: DocKind::Tag,
                id: tag_name.to_string(),
                body,
                doc_created,
                doc_updated: now,
            })
            .await?;

        Ok(Some(tag_doc.to_record()))
    }

    /// Tag details for every tag a sample carries, in the sample's order.
    ///
    /// A tag that cannot be fetched or cached is skipped; only an exhausted
    /// point bucket aborts the list.
    pub async fn build_tag_list(&self, tag_names: &[String]) -> Result<Vec<TagRecord>> {
        let mut tags = Vec::with_capacity(tag_names.len());

        for tag_name in tag_names {
            debug!(tag = %tag_name, "Processing tag");
            match self.process_tag(tag_name).await {
                Ok(Some(record)) => tags.push(record),
                Ok(None) => debug!(tag = %tag_name, "Skipping tag without details"),
                Err(e) if e.is_rate_limited() => return Err(e),
                Err(e) => {
                    warn!(tag = %tag_name, error = %e, "Unable to process tag, skipping");
                    metrics::counter!("domainforge_tag_failures_total").increment(1);
                }
            }
        }

        Ok(tags)
    }

    /// Convert search hits into sample records
    pub async fn build_samples(&self, hits: &[SearchHit]) -> Result<Vec<SampleRecord>> {
        let mut samples = Vec::with_capacity(hits.len());

        for hit in hits {
            let source = &hit.source;

            let sample_date = source
                .finish_date
                .as_deref()
                .and_then(af_time::parse)
                .unwrap_or_else(|| {
                    warn!(finish_date = ?source.finish_date, "Sample has no usable finish date");
                    placeholder_date()
                });

            samples.push(SampleRecord {
                sample_date,
                file_type: source.filetype.clone().unwrap_or_else(|| "NA".to_string()),
                tags: self.build_tag_list(&source.tag).await?,
            });
        }

        Ok(samples)
    }
}
