//! Scripted AutoFocus stand-in shared by the enrichment tests

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::enrichment::budget::BudgetProbe;
use crate::enrichment::{
    DomainQuery, HitSource, SearchHit, SearchResults, SearchSubmission, TagResponse,
    ThreatIntelApi,
};
use crate::error::{EnrichError, Result};
use crate::models::{BucketState, TagClass, TagGroup, TagInfo};

#[derive(Default)]
pub(crate) struct FakeApi {
    tags: Mutex<HashMap<String, TagResponse>>,
    queued_tags: Mutex<HashMap<String, VecDeque<TagResponse>>>,
    submissions: Mutex<VecDeque<Result<SearchSubmission>>>,
    polls: Mutex<VecDeque<Result<SearchResults>>>,
    pub(crate) queries: Mutex<Vec<DomainQuery>>,
    pub(crate) tag_calls: Mutex<Vec<String>>,
    pub(crate) poll_calls: Mutex<usize>,
}

impl FakeApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_tag(self, name: &str, class: TagClass) -> Self {
        self.tags.lock().unwrap().insert(name.to_string(), tag_response(name, class));
        self
    }

    pub(crate) fn with_tag_response(self, name: &str, response: TagResponse) -> Self {
        self.tags.lock().unwrap().insert(name.to_string(), response);
        self
    }

    /// Answer the next lookup of `name` with `response`, ahead of `with_tag`
    pub(crate) fn push_tag_response(&self, name: &str, response: TagResponse) {
        self.queued_tags
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(response);
    }

    pub(crate) fn push_submission(&self, submission: Result<SearchSubmission>) {
        self.submissions.lock().unwrap().push_back(submission);
    }

    pub(crate) fn push_poll(&self, results: Result<SearchResults>) {
        self.polls.lock().unwrap().push_back(results);
    }

    /// Queue an accepted search followed by one complete poll
    pub(crate) fn script_search(&self, hits: Vec<SearchHit>) {
        self.push_submission(Ok(SearchSubmission::Accepted {
            cookie: "cookie-1".to_string(),
        }));
        self.push_poll(Ok(results(100.0, hits)));
    }

    pub(crate) fn submit_calls(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub(crate) fn poll_count(&self) -> usize {
        *self.poll_calls.lock().unwrap()
    }

    pub(crate) fn tag_call_count(&self) -> usize {
        self.tag_calls.lock().unwrap().len()
    }
}

pub(crate) fn tag_response(name: &str, class: TagClass) -> TagResponse {
    TagResponse {
        tag: Some(TagInfo {
            tag_name: name.to_string(),
            public_tag_name: format!("Unit42.{}", name),
            tag_class: class,
            description: Some(format!("{} description", name)),
        }),
        tag_groups: vec![TagGroup {
            tag_group_name: format!("{} group", name),
            description: None,
        }],
        message: None,
        bucket_info: Some(probe_bucket(100_000)),
    }
}

pub(crate) fn probe_bucket(daily_remaining: i64) -> BucketState {
    let mut bucket = BucketState::empty(Utc::now());
    bucket.minute_points = 200;
    bucket.minute_points_remaining = 200;
    bucket.daily_points = 100_000;
    bucket.daily_points_remaining = daily_remaining;
    bucket
}

pub(crate) fn bucket_exceeded_tag(daily_remaining: i64) -> TagResponse {
    TagResponse {
        message: Some("Minute Bucket Exceeded".to_string()),
        bucket_info: Some(probe_bucket(daily_remaining)),
        ..TagResponse::default()
    }
}

pub(crate) fn bucket_exceeded_poll() -> SearchResults {
    SearchResults {
        message: Some("Minute Bucket Exceeded".to_string()),
        ..SearchResults::default()
    }
}

pub(crate) fn results(percentage: f64, hits: Vec<SearchHit>) -> SearchResults {
    SearchResults {
        af_complete_percentage: percentage,
        total: hits.len() as u64,
        hits,
        message: None,
    }
}

pub(crate) fn hit(finish_date: &str, tags: &[&str]) -> SearchHit {
    SearchHit {
        source: HitSource {
            finish_date: Some(finish_date.to_string()),
            filetype: Some("PE".to_string()),
            tag: tags.iter().map(|t| t.to_string()).collect(),
        },
    }
}

#[async_trait]
impl ThreatIntelApi for FakeApi {
    async fn tag_info(&self, tag_name: &str) -> Result<TagResponse> {
        self.tag_calls.lock().unwrap().push(tag_name.to_string());
        let queued = self
            .queued_tags
            .lock()
            .unwrap()
            .get_mut(tag_name)
            .and_then(VecDeque::pop_front);
        if let Some(response) = queued {
            return Ok(response);
        }
        Ok(self
            .tags
            .lock()
            .unwrap()
            .get(tag_name)
            .cloned()
            .unwrap_or_else(|| TagResponse {
                message: Some("Tag not found".to_string()),
                ..TagResponse::default()
            }))
    }

    async fn submit_search(&self, query: &DomainQuery) -> Result<SearchSubmission> {
        self.queries.lock().unwrap().push(query.clone());
        self.submissions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(EnrichError::Upstream("no scripted submission".into())))
    }

    async fn search_results(&self, _cookie: &str) -> Result<SearchResults> {
        *self.poll_calls.lock().unwrap() += 1;
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(EnrichError::Upstream("no scripted poll".into())))
    }
}

#[async_trait]
impl BudgetProbe for FakeApi {
    async fn probe(&self) -> Result<BucketState> {
        Ok(probe_bucket(100_000))
    }
}
