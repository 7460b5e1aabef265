//! AutoFocus point budget governor
//!
//! AutoFocus charges points per request out of a minute bucket and a daily
//! bucket. When a request is refused for lack of points the governor decides
//! whether to wait out the minute, slow the pipeline down, or suspend all
//! queries until the daily bucket has been replenished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BudgetSettings;
use crate::error::{EnrichError, Result};
use crate::models::{BucketState, DocKind, StoredDocument};
use crate::storage::DocumentStore;

/// Document id of the persisted bucket state
pub const AF_DETAILS_ID: &str = "af-details";

/// What the caller should do after a bucket was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    /// Slow mode was switched on
    Slow,
    /// Queries were suspended for the given time and may resume now
    Suspend(Duration),
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Proceed => "proceed",
            Decision::Slow => "slow",
            Decision::Suspend(_) => "suspend",
        }
    }
}

/// Pluggable sleep so back-off loops can be driven without real timers
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Cheap query that reports the current bucket state
#[async_trait]
pub trait BudgetProbe: Send + Sync {
    async fn probe(&self) -> Result<BucketState>;
}

/// Rate-limit state shared by every enrichment caller
pub struct RateLimitContext {
    slow_mode: AtomicBool,
    cancel: watch::Sender<bool>,
}

impl RateLimitContext {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            slow_mode: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn is_slow_mode(&self) -> bool {
        self.slow_mode.load(Ordering::Acquire)
    }

    /// Single switch, last writer wins
    pub fn set_slow_mode(&self, slow: bool) {
        self.slow_mode.store(slow, Ordering::Release);
    }

    /// Number of enrichments callers may keep in flight
    pub fn concurrency_limit(&self, max: usize) -> usize {
        if self.is_slow_mode() { 1 } else { max.max(1) }
    }

    /// Abort any suspension in progress and every later one
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Sleep for `duration` unless cancelled first
    pub async fn sleep_or_cancel(&self, sleeper: &dyn Sleeper, duration: Duration) -> Result<()> {
        if self.is_cancelled() {
            return Err(EnrichError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(EnrichError::Cancelled),
            _ = sleeper.sleep(duration) => Ok(()),
        }
    }

    async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let closed = rx.wait_for(|cancelled| *cancelled).await.map(|_| ()).is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for RateLimitContext {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BudgetGovernor {
    settings: BudgetSettings,
    context: Arc<RateLimitContext>,
    probe: Arc<dyn BudgetProbe>,
    sleeper: Arc<dyn Sleeper>,
    store: Arc<dyn DocumentStore>,
}

impl BudgetGovernor {
    pub fn new(
        settings: BudgetSettings,
        context: Arc<RateLimitContext>,
        probe: Arc<dyn BudgetProbe>,
        sleeper: Arc<dyn Sleeper>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            settings,
            context,
            probe,
            sleeper,
            store,
        }
    }

    pub fn context(&self) -> &Arc<RateLimitContext> {
        &self.context
    }

    /// Decide how to continue after AutoFocus refused a request.
    ///
    /// Suspends (sleeping and re-probing, with no attempt limit) while the
    /// daily balance is at or below the no-exec threshold. Otherwise switches
    /// slow mode on below the low-water mark, or waits out the minute bucket
    /// and switches slow mode off.
    pub async fn check_budget(&self, bucket: &BucketState) -> Result<Decision> {
        let remaining = bucket.daily_points_remaining;

        debug!(
            no_exec_points = self.settings.no_exec_points,
            low_points = self.settings.low_points,
            check_secs = self.settings.no_exec_check_interval.as_secs(),
            remaining,
            "Checking AutoFocus point budget"
        );

        let decision = if remaining <= self.settings.no_exec_points {
            self.suspend(remaining).await?
        } else if remaining < self.settings.low_points {
            info!(remaining, "Slowing down execution because daily point total is low");
            self.context.set_slow_mode(true);
            Decision::Slow
        } else {
            debug!(
                remaining,
                wait_secs = self.settings.minute_reset_wait.as_secs(),
                "Minute bucket exhausted, waiting for reset"
            );
            self.sleep_or_cancel(self.settings.minute_reset_wait).await?;
            self.context.set_slow_mode(false);
            Decision::Proceed
        };

        metrics::counter!("domainforge_budget_decisions_total", "decision" => decision.label())
            .increment(1);

        Ok(decision)
    }

    async fn suspend(&self, mut remaining: i64) -> Result<Decision> {
        let started = Instant::now();
        let interval = self.settings.no_exec_check_interval;
        let mut slept = Duration::ZERO;

        loop {
            info!(
                remaining,
                sleep_secs = interval.as_secs(),
                "Suspending AutoFocus queries because daily point total is too low"
            );
            self.sleep_or_cancel(interval).await?;
            slept += interval;

            match self.probe.probe().await {
                Ok(bucket) => {
                    record_bucket(&bucket);
                    remaining = bucket.daily_points_remaining;
                    if remaining > self.settings.no_exec_points {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Budget probe failed while suspended");
                }
            }
        }

        info!(
            remaining,
            elapsed = ?started.elapsed(),
            "Daily points replenished, resuming AutoFocus queries"
        );

        Ok(Decision::Suspend(slept))
    }

    async fn sleep_or_cancel(&self, duration: Duration) -> Result<()> {
        self.context
            .sleep_or_cancel(self.sleeper.as_ref(), duration)
            .await
    }

    /// Current bucket state straight from AutoFocus
    pub async fn probe(&self) -> Result<BucketState> {
        let bucket = self.probe.probe().await?;
        record_bucket(&bucket);
        Ok(bucket)
    }

    /// Probe the budget and persist it as the af-details document
    pub async fn update_stats(&self) -> Result<BucketState> {
        let now = Utc::now();

        let doc_created = match self.store.get(DocKind::AfDetails, AF_DETAILS_ID).await? {
            Some(doc) => doc.doc_created,
            None => {
                info!("The af-details doc is not found - creating");
                now
            }
        };

        debug!("Query to update AF points totals (2 API-points)");
        let bucket = self.probe.probe().await?;

        if !bucket.is_consistent() {
            warn!(?bucket, "AutoFocus reported more remaining points than allowed");
        }
        record_bucket(&bucket);

        let body = serde_json::to_value(&bucket)
            .map_err(|e| EnrichError::Persistence(e.to_string()))?;

        self.store
            .save(&StoredDocument {
                kind: DocKind::AfDetails,
                id: AF_DETAILS_ID.to_string(),
                body,
                doc_created,
                doc_updated: now,
            })
            .await?;

        debug!(remaining = bucket.daily_points_remaining, "Updated af-details");

        Ok(bucket)
    }

    /// Last bucket state persisted by `update_stats`
    pub async fn stored_stats(&self) -> Result<Option<BucketState>> {
        let Some(doc) = self.store.get(DocKind::AfDetails, AF_DETAILS_ID).await? else {
            return Ok(None);
        };

        serde_json::from_value(doc.body)
            .map(Some)
            .map_err(|e| EnrichError::Persistence(format!("invalid af-details document: {}", e)))
    }
}

fn record_bucket(bucket: &BucketState) {
    metrics::gauge!("domainforge_daily_points_remaining").set(bucket.daily_points_remaining as f64);
    metrics::gauge!("domainforge_minute_points_remaining")
        .set(bucket.minute_points_remaining as f64);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) fn bucket(daily_remaining: i64) -> BucketState {
        let mut bucket = BucketState::empty(Utc::now());
        bucket.minute_points = 200;
        bucket.minute_points_remaining = 0;
        bucket.daily_points = 100_000;
        bucket.daily_points_remaining = daily_remaining;
        bucket
    }

    /// Returns queued probe results in order, then repeats the last good one
    #[derive(Default)]
    pub(crate) struct ScriptedProbe {
        results: Mutex<VecDeque<Result<BucketState>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedProbe {
        pub(crate) fn new(results: Vec<Result<BucketState>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl BudgetProbe for ScriptedProbe {
        async fn probe(&self) -> Result<BucketState> {
            *self.calls.lock().unwrap() += 1;
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(bucket(100_000)))
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub(crate) fn slept(&self) -> Vec<Duration> {
            self.slept.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    struct NeverWakes;

    #[async_trait]
    impl Sleeper for NeverWakes {
        async fn sleep(&self, _duration: Duration) {
            std::future::pending::<()>().await;
        }
    }

    fn settings() -> BudgetSettings {
        BudgetSettings {
            no_exec_points: 100,
            low_points: 1000,
            no_exec_check_interval: Duration::from_secs(300),
            minute_reset_wait: Duration::from_secs(60),
        }
    }

    fn governor(
        probe: Arc<ScriptedProbe>,
        sleeper: Arc<dyn Sleeper>,
        store: Arc<MemoryStore>,
    ) -> BudgetGovernor {
        BudgetGovernor::new(
            settings(),
            Arc::new(RateLimitContext::new()),
            probe,
            sleeper,
            store,
        )
    }

    #[tokio::test]
    async fn test_suspends_until_probe_exceeds_threshold() {
        let probe = Arc::new(ScriptedProbe::new(vec![
            Ok(bucket(0)),
            Ok(bucket(100)),
            Ok(bucket(101)),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let gov = governor(probe.clone(), sleeper.clone(), Arc::new(MemoryStore::new()));

        let decision = gov.check_budget(&bucket(0)).await.unwrap();

        assert_eq!(decision, Decision::Suspend(Duration::from_secs(900)));
        assert_eq!(probe.calls(), 3);
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(300); 3]);
    }

    #[tokio::test]
    async fn test_suspend_survives_probe_failures() {
        let probe = Arc::new(ScriptedProbe::new(vec![
            Err(EnrichError::Upstream("connection reset".into())),
            Ok(bucket(5000)),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let gov = governor(probe.clone(), sleeper, Arc::new(MemoryStore::new()));

        let decision = gov.check_budget(&bucket(100)).await.unwrap();

        assert!(matches!(decision, Decision::Suspend(_)));
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_low_points_sets_slow_mode() {
        let probe = Arc::new(ScriptedProbe::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let gov = governor(probe.clone(), sleeper.clone(), Arc::new(MemoryStore::new()));

        let decision = gov.check_budget(&bucket(999)).await.unwrap();

        assert_eq!(decision, Decision::Slow);
        assert!(gov.context().is_slow_mode());
        assert_eq!(gov.context().concurrency_limit(8), 1);
        assert!(sleeper.slept().is_empty());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_minute_exhaustion_waits_and_clears_slow_mode() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let gov = governor(
            Arc::new(ScriptedProbe::default()),
            sleeper.clone(),
            Arc::new(MemoryStore::new()),
        );
        gov.context().set_slow_mode(true);

        let decision = gov.check_budget(&bucket(50_000)).await.unwrap();

        assert_eq!(decision, Decision::Proceed);
        assert!(!gov.context().is_slow_mode());
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(60)]);
    }

    #[tokio::test]
    async fn test_repeated_checks_are_stable() {
        let gov = governor(
            Arc::new(ScriptedProbe::default()),
            Arc::new(RecordingSleeper::default()),
            Arc::new(MemoryStore::new()),
        );

        for _ in 0..3 {
            assert_eq!(gov.check_budget(&bucket(500)).await.unwrap(), Decision::Slow);
            assert!(gov.context().is_slow_mode());
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_suspend() {
        let probe = Arc::new(ScriptedProbe::default());
        let gov = governor(
            probe.clone(),
            Arc::new(RecordingSleeper::default()),
            Arc::new(MemoryStore::new()),
        );
        gov.context().cancel();

        let err = gov.check_budget(&bucket(0)).await.unwrap_err();
        assert!(matches!(err, EnrichError::Cancelled));
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let gov = Arc::new(governor(
            Arc::new(ScriptedProbe::default()),
            Arc::new(NeverWakes),
            Arc::new(MemoryStore::new()),
        ));

        let task = {
            let gov = gov.clone();
            tokio::spawn(async move { gov.check_budget(&bucket(0)).await })
        };
        tokio::task::yield_now().await;
        gov.context().cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(EnrichError::Cancelled)));
    }

    #[tokio::test]
    async fn test_update_stats_creates_then_updates() {
        let store = Arc::new(MemoryStore::new());
        let probe = Arc::new(ScriptedProbe::new(vec![Ok(bucket(4000)), Ok(bucket(3990))]));
        let gov = governor(probe, Arc::new(RecordingSleeper::default()), store.clone());

        assert!(gov.stored_stats().await.unwrap().is_none());

        gov.update_stats().await.unwrap();
        let created = store
            .get(DocKind::AfDetails, AF_DETAILS_ID)
            .await
            .unwrap()
            .unwrap()
            .doc_created;

        gov.update_stats().await.unwrap();
        let doc = store.get(DocKind::AfDetails, AF_DETAILS_ID).await.unwrap().unwrap();

        assert_eq!(doc.doc_created, created);
        assert_eq!(
            gov.stored_stats().await.unwrap().unwrap().daily_points_remaining,
            3990
        );
    }
}
