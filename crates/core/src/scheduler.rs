use crate::config::Settings;
use crate::domain::metrics::QuoteMetrics;
use crate::domain::recommendation::{get_recommendations_list, RecommendationItem};
use crate::format::{
    format_recommendations_table, format_single_recommendation, format_volume,
    DEFAULT_TABLE_MAX_LENGTH,
};
use crate::ingest::quotes::{FinvizClient, QuoteMetricsClient};
use crate::ingest::source::{HttpRecommendationSource, RecommendationSource};
use crate::publish::discord::DiscordWebhookPublisher;
use crate::publish::Publisher;
use crate::storage::posted_tickers::PostedTickerLedger;
use anyhow::Context;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_POST_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_MIN_RELATIVE_VOLUME: f64 = 2.0;
const DEFAULT_MIN_VOLUME: u64 = 1_000_000;

/// Fixed for the lifetime of one scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub min_relative_volume: f64,
    pub min_volume: u64,
    pub check_metrics: bool,
    pub track_posted: bool,
    /// Pause between successive posts within one cycle (downstream rate limit).
    pub post_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            min_relative_volume: DEFAULT_MIN_RELATIVE_VOLUME,
            min_volume: DEFAULT_MIN_VOLUME,
            check_metrics: true,
            track_posted: true,
            post_delay: DEFAULT_POST_DELAY,
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            min_relative_volume: settings.min_relative_volume,
            min_volume: settings.min_volume,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    MissingTicker,
    AlreadyPosted,
    /// The ledger could not be read, so dedup cannot be guaranteed.
    LedgerUnavailable,
    MetricsUnavailable,
    RelativeVolumeBelow,
    VolumeBelow,
}

impl Verdict {
    pub fn would_post(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::MissingTicker => "SKIP: no ticker",
            Verdict::AlreadyPosted => "SKIP: already posted",
            Verdict::LedgerUnavailable => "SKIP: ledger unavailable",
            Verdict::MetricsUnavailable => "SKIP: metrics unavailable",
            Verdict::RelativeVolumeBelow => "SKIP: RVOL below threshold",
            Verdict::VolumeBelow => "SKIP: volume below threshold",
        }
    }
}

/// Result of running one item through the filters. Metrics are kept even when the
/// item is rejected on thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct Screening {
    pub ticker: Option<String>,
    pub verdict: Verdict,
    pub metrics: Option<QuoteMetrics>,
}

/// Dry-run view of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub item: RecommendationItem,
    pub screening: Screening,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub posted: usize,
    pub total: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Collaborators a scheduler drives. `metrics` is required when metrics checking is
/// on and `ledger` when tracking is on.
pub struct SchedulerDeps {
    pub source: Arc<dyn RecommendationSource>,
    pub publisher: Arc<dyn Publisher>,
    pub metrics: Option<Arc<dyn QuoteMetricsClient>>,
    pub ledger: Option<PostedTickerLedger>,
}

struct Pipeline {
    config: SchedulerConfig,
    source: Arc<dyn RecommendationSource>,
    publisher: Arc<dyn Publisher>,
    metrics: Option<Arc<dyn QuoteMetricsClient>>,
    ledger: Option<PostedTickerLedger>,
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls the recommendation source, filters each item through the ledger and the
/// quote metrics thresholds, and posts survivors downstream.
///
/// One cycle at a time: items are evaluated sequentially and a ledger record is
/// written only after the downstream post succeeded.
pub struct RecommendationScheduler {
    pipeline: Arc<Pipeline>,
    running: Option<RunningLoop>,
    released: bool,
}

impl RecommendationScheduler {
    pub fn new(config: SchedulerConfig, deps: SchedulerDeps) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.check_metrics || deps.metrics.is_some(),
            "metrics checking is enabled but no quote metrics client was provided"
        );
        anyhow::ensure!(
            !config.track_posted || deps.ledger.is_some(),
            "posted ticker tracking is enabled but no ledger was provided"
        );
        anyhow::ensure!(
            !config.poll_interval.is_zero(),
            "poll_interval must be greater than zero"
        );
        anyhow::ensure!(
            config.min_relative_volume.is_finite() && config.min_relative_volume >= 0.0,
            "min_relative_volume must be a non-negative number (got {})",
            config.min_relative_volume
        );

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                config,
                source: deps.source,
                publisher: deps.publisher,
                metrics: deps.metrics,
                ledger: deps.ledger,
            }),
            running: None,
            released: false,
        })
    }

    /// Wires the production collaborators: HTTP source, Discord webhook, Finviz and
    /// the SQLite ledger at the configured path.
    pub async fn from_settings(settings: &Settings, config: SchedulerConfig) -> anyhow::Result<Self> {
        let publisher = DiscordWebhookPublisher::from_settings(settings)?;
        Self::from_settings_with_publisher(settings, config, Arc::new(publisher)).await
    }

    pub async fn from_settings_with_publisher(
        settings: &Settings,
        config: SchedulerConfig,
        publisher: Arc<dyn Publisher>,
    ) -> anyhow::Result<Self> {
        let source = HttpRecommendationSource::from_settings(settings)?;

        let metrics: Option<Arc<dyn QuoteMetricsClient>> = if config.check_metrics {
            Some(Arc::new(FinvizClient::new()?))
        } else {
            None
        };

        let ledger = if config.track_posted {
            Some(PostedTickerLedger::open(&settings.ledger_path()).await?)
        } else {
            None
        };

        Self::new(
            config,
            SchedulerDeps {
                source: Arc::new(source),
                publisher,
                metrics,
                ledger,
            },
        )
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.pipeline.config
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawns the polling loop. Calling it again while running only logs.
    pub fn start(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.released,
            "scheduler resources were released by stop(); build a new scheduler"
        );
        if self.is_running() {
            tracing::warn!("recommendations scheduler already running");
            return Ok(());
        }

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop(self.pipeline.clone(), rx));
        self.running = Some(RunningLoop { shutdown, handle });
        tracing::info!("recommendations scheduler started");
        Ok(())
    }

    /// Cancels the loop (including an in-flight cycle), waits for it to unwind, then
    /// releases HTTP clients and closes the ledger. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            match running.handle.await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => tracing::error!(error = %err, "recommendations poll task failed"),
            }
        }

        if !self.released {
            self.pipeline.release().await;
            self.released = true;
            tracing::info!("recommendations scheduler stopped");
        }
    }

    /// One cycle; fetch failures are errors.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleSummary> {
        self.pipeline.run_cycle().await
    }

    /// One cycle returning `(posted, total)`; fetch failures are logged and yield `(0, 0)`.
    pub async fn fetch_and_post_once(&self) -> (usize, usize) {
        match self.pipeline.run_cycle().await {
            Ok(summary) => (summary.posted, summary.total),
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "failed to fetch and post recommendations");
                (0, 0)
            }
        }
    }

    /// Current batch rendered as a table, nothing posted.
    pub async fn fetch_once(&self) -> anyhow::Result<String> {
        let payload = self
            .pipeline
            .source
            .fetch()
            .await
            .context("fetch recommendations failed")?;
        Ok(format_recommendations_table(&payload, DEFAULT_TABLE_MAX_LENGTH))
    }

    /// Screens the current batch with the posting policy without posting or writing
    /// the ledger.
    pub async fn preview(&self) -> anyhow::Result<Vec<Preview>> {
        let payload = self
            .pipeline
            .source
            .fetch()
            .await
            .context("fetch recommendations failed")?;

        let items = get_recommendations_list(&payload);
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let screening = self.pipeline.screen(&item).await;
            let message = format_single_recommendation(&item, screening.metrics.as_ref());
            out.push(Preview {
                item,
                screening,
                message,
            });
        }
        Ok(out)
    }

    pub async fn screen(&self, item: &RecommendationItem) -> Screening {
        self.pipeline.screen(item).await
    }
}

impl Drop for RecommendationScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.abort();
        }
    }
}

async fn poll_loop(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(
        interval_secs = pipeline.config.poll_interval.as_secs(),
        min_rvol = pipeline.config.min_relative_volume,
        min_volume = %format_volume(pipeline.config.min_volume),
        "starting recommendations polling"
    );

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            res = AssertUnwindSafe(pipeline.run_cycle()).catch_unwind() => match res {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %format!("{err:#}"), "recommendations poll cycle failed");
                }
                Err(_) => tracing::error!("recommendations poll cycle panicked"),
            },
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(pipeline.config.poll_interval) => {}
        }
    }

    tracing::info!("recommendations polling stopped");
}

impl Pipeline {
    async fn run_cycle(&self) -> anyhow::Result<CycleSummary> {
        let payload = self
            .source
            .fetch()
            .await
            .context("fetch recommendations failed")?;
        let items = get_recommendations_list(&payload);

        if items.is_empty() {
            tracing::warn!("no recommendations to post");
            return Ok(CycleSummary::default());
        }

        let mut summary = CycleSummary {
            total: items.len(),
            ..Default::default()
        };
        let mut attempted = false;

        for item in &items {
            let screening = self.screen(item).await;
            let Some(ticker) = screening.ticker.as_deref().filter(|_| screening.verdict.would_post())
            else {
                summary.skipped += 1;
                continue;
            };

            if attempted && !self.config.post_delay.is_zero() {
                tokio::time::sleep(self.config.post_delay).await;
            }
            attempted = true;

            let message = format_single_recommendation(item, screening.metrics.as_ref());
            let result = self.publisher.publish(&message, None).await;
            if !result.success {
                summary.failed += 1;
                tracing::warn!(
                    %ticker,
                    publisher = self.publisher.name(),
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "post rejected; ticker stays unposted for the next cycle"
                );
                continue;
            }

            summary.posted += 1;
            tracing::info!(
                %ticker,
                publisher = self.publisher.name(),
                message_id = ?result.message_id.as_ref().or(result.post_uri.as_ref()),
                "posted recommendation"
            );

            if let Some(ledger) = self.ledger.as_ref().filter(|_| self.config.track_posted) {
                let theme = item.theme();
                let sector = item.sector();
                if let Err(err) = ledger
                    .mark_posted(ticker, screening.metrics.as_ref(), theme.as_deref(), sector.as_deref())
                    .await
                {
                    tracing::error!(%ticker, error = %format!("{err:#}"), "failed to record posted ticker");
                }
            }
        }

        tracing::info!(
            posted = summary.posted,
            total = summary.total,
            skipped = summary.skipped,
            failed = summary.failed,
            min_rvol = self.config.min_relative_volume,
            min_volume = %format_volume(self.config.min_volume),
            "recommendations cycle complete"
        );
        Ok(summary)
    }

    /// Cheap checks first: the ledger lookup runs before the metrics fetch.
    async fn screen(&self, item: &RecommendationItem) -> Screening {
        let Some(ticker) = item.ticker() else {
            tracing::debug!("recommendation without ticker; skipping");
            return Screening {
                ticker: None,
                verdict: Verdict::MissingTicker,
                metrics: None,
            };
        };
        let verdict = |verdict, metrics| Screening {
            ticker: Some(ticker.clone()),
            verdict,
            metrics,
        };

        if let Some(ledger) = self.ledger.as_ref().filter(|_| self.config.track_posted) {
            match ledger.is_posted(&ticker).await {
                Ok(true) => {
                    tracing::debug!(%ticker, "already posted; skipping");
                    return verdict(Verdict::AlreadyPosted, None);
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(%ticker, error = %format!("{err:#}"), "ledger lookup failed; skipping");
                    return verdict(Verdict::LedgerUnavailable, None);
                }
            }
        }

        if !self.config.check_metrics {
            return verdict(Verdict::Pass, None);
        }

        let fetched = match self.metrics.as_ref() {
            Some(client) => client.get_metrics(&ticker).await,
            None => None,
        };
        let Some(metrics) = fetched else {
            tracing::warn!(%ticker, "could not fetch metrics; skipping");
            return verdict(Verdict::MetricsUnavailable, None);
        };

        let min_rvol = self.config.min_relative_volume;
        if !metrics.relative_volume.is_some_and(|rvol| rvol >= min_rvol) {
            tracing::info!(
                %ticker,
                rvol = ?metrics.relative_volume,
                min_rvol,
                "RVOL below threshold; skipping"
            );
            return verdict(Verdict::RelativeVolumeBelow, Some(metrics));
        }

        let min_volume = self.config.min_volume;
        if !metrics.volume.is_some_and(|v| v >= min_volume) {
            tracing::info!(
                %ticker,
                volume = ?metrics.volume,
                min_volume = %format_volume(min_volume),
                "volume below threshold; skipping"
            );
            return verdict(Verdict::VolumeBelow, Some(metrics));
        }

        tracing::info!(
            %ticker,
            rvol = ?metrics.relative_volume,
            volume = ?metrics.volume,
            "passed metrics thresholds"
        );
        verdict(Verdict::Pass, Some(metrics))
    }

    async fn release(&self) {
        self.source.close().await;
        if let Some(metrics) = &self.metrics {
            metrics.close().await;
        }
        self.publisher.close().await;
        if let Some(ledger) = &self.ledger {
            ledger.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::{ImageAttachment, PublishResult};
    use serde_json::{json, Value};
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeSource {
        queued: Mutex<VecDeque<Result<Value, String>>>,
        fallback: Value,
        closed: AtomicBool,
    }

    impl FakeSource {
        fn new(payload: Value) -> Arc<Self> {
            Self::with_queue(payload, [])
        }

        fn with_queue(
            fallback: Value,
            queued: impl IntoIterator<Item = Result<Value, String>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                queued: Mutex::new(queued.into_iter().collect()),
                fallback,
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl RecommendationSource for FakeSource {
        fn source_name(&self) -> &'static str {
            "fake"
        }

        async fn fetch(&self) -> anyhow::Result<Value> {
            let next = self.queued.lock().unwrap().pop_front();
            match next {
                Some(Ok(v)) => Ok(v),
                Some(Err(e)) => Err(anyhow::anyhow!(e)),
                None => Ok(self.fallback.clone()),
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeMetrics {
        by_ticker: HashMap<String, QuoteMetrics>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeMetrics {
        fn with(entries: &[(&str, f64, u64)]) -> Arc<Self> {
            Arc::new(Self {
                by_ticker: entries
                    .iter()
                    .map(|(t, rvol, vol)| {
                        (
                            t.to_string(),
                            QuoteMetrics {
                                relative_volume: Some(*rvol),
                                volume: Some(*vol),
                            },
                        )
                    })
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl QuoteMetricsClient for FakeMetrics {
        async fn get_metrics(&self, ticker: &str) -> Option<QuoteMetrics> {
            self.calls.lock().unwrap().push(ticker.to_string());
            self.by_ticker.get(ticker).copied()
        }
    }

    #[derive(Default)]
    struct FakePublisher {
        posted: Mutex<Vec<String>>,
        posted_at: Mutex<Vec<tokio::time::Instant>>,
        reject_once: Mutex<HashSet<String>>,
        delay: Option<Duration>,
        closed: AtomicBool,
    }

    impl FakePublisher {
        fn posted(&self) -> Vec<String> {
            self.posted.lock().unwrap().clone()
        }
    }

    fn ticker_of(message: &str) -> String {
        let start = message.find("**$").map(|i| i + 3).unwrap_or(0);
        let end = message[start..].find("**").map(|i| start + i).unwrap_or(start);
        message[start..end].to_string()
    }

    #[async_trait::async_trait]
    impl Publisher for FakePublisher {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn publish(&self, message: &str, _image: Option<&ImageAttachment>) -> PublishResult {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let ticker = ticker_of(message);
            if self.reject_once.lock().unwrap().remove(&ticker) {
                return PublishResult::failed("HTTP 429");
            }
            self.posted.lock().unwrap().push(ticker);
            self.posted_at.lock().unwrap().push(tokio::time::Instant::now());
            PublishResult::with_message_id(Some("m-1".to_string()))
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            post_delay: Duration::ZERO,
            ..SchedulerConfig::default()
        }
    }

    fn three_item_batch() -> Value {
        json!({"recommendations": [
            {"ticker": "AAPL", "company": "Apple", "sector": "Technology", "theme": "AI devices"},
            {"ticker": "MSFT", "company": "Microsoft", "sector": "Technology"},
            {"ticker": "GOOG", "company": "Alphabet", "sector": "Communication", "theme": "Search"},
        ]})
    }

    fn three_item_metrics() -> Arc<FakeMetrics> {
        FakeMetrics::with(&[
            ("AAPL", 3.0, 2_000_000),
            ("MSFT", 1.0, 500_000),
            ("GOOG", 2.5, 1_500_000),
        ])
    }

    async fn scheduler(
        config: SchedulerConfig,
        source: Arc<FakeSource>,
        metrics: Arc<FakeMetrics>,
        publisher: Arc<FakePublisher>,
        ledger: &PostedTickerLedger,
    ) -> RecommendationScheduler {
        RecommendationScheduler::new(
            config,
            SchedulerDeps {
                source,
                publisher,
                metrics: Some(metrics),
                ledger: Some(ledger.clone()),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn posts_only_items_passing_both_thresholds_then_dedups() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        let metrics = three_item_metrics();
        let publisher = Arc::new(FakePublisher::default());
        let s = scheduler(
            config(),
            FakeSource::new(three_item_batch()),
            metrics.clone(),
            publisher.clone(),
            &ledger,
        )
        .await;

        assert_eq!(s.fetch_and_post_once().await, (2, 3));
        assert_eq!(publisher.posted(), ["AAPL", "GOOG"]);
        assert!(ledger.is_posted("AAPL").await.unwrap());
        assert!(ledger.is_posted("GOOG").await.unwrap());
        assert!(!ledger.is_posted("MSFT").await.unwrap());

        let records = ledger.list().await.unwrap();
        let aapl = records.iter().find(|r| r.ticker == "AAPL").unwrap();
        assert_eq!(aapl.relative_volume, Some(3.0));
        assert_eq!(aapl.theme.as_deref(), Some("AI devices"));
        assert_eq!(aapl.sector.as_deref(), Some("Technology"));

        // Second identical cycle: both already in the ledger, and the ledger check
        // runs before any metrics lookup.
        assert_eq!(s.fetch_and_post_once().await, (0, 3));
        assert_eq!(publisher.posted().len(), 2);
        assert_eq!(metrics.calls(), ["AAPL", "MSFT", "GOOG", "MSFT"]);
    }

    #[tokio::test]
    async fn low_relative_volume_is_never_posted() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        let publisher = Arc::new(FakePublisher::default());
        let s = scheduler(
            config(),
            FakeSource::new(json!([{"ticker": "TSLA", "risk_level": "Low"}])),
            FakeMetrics::with(&[("TSLA", 1.99, 900_000_000)]),
            publisher.clone(),
            &ledger,
        )
        .await;

        let summary = s.run_cycle().await.unwrap();
        assert_eq!(summary.posted, 0);
        assert_eq!(summary.skipped, 1);
        assert!(publisher.posted().is_empty());

        let screening = s
            .screen(&get_recommendations_list(&json!({"ticker": "TSLA"}))[0])
            .await;
        assert_eq!(screening.verdict, Verdict::RelativeVolumeBelow);
        // Metrics are still reported for diagnostics.
        assert_eq!(screening.metrics.unwrap().relative_volume, Some(1.99));
    }

    #[tokio::test]
    async fn volume_threshold_applies_after_relative_volume() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        let s = scheduler(
            config(),
            FakeSource::new(json!([])),
            FakeMetrics::with(&[("AMD", 4.0, 999_999)]),
            Arc::new(FakePublisher::default()),
            &ledger,
        )
        .await;

        let item = &get_recommendations_list(&json!({"ticker": "AMD"}))[0];
        assert_eq!(s.screen(item).await.verdict, Verdict::VolumeBelow);
    }

    #[tokio::test]
    async fn unavailable_metrics_skip_the_item() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        let publisher = Arc::new(FakePublisher::default());
        let s = scheduler(
            config(),
            FakeSource::new(json!([{"ticker": "NOPE"}, {"company": "No ticker"}])),
            FakeMetrics::with(&[]),
            publisher.clone(),
            &ledger,
        )
        .await;

        assert_eq!(s.fetch_and_post_once().await, (0, 2));
        assert!(publisher.posted().is_empty());
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_post_is_not_recorded_and_retried_next_cycle() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        let publisher = Arc::new(FakePublisher::default());
        publisher.reject_once.lock().unwrap().insert("AAPL".to_string());
        let s = scheduler(
            config(),
            FakeSource::new(three_item_batch()),
            three_item_metrics(),
            publisher.clone(),
            &ledger,
        )
        .await;

        let first = s.run_cycle().await.unwrap();
        assert_eq!((first.posted, first.failed), (1, 1));
        assert!(!ledger.is_posted("AAPL").await.unwrap());

        let second = s.run_cycle().await.unwrap();
        assert_eq!(second.posted, 1);
        assert_eq!(publisher.posted(), ["GOOG", "AAPL"]);
        assert!(ledger.is_posted("AAPL").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_tickers_in_one_batch_post_once() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        let publisher = Arc::new(FakePublisher::default());
        let s = scheduler(
            config(),
            FakeSource::new(json!([{"ticker": "AAPL"}, {"ticker": "aapl"}])),
            FakeMetrics::with(&[("AAPL", 3.0, 2_000_000), ("aapl", 3.0, 2_000_000)]),
            publisher.clone(),
            &ledger,
        )
        .await;

        assert_eq!(s.fetch_and_post_once().await, (1, 2));
        assert_eq!(publisher.posted(), ["AAPL"]);
    }

    #[tokio::test]
    async fn without_tracking_or_metrics_every_item_posts_every_cycle() {
        let publisher = Arc::new(FakePublisher::default());
        let s = RecommendationScheduler::new(
            SchedulerConfig {
                check_metrics: false,
                track_posted: false,
                ..config()
            },
            SchedulerDeps {
                source: FakeSource::new(three_item_batch()),
                publisher: publisher.clone(),
                metrics: None,
                ledger: None,
            },
        )
        .unwrap();

        assert_eq!(s.fetch_and_post_once().await, (3, 3));
        assert_eq!(s.fetch_and_post_once().await, (3, 3));
        assert_eq!(publisher.posted().len(), 6);
    }

    #[tokio::test]
    async fn fetch_failure_skips_the_cycle() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        let s = scheduler(
            config(),
            FakeSource::with_queue(
                three_item_batch(),
                [Err("connection refused".to_string()), Err("HTTP 502".to_string())],
            ),
            three_item_metrics(),
            Arc::new(FakePublisher::default()),
            &ledger,
        )
        .await;

        assert!(s.run_cycle().await.is_err());
        assert_eq!(s.fetch_and_post_once().await, (0, 0));
        assert_eq!(s.fetch_and_post_once().await, (2, 3));
    }

    #[tokio::test]
    async fn preview_neither_posts_nor_records() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        ledger.mark_posted("GOOG", None, None, None).await.unwrap();
        let publisher = Arc::new(FakePublisher::default());
        let s = scheduler(
            config(),
            FakeSource::new(three_item_batch()),
            three_item_metrics(),
            publisher.clone(),
            &ledger,
        )
        .await;

        let previews = s.preview().await.unwrap();
        let verdicts: Vec<_> = previews.iter().map(|p| p.screening.verdict).collect();
        assert_eq!(
            verdicts,
            [Verdict::Pass, Verdict::RelativeVolumeBelow, Verdict::AlreadyPosted]
        );
        assert!(previews[0].message.contains("🔥 RVOL: 3.00"));
        assert!(publisher.posted().is_empty());
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fetch_once_renders_a_table() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        let s = scheduler(
            config(),
            FakeSource::new(three_item_batch()),
            three_item_metrics(),
            Arc::new(FakePublisher::default()),
            &ledger,
        )
        .await;

        let table = s.fetch_once().await.unwrap();
        assert!(table.starts_with("**Falcon Recommendations**"));
        assert!(table.contains("MSFT"));
    }

    #[test]
    fn requires_collaborators_for_enabled_checks() {
        let deps = || SchedulerDeps {
            source: FakeSource::new(json!([])),
            publisher: Arc::new(FakePublisher::default()),
            metrics: None,
            ledger: None,
        };
        assert!(RecommendationScheduler::new(config(), deps()).is_err());
        assert!(RecommendationScheduler::new(
            SchedulerConfig {
                track_posted: false,
                ..config()
            },
            deps()
        )
        .is_err());
        assert!(RecommendationScheduler::new(
            SchedulerConfig {
                track_posted: false,
                check_metrics: false,
                min_relative_volume: f64::NAN,
                ..config()
            },
            deps()
        )
        .is_err());
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let res = RecommendationScheduler::new(
            SchedulerConfig {
                poll_interval: Duration::ZERO,
                check_metrics: false,
                track_posted: false,
                ..config()
            },
            SchedulerDeps {
                source: FakeSource::new(json!([])),
                publisher: Arc::new(FakePublisher::default()),
                metrics: None,
                ledger: None,
            },
        );
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn posts_are_paced_by_post_delay() {
        let post_delay = Duration::from_secs(2);
        let publisher = Arc::new(FakePublisher::default());
        let s = RecommendationScheduler::new(
            SchedulerConfig {
                check_metrics: false,
                track_posted: false,
                post_delay,
                ..config()
            },
            SchedulerDeps {
                source: FakeSource::new(json!([
                    {"ticker": "AAPL"},
                    {"company": "No ticker"},
                    {"ticker": "GOOG"},
                    {"ticker": "NVDA"},
                ])),
                publisher: publisher.clone(),
                metrics: None,
                ledger: None,
            },
        )
        .unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(s.fetch_and_post_once().await, (3, 4));
        assert_eq!(publisher.posted(), ["AAPL", "GOOG", "NVDA"]);

        let slack = Duration::from_millis(10);
        let at = publisher.posted_at.lock().unwrap().clone();
        assert!(at[0] - started < slack, "first post must not wait");
        for pair in at.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= post_delay && gap < post_delay + slack, "gap {gap:?}");
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn loop_survives_failed_cycles_and_stops_cleanly() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        let source = FakeSource::with_queue(three_item_batch(), [Err("timeout".to_string())]);
        let publisher = Arc::new(FakePublisher::default());
        let mut s = scheduler(
            config(),
            source.clone(),
            three_item_metrics(),
            publisher.clone(),
            &ledger,
        )
        .await;

        s.start().unwrap();
        s.start().unwrap();
        assert!(s.is_running());

        wait_for(|| publisher.posted().len() == 2).await;

        tokio::time::timeout(Duration::from_secs(5), s.stop())
            .await
            .expect("stop did not return");
        assert!(!s.is_running());
        assert!(source.closed.load(Ordering::SeqCst));
        assert!(publisher.closed.load(Ordering::SeqCst));
        assert!(ledger.is_closed());

        s.stop().await;
        assert!(s.start().is_err());
    }

    #[tokio::test]
    async fn stop_interrupts_an_in_flight_cycle_without_recording() {
        let ledger = PostedTickerLedger::open_in_memory().await.unwrap();
        let publisher = Arc::new(FakePublisher {
            delay: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        let metrics = three_item_metrics();
        let mut s = scheduler(
            SchedulerConfig {
                poll_interval: Duration::from_secs(3600),
                ..config()
            },
            FakeSource::new(three_item_batch()),
            metrics.clone(),
            publisher.clone(),
            &ledger,
        )
        .await;

        s.start().unwrap();
        // The first item has been screened, so its post is now pending.
        wait_for(|| !metrics.calls().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), s.stop())
            .await
            .expect("stop did not interrupt the cycle");
        assert!(publisher.posted().is_empty());
        assert!(ledger.is_closed());
    }
}
