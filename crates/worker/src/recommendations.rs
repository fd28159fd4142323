use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use std::path::PathBuf;
use std::sync::Arc;

use falcon_core::config::Settings;
use falcon_core::format::format_volume;
use falcon_core::publish::discord::DiscordWebhookPublisher;
use falcon_core::publish::{ImageAttachment, PublishResult, Publisher};
use falcon_core::scheduler::{RecommendationScheduler, SchedulerConfig};
use falcon_core::storage::posted_tickers::PostedTickerLedger;

#[derive(Debug, Default, clap::Args)]
pub struct RecommendationsArgs {
    /// Run a single cycle and exit.
    #[arg(long)]
    pub once: bool,

    /// Fetch and screen, print what would be posted, post nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Poll interval in seconds (overrides FALCON_POLL_INTERVAL).
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Recommendation endpoint URL (overrides FALCON_ENDPOINT_URL).
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Minimum relative volume to post.
    #[arg(long)]
    pub min_rvol: Option<f64>,

    /// Minimum traded volume to post.
    #[arg(long)]
    pub min_volume: Option<u64>,

    /// Skip the quote metrics filter.
    #[arg(long, alias = "no-rvol-check")]
    pub no_metrics_check: bool,

    /// Don't consult or update the posted ticker ledger (allows duplicates).
    #[arg(long)]
    pub no_tracking: bool,

    /// Print the posted ticker ledger and exit.
    #[arg(long)]
    pub show_history: bool,

    /// Clear the posted ticker ledger and exit.
    #[arg(long)]
    pub clear_history: bool,

    /// With --clear-history, only remove records posted before this date
    /// (YYYY-MM-DD, UTC midnight) or RFC 3339 timestamp.
    #[arg(long, requires = "clear_history", value_parser = parse_cutoff)]
    pub before: Option<DateTime<Utc>>,

    /// Ledger file (overrides FALCON_LEDGER_PATH).
    #[arg(long)]
    pub ledger_path: Option<PathBuf>,
}

impl RecommendationsArgs {
    fn apply_overrides(&self, settings: &mut Settings) -> anyhow::Result<()> {
        if let Some(endpoint) = &self.endpoint {
            settings.endpoint_url = Some(endpoint.clone());
        }
        if let Some(interval) = self.interval {
            anyhow::ensure!(interval > 0, "--interval must be at least 1 second");
            settings.poll_interval_secs = interval;
        }
        if let Some(min_rvol) = self.min_rvol {
            settings.min_relative_volume = min_rvol;
        }
        if let Some(min_volume) = self.min_volume {
            settings.min_volume = min_volume;
        }
        if let Some(path) = &self.ledger_path {
            settings.ledger_path = Some(path.clone());
        }
        Ok(())
    }

    fn scheduler_config(&self, settings: &Settings) -> SchedulerConfig {
        SchedulerConfig {
            check_metrics: !self.no_metrics_check,
            track_posted: !self.no_tracking,
            ..SchedulerConfig::from_settings(settings)
        }
    }
}

pub fn parse_cutoff(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("expected YYYY-MM-DD or an RFC 3339 timestamp, got {s:?}"))
}

/// Stands in for the downstream channel during dry runs, where nothing is posted.
struct DryRunPublisher;

#[async_trait::async_trait]
impl Publisher for DryRunPublisher {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn publish(&self, _message: &str, _image: Option<&ImageAttachment>) -> PublishResult {
        PublishResult::failed("dry run: posting disabled")
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub async fn run(mut settings: Settings, args: RecommendationsArgs) -> anyhow::Result<()> {
    args.apply_overrides(&mut settings)?;

    if args.show_history || args.clear_history {
        return history(&settings, &args).await;
    }

    settings
        .require_endpoint_url()
        .context("set FALCON_ENDPOINT_URL or use --endpoint")?;

    let config = args.scheduler_config(&settings);

    if args.dry_run {
        let mut scheduler =
            RecommendationScheduler::from_settings_with_publisher(&settings, config, Arc::new(DryRunPublisher))
                .await?;
        let res = dry_run(&scheduler).await;
        scheduler.stop().await;
        return res;
    }

    settings
        .require_discord_webhook_url()
        .context("set FALCON_DISCORD_WEBHOOK_URL or use --dry-run")?;
    let publisher = Arc::new(DiscordWebhookPublisher::from_settings(&settings)?);
    let mut scheduler =
        RecommendationScheduler::from_settings_with_publisher(&settings, config, publisher).await?;

    if args.once {
        let (posted, total) = scheduler.fetch_and_post_once().await;
        println!(
            "Posted {posted}/{total} recommendations to Discord (RVOL >= {}, volume >= {})",
            scheduler.config().min_relative_volume,
            format_volume(scheduler.config().min_volume)
        );
        scheduler.stop().await;
        return Ok(());
    }

    let cfg = scheduler.config().clone();
    println!("Starting recommendations scheduler");
    println!("  Interval: {}s", cfg.poll_interval.as_secs());
    println!("  Min RVOL: {}", cfg.min_relative_volume);
    println!("  Min Volume: {}", format_volume(cfg.min_volume));
    println!(
        "  Metrics check: {}",
        if cfg.check_metrics { "enabled" } else { "disabled" }
    );
    println!(
        "  Tracking: {}",
        if cfg.track_posted { "enabled" } else { "disabled" }
    );
    println!("Press Ctrl+C to stop");

    scheduler.start()?;
    let signal = tokio::signal::ctrl_c().await;
    println!("\nStopping scheduler...");
    scheduler.stop().await;
    signal.context("failed to listen for ctrl-c")?;
    Ok(())
}

async fn dry_run(scheduler: &RecommendationScheduler) -> anyhow::Result<()> {
    let previews = scheduler.preview().await?;
    let cfg = scheduler.config();
    println!(
        "Found {} recommendations (min RVOL: {}, min volume: {}):\n",
        previews.len(),
        cfg.min_relative_volume,
        format_volume(cfg.min_volume)
    );

    let total = previews.len();
    for (i, preview) in previews.iter().enumerate() {
        println!("--- {}/{total} [{}] ---", i + 1, preview.screening.verdict.label());
        println!("{}", preview.message);
        println!();
    }

    let passing = previews
        .iter()
        .filter(|p| p.screening.verdict.would_post())
        .count();
    println!("{passing}/{total} would be posted");
    Ok(())
}

async fn history(settings: &Settings, args: &RecommendationsArgs) -> anyhow::Result<()> {
    let ledger = PostedTickerLedger::open(&settings.ledger_path()).await?;
    let res = history_with(&ledger, args).await;
    ledger.close().await;
    for line in res? {
        println!("{line}");
    }
    Ok(())
}

async fn history_with(
    ledger: &PostedTickerLedger,
    args: &RecommendationsArgs,
) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();

    if args.show_history {
        let records = ledger.list().await?;
        if records.is_empty() {
            out.push("No posted tickers in history.".to_string());
        } else {
            out.push(format!("Posted tickers ({}):\n", records.len()));
            for r in records {
                let rvol = r
                    .relative_volume
                    .map(|v| format!("{v:.2}"))
                    .unwrap_or_else(|| "N/A".to_string());
                out.push(format!(
                    "  {:6} | RVOL: {:>5} | {:<10} | {}",
                    r.ticker,
                    rvol,
                    r.theme.unwrap_or_default(),
                    r.posted_at.to_rfc3339()
                ));
            }
        }
    }

    if args.clear_history {
        let removed = ledger.clear(args.before).await?;
        out.push(match args.before {
            Some(cutoff) => format!(
                "Cleared {removed} tickers posted before {} from history.",
                cutoff.to_rfc3339()
            ),
            None => format!("Cleared {removed} tickers from history."),
        });
    }

    Ok(out)
}
