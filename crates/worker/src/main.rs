use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use falcon_core::config::Settings;
use falcon_core::publish::registry::PublisherRegistry;
use falcon_core::publish::ImageAttachment;

mod recommendations;

#[derive(Debug, Parser)]
#[command(name = "falcon", version, about = "Publish messages to Bluesky and Discord")]
struct Cli {
    /// Load environment variables from this file instead of ./.env.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish a message directly to the configured platforms.
    Publish(PublishArgs),
    /// Display or check configuration.
    Config(ConfigArgs),
    /// Fetch recommendations and post them to Discord.
    Recommendations(recommendations::RecommendationsArgs),
}

#[derive(Debug, clap::Args)]
struct PublishArgs {
    message: String,

    /// Target platform (bluesky, discord). Repeatable; defaults to all configured.
    #[arg(short, long = "target")]
    targets: Vec<String>,

    /// Path to an image to attach.
    #[arg(short, long)]
    image: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct ConfigArgs {
    /// Report which services are configured; exits non-zero when none are.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.env_file.as_deref() {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    let default_level = if settings.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let res = match cli.command {
        Command::Publish(args) => publish(settings, args).await,
        Command::Config(args) => config(&settings, args),
        Command::Recommendations(args) => recommendations::run(settings, args).await,
    };

    if let Err(err) = &res {
        sentry_anyhow::capture_anyhow(err);
    }
    res
}

async fn publish(settings: Settings, args: PublishArgs) -> anyhow::Result<()> {
    let registry = PublisherRegistry::from_settings(&settings)?;
    if registry.is_empty() {
        anyhow::bail!("no targets specified and no publishers configured");
    }

    let image = match args.image.as_deref() {
        Some(path) => Some(load_image(path)?),
        None => None,
    };

    let targets = (!args.targets.is_empty()).then_some(args.targets.as_slice());
    let results = registry.publish(&args.message, image.as_ref(), targets, None).await;
    registry.close().await;

    for (name, result) in &results {
        if result.success {
            println!("{name}: Published successfully");
            if let Some(uri) = &result.post_uri {
                println!("  URI: {uri}");
            }
            if let Some(id) = &result.message_id {
                println!("  Message ID: {id}");
            }
        } else {
            eprintln!(
                "{name}: Failed - {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    if results.is_empty() {
        anyhow::bail!("no publishers were available for the specified targets");
    }
    let failed = results.values().filter(|r| !r.success).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} targets failed", results.len());
    }
    Ok(())
}

fn load_image(path: &Path) -> anyhow::Result<ImageAttachment> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))?;
    Ok(ImageAttachment::new(data, Some(ImageAttachment::mime_for_path(path))))
}

fn config(settings: &Settings, args: ConfigArgs) -> anyhow::Result<()> {
    let status_label = |ok: bool| if ok { "Configured" } else { "Not configured" };

    if args.check {
        let status = settings.check_configuration();
        println!("Configuration Status:");
        println!("  Bluesky: {}", status_label(settings.bluesky_configured()));
        println!("  Discord: {}", status_label(settings.discord_configured()));
        println!("  Falcon Endpoint: {}", status_label(settings.endpoint_configured()));
        println!("\nConfigured targets: {:?}", settings.configured_targets());

        if !status.values().any(|ok| *ok) {
            println!("\nNo publishers configured. Set environment variables:");
            println!("  FALCON_BLUESKY_HANDLE and FALCON_BLUESKY_APP_PASSWORD");
            println!("  FALCON_DISCORD_WEBHOOK_URL");
            println!("  FALCON_ENDPOINT_URL (for recommendations)");
            anyhow::bail!("nothing is configured");
        }
        return Ok(());
    }

    println!("Server Configuration:");
    println!("  Host: {}", settings.host);
    println!("  Port: {}", settings.port);
    println!("  Debug: {}", settings.debug);
    println!("\nConfigured targets: {:?}", settings.configured_targets());
    if let Some(url) = &settings.endpoint_url {
        println!("\nFalcon Endpoint:");
        println!("  URL: {url}");
        println!("  Poll Interval: {}s", settings.poll_interval_secs);
        println!("  Verify SSL: {}", settings.verify_ssl);
        println!("  Min RVOL: {}", settings.min_relative_volume);
        println!("  Min Volume: {}", settings.min_volume);
        println!("  Ledger: {}", settings.ledger_path().display());
    }
    Ok(())
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
