use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use falcon_core::config::Settings;
use falcon_core::publish::registry::PublisherRegistry;
use falcon_core::publish::{ImageAttachment, PublishResult};
use falcon_core::scheduler::{RecommendationScheduler, SchedulerConfig};

const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    let default_level = if settings.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let registry = PublisherRegistry::from_settings(&settings).inspect_err(|e| {
        sentry_anyhow::capture_anyhow(e);
    })?;
    tracing::info!(
        version = falcon_core::VERSION,
        targets = ?registry.names(),
        "falcon api starting"
    );

    let mut scheduler = if settings.recommendations_enabled {
        let scheduler = start_scheduler(&settings).await.inspect_err(|e| {
            sentry_anyhow::capture_anyhow(e);
        })?;
        Some(scheduler)
    } else {
        None
    };

    let state = AppState::new(registry.clone(), settings.clone())?;
    let app = router(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.stop().await;
    }
    registry.close().await;
    tracing::info!("falcon api shutdown");

    served?;
    Ok(())
}

async fn start_scheduler(settings: &Settings) -> anyhow::Result<RecommendationScheduler> {
    let mut scheduler =
        RecommendationScheduler::from_settings(settings, SchedulerConfig::from_settings(settings))
            .await?;
    scheduler.start()?;
    Ok(scheduler)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(health))
        .route("/config", get(config_check))
        .route("/publish", post(publish))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    registry: PublisherRegistry,
    settings: Arc<Settings>,
    http: reqwest::Client,
}

impl AppState {
    fn new(registry: PublisherRegistry, settings: Settings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(IMAGE_FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            registry,
            settings: Arc::new(settings),
            http,
        })
    }
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "detail": self.1 }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    configured_targets: Vec<&'static str>,
    target_status: BTreeMap<String, bool>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: falcon_core::VERSION,
        configured_targets: state.registry.names(),
        target_status: state.registry.health_check_all().await,
    })
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    bluesky_configured: bool,
    discord_configured: bool,
    configured_targets: Vec<&'static str>,
}

async fn config_check(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        bluesky_configured: state.settings.bluesky_configured(),
        discord_configured: state.settings.discord_configured(),
        configured_targets: state.settings.configured_targets(),
    })
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    message: String,
    image_url: Option<String>,
    image_data: Option<String>,
    targets: Option<Vec<String>>,
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    success: bool,
    results: BTreeMap<String, PublishResult>,
}

async fn publish(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, ApiError> {
    let image = match (req.image_data.as_deref(), req.image_url.as_deref()) {
        (Some(data), _) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|e| {
                    ApiError(StatusCode::BAD_REQUEST, format!("Invalid base64 image data: {e}"))
                })?;
            Some(ImageAttachment::new(bytes, None))
        }
        (None, Some(url)) => Some(fetch_image(&state.http, url).await.map_err(|e| {
            ApiError(StatusCode::BAD_REQUEST, format!("Failed to fetch image: {e:#}"))
        })?),
        (None, None) => None,
    };

    let results = state
        .registry
        .publish(
            &req.message,
            image.as_ref(),
            req.targets.as_deref(),
            req.metadata.as_ref(),
        )
        .await;

    if results.is_empty() {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "No valid targets specified or no publishers configured".to_string(),
        ));
    }

    let success = results.values().all(|r| r.success);
    Ok(Json(PublishResponse { success, results }))
}

async fn fetch_image(http: &reqwest::Client, url: &str) -> anyhow::Result<ImageAttachment> {
    let res = http.get(url).send().await?.error_for_status()?;
    let mime = res
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = res.bytes().await?;
    Ok(ImageAttachment::new(bytes.to_vec(), mime.as_deref()))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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
