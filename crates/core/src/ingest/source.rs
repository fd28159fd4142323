use crate::config::Settings;
use crate::domain::recommendation::get_recommendations_list;
use crate::ingest::error::FetchError;
use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[async_trait::async_trait]
pub trait RecommendationSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Fetches the current raw payload. Unreachable endpoints and non-2xx responses
    /// are errors; the caller decides whether to skip the cycle.
    async fn fetch(&self) -> Result<Value>;

    async fn close(&self) {}
}

#[derive(Debug, Clone)]
pub struct HttpRecommendationSource {
    http: reqwest::Client,
    endpoint_url: String,
}

impl HttpRecommendationSource {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let endpoint_url = settings.require_endpoint_url()?;
        Self::new(endpoint_url, settings.verify_ssl)
    }

    pub fn new(endpoint_url: &str, verify_ssl: bool) -> Result<Self> {
        let endpoint_url = endpoint_url.trim();
        anyhow::ensure!(!endpoint_url.is_empty(), "recommendation endpoint URL must be non-empty");

        let timeout_secs = std::env::var("FALCON_ENDPOINT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        // Deployments commonly sit behind self-signed certificates.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .context("failed to build recommendation endpoint http client")?;

        Ok(Self {
            http,
            endpoint_url: endpoint_url.to_string(),
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    fn fetch_error(&self, stage: &'static str, status: Option<u16>, detail: String) -> FetchError {
        FetchError {
            origin: "recommendations",
            stage,
            url: self.endpoint_url.clone(),
            status,
            detail,
        }
    }
}

#[async_trait::async_trait]
impl RecommendationSource for HttpRecommendationSource {
    fn source_name(&self) -> &'static str {
        "http_json"
    }

    async fn fetch(&self) -> Result<Value> {
        tracing::info!(url = %self.endpoint_url, "fetching recommendations");

        let res = self
            .http
            .get(&self.endpoint_url)
            .send()
            .await
            .map_err(|err| self.fetch_error("request", None, err.to_string()))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|err| self.fetch_error("body", Some(status.as_u16()), err.to_string()))?;

        if !status.is_success() {
            return Err(self
                .fetch_error("http", Some(status.as_u16()), text)
                .into());
        }

        let payload = serde_json::from_str::<Value>(&text)
            .with_context(|| format!("recommendation response is not valid JSON: {text}"))?;

        tracing::info!(
            items = get_recommendations_list(&payload).len(),
            "fetched recommendations"
        );
        Ok(payload)
    }
}
