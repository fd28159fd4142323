use crate::domain::metrics::QuoteMetrics;
use crate::ingest::error::FetchError;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://finviz.com/quote.ashx";
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36";

const RELATIVE_VOLUME_LABEL: &str = "Rel Volume</td>";
// Leading '>' keeps "Avg Volume" and "Rel Volume" cells from matching.
const VOLUME_LABEL: &str = ">Volume</td>";

#[async_trait::async_trait]
pub trait QuoteMetricsClient: Send + Sync {
    /// Fails soft: `None` when the quote page cannot be fetched or exposes neither
    /// metric. A single missing label only drops that field.
    async fn get_metrics(&self, ticker: &str) -> Option<QuoteMetrics>;

    async fn close(&self) {}
}

/// Scrapes relative volume and volume from the public Finviz quote page.
#[derive(Debug, Clone)]
pub struct FinvizClient {
    http: reqwest::Client,
    base_url: String,
}

impl FinvizClient {
    pub fn new() -> Result<Self> {
        let base_url = std::env::var("FINVIZ_QUOTE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::with_base_url(base_url)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let timeout_secs = std::env::var("FINVIZ_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        // Finviz rejects requests without a browser-like header set.
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml"),
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .default_headers(headers)
            .build()
            .context("failed to build finviz http client")?;

        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    async fn fetch_page(&self, ticker: &str) -> Result<String> {
        let res = self
            .http
            .get(&self.base_url)
            .query(&[("t", ticker)])
            .send()
            .await
            .map_err(|err| FetchError {
                origin: "finviz",
                stage: "request",
                url: self.base_url.clone(),
                status: None,
                detail: err.to_string(),
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(FetchError {
                origin: "finviz",
                stage: "http",
                url: self.base_url.clone(),
                status: Some(status.as_u16()),
                detail: format!("quote page for {ticker} returned {status}"),
            }
            .into());
        }

        res.text()
            .await
            .context("failed to read finviz response body")
    }
}

#[async_trait::async_trait]
impl QuoteMetricsClient for FinvizClient {
    async fn get_metrics(&self, ticker: &str) -> Option<QuoteMetrics> {
        let html = match self.fetch_page(ticker).await {
            Ok(html) => html,
            Err(err) => {
                tracing::error!(%ticker, error = %err, "failed to fetch quote metrics");
                return None;
            }
        };

        let metrics = parse_quote_metrics(ticker, &html)?;
        tracing::debug!(
            %ticker,
            relative_volume = ?metrics.relative_volume,
            volume = ?metrics.volume,
            "quote metrics"
        );
        Some(metrics)
    }
}

/// Extracts metrics from a quote page. `None` when neither label is present.
pub fn parse_quote_metrics(ticker: &str, html: &str) -> Option<QuoteMetrics> {
    let relative_volume = emphasized_value_after(html, RELATIVE_VOLUME_LABEL, is_decimal)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0);
    if relative_volume.is_none() {
        tracing::warn!(%ticker, "relative volume not found on quote page");
    }

    let volume = emphasized_value_after(html, VOLUME_LABEL, is_grouped_integer)
        .and_then(|s| s.replace(',', "").parse::<u64>().ok());
    if volume.is_none() {
        tracing::warn!(%ticker, "volume not found on quote page");
    }

    let metrics = QuoteMetrics {
        relative_volume,
        volume,
    };
    (!metrics.is_empty()).then_some(metrics)
}

/// Finds `label` and reads the emphasized token in the next cell, i.e.
/// `<label><td ...><b ...>TOKEN</b>`. Every occurrence of the label is tried.
fn emphasized_value_after<'a>(
    html: &'a str,
    label: &str,
    accept: fn(&str) -> bool,
) -> Option<&'a str> {
    html.match_indices(label).find_map(|(idx, _)| {
        let rest = &html[idx + label.len()..];
        let rest = skip_open_tag(rest.trim_start(), "<td")?;
        let mut rest = skip_open_tag(rest.trim_start(), "<b")?;
        // Newer layouts nest the value in a span.
        if let Some(inner) = skip_open_tag(rest.trim_start(), "<span") {
            rest = inner;
        }
        let end = rest.find('<')?;
        let token = rest[..end].trim();
        accept(token).then_some(token)
    })
}

fn skip_open_tag<'a>(s: &'a str, tag: &str) -> Option<&'a str> {
    let rest = s.strip_prefix(tag)?;
    // "<b" must not match "<br" or "<body".
    match rest.chars().next()? {
        '>' => Some(&rest[1..]),
        c if c.is_ascii_whitespace() => {
            let close = rest.find('>')?;
            Some(&rest[close + 1..])
        }
        _ => None,
    }
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn is_grouped_integer(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_digit())
        && s.chars().all(|c| c.is_ascii_digit() || c == ',')
}
