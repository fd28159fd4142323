use crate::config::Settings;
use crate::publish::{ImageAttachment, PublishResult, Publisher};
use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct DiscordWebhookPublisher {
    http: reqwest::Client,
    webhook_url: String,
}

impl DiscordWebhookPublisher {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(settings.require_discord_webhook_url()?)
    }

    pub fn new(webhook_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("failed to build discord http client")?;

        Ok(Self {
            http,
            webhook_url: webhook_url.to_string(),
        })
    }

    async fn send(&self, message: &str, image: Option<&ImageAttachment>) -> Result<reqwest::Response> {
        // wait=true makes Discord return the created message (and its id).
        let req = self.http.post(&self.webhook_url).query(&[("wait", "true")]);

        let req = match image {
            Some(image) => {
                let part = Part::bytes(image.data.clone())
                    .file_name(format!("image.{}", image.extension()))
                    .mime_str(&image.mime_type)
                    .with_context(|| format!("invalid image mime type {}", image.mime_type))?;
                req.multipart(Form::new().text("content", message.to_string()).part("file", part))
            }
            None => req.json(&json!({ "content": message })),
        };

        req.send().await.context("discord webhook request failed")
    }
}

#[async_trait::async_trait]
impl Publisher for DiscordWebhookPublisher {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn publish(&self, message: &str, image: Option<&ImageAttachment>) -> PublishResult {
        let res = match self.send(message, image).await {
            Ok(res) => res,
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "failed to publish to discord");
                return PublishResult::failed(format!("{err:#}"));
            }
        };

        let status = res.status();
        if !status.is_success() {
            tracing::error!(http_status = %status, "discord webhook returned error");
            return PublishResult::failed(format!("HTTP {}", status.as_u16()));
        }

        let message_id = match res.json::<Value>().await {
            Ok(body) => match body.get("id") {
                Some(Value::String(id)) => Some(id.clone()),
                Some(Value::Number(id)) => Some(id.to_string()),
                _ => None,
            },
            Err(err) => {
                tracing::warn!(error = %err, "discord response body was not JSON");
                None
            }
        };

        tracing::info!(message_id = ?message_id, "published to discord");
        PublishResult::with_message_id(message_id)
    }

    async fn health_check(&self) -> bool {
        match self.http.get(&self.webhook_url).send().await {
            Ok(res) => res.status() == reqwest::StatusCode::OK,
            Err(err) => {
                tracing::warn!(error = %err, "discord health check failed");
                false
            }
        }
    }
}
