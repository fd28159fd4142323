use crate::config::Settings;
use crate::publish::{ImageAttachment, PublishResult, Publisher};
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Posts to Bluesky through the AT Protocol XRPC endpoints of a PDS.
#[derive(Debug)]
pub struct BlueskyPublisher {
    http: reqwest::Client,
    service_url: String,
    handle: String,
    app_password: String,

    // One session per publisher lifetime; dropped on failure so the next call re-authenticates.
    session: tokio::sync::Mutex<Option<Session>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    did: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateRecordResponse {
    uri: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadBlobResponse {
    blob: Value,
}

impl BlueskyPublisher {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let handle = settings
            .bluesky_handle
            .as_deref()
            .context("FALCON_BLUESKY_HANDLE is required")?;
        let app_password = settings
            .bluesky_app_password
            .as_deref()
            .context("FALCON_BLUESKY_APP_PASSWORD is required")?;
        Self::new(&settings.bluesky_service_url, handle, app_password)
    }

    pub fn new(service_url: &str, handle: &str, app_password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("failed to build bluesky http client")?;

        Ok(Self {
            http,
            service_url: service_url.trim_end_matches('/').to_string(),
            handle: handle.to_string(),
            app_password: app_password.to_string(),
            session: tokio::sync::Mutex::new(None),
        })
    }

    fn xrpc_url(&self, method: &str) -> String {
        format!("{}/xrpc/{method}", self.service_url)
    }

    async fn session(&self) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        let res = self
            .http
            .post(self.xrpc_url("com.atproto.server.createSession"))
            .json(&json!({
                "identifier": self.handle,
                "password": self.app_password,
            }))
            .send()
            .await
            .context("bluesky createSession request failed")?;

        let session: Session = read_json(res, "createSession").await?;
        tracing::info!(handle = %self.handle, "authenticated with bluesky");
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn upload_blob(&self, session: &Session, image: &ImageAttachment) -> Result<Value> {
        let res = self
            .http
            .post(self.xrpc_url("com.atproto.repo.uploadBlob"))
            .bearer_auth(&session.access_jwt)
            .header(CONTENT_TYPE, &image.mime_type)
            .body(image.data.clone())
            .send()
            .await
            .context("bluesky uploadBlob request failed")?;

        let uploaded: UploadBlobResponse = read_json(res, "uploadBlob").await?;
        Ok(uploaded.blob)
    }

    async fn create_post(&self, message: &str, image: Option<&ImageAttachment>) -> Result<String> {
        let session = self.session().await?;

        let mut record = json!({
            "$type": POST_COLLECTION,
            "text": message,
            "createdAt": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        if let Some(image) = image {
            let blob = self.upload_blob(&session, image).await?;
            record["embed"] = json!({
                "$type": "app.bsky.embed.images",
                "images": [{"alt": "", "image": blob}],
            });
        }

        let res = self
            .http
            .post(self.xrpc_url("com.atproto.repo.createRecord"))
            .bearer_auth(&session.access_jwt)
            .json(&json!({
                "repo": session.did,
                "collection": POST_COLLECTION,
                "record": record,
            }))
            .send()
            .await
            .context("bluesky createRecord request failed")?;

        let created: CreateRecordResponse = read_json(res, "createRecord").await?;
        Ok(created.uri)
    }
}

#[async_trait::async_trait]
impl Publisher for BlueskyPublisher {
    fn name(&self) -> &'static str {
        "bluesky"
    }

    async fn publish(&self, message: &str, image: Option<&ImageAttachment>) -> PublishResult {
        match self.create_post(message, image).await {
            Ok(uri) => {
                tracing::info!(%uri, "published to bluesky");
                PublishResult::with_post_uri(uri)
            }
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "failed to publish to bluesky");
                *self.session.lock().await = None;
                PublishResult::failed(format!("{err:#}"))
            }
        }
    }

    async fn health_check(&self) -> bool {
        let check = async {
            let session = self.session().await?;
            let res = self
                .http
                .get(self.xrpc_url("app.bsky.actor.getProfile"))
                .bearer_auth(&session.access_jwt)
                .query(&[("actor", self.handle.as_str())])
                .send()
                .await
                .context("bluesky getProfile request failed")?;
            read_json::<Value>(res, "getProfile").await
        };

        match check.await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "bluesky health check failed");
                false
            }
        }
    }

    async fn close(&self) {
        *self.session.lock().await = None;
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    res: reqwest::Response,
    method: &str,
) -> Result<T> {
    let status = res.status();
    let text = res
        .text()
        .await
        .with_context(|| format!("failed to read bluesky {method} response"))?;
    if !status.is_success() {
        anyhow::bail!("bluesky {method} HTTP {status}: {text}");
    }
    serde_json::from_str::<T>(&text)
        .with_context(|| format!("failed to parse bluesky {method} response: {text}"))
}
