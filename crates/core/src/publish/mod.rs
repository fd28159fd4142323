pub mod bluesky;
pub mod discord;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_IMAGE_MIME: &str = "image/png";

/// Binary image attached to a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl ImageAttachment {
    pub fn new(data: Vec<u8>, mime_type: Option<&str>) -> Self {
        let mime_type = mime_type
            .map(|m| m.split(';').next().unwrap_or(m).trim())
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_IMAGE_MIME)
            .to_string();
        Self { data, mime_type }
    }

    /// MIME type guessed from a file extension, defaulting to PNG.
    pub fn mime_for_path(path: &Path) -> &'static str {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            _ => DEFAULT_IMAGE_MIME,
        }
    }

    pub fn extension(&self) -> &str {
        self.mime_type.rsplit('/').next().unwrap_or("png")
    }
}

/// Outcome of a single delivery attempt. Delivery failures are values, not errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub success: bool,
    pub post_uri: Option<String>,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl PublishResult {
    pub fn with_post_uri(uri: impl Into<String>) -> Self {
        Self {
            success: true,
            post_uri: Some(uri.into()),
            ..Default::default()
        }
    }

    pub fn with_message_id(id: Option<String>) -> Self {
        Self {
            success: true,
            message_id: id,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, message: &str, image: Option<&ImageAttachment>) -> PublishResult;

    async fn health_check(&self) -> bool;

    async fn close(&self) {}
}
