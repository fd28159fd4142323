use crate::config::Settings;
use crate::format::super_signal::apply_formatters;
use crate::publish::bluesky::BlueskyPublisher;
use crate::publish::discord::DiscordWebhookPublisher;
use crate::publish::{ImageAttachment, PublishResult, Publisher};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The set of configured publishers, owned by whoever serves publish requests.
#[derive(Default, Clone)]
pub struct PublisherRegistry {
    publishers: BTreeMap<&'static str, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        if settings.bluesky_configured() {
            registry.register(Arc::new(BlueskyPublisher::from_settings(settings)?));
            tracing::info!("bluesky publisher initialized");
        }
        if settings.discord_configured() {
            registry.register(Arc::new(DiscordWebhookPublisher::from_settings(settings)?));
            tracing::info!("discord publisher initialized");
        }
        Ok(registry)
    }

    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(publisher.name(), publisher);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.publishers.keys().copied().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    /// Formats `message` for its metadata and publishes it to every requested target
    /// concurrently. Unknown targets are ignored; `None` means all configured ones.
    /// An empty map means nothing was attempted.
    pub async fn publish(
        &self,
        message: &str,
        image: Option<&ImageAttachment>,
        targets: Option<&[String]>,
        metadata: Option<&Value>,
    ) -> BTreeMap<String, PublishResult> {
        let formatted = apply_formatters(message, metadata);

        let selected: Vec<Arc<dyn Publisher>> = match targets {
            Some(targets) if !targets.is_empty() => self
                .publishers
                .iter()
                .filter(|(name, _)| targets.iter().any(|t| t == *name))
                .map(|(_, p)| p.clone())
                .collect(),
            _ => self.publishers.values().cloned().collect(),
        };

        let formatted = formatted.as_str();
        let results = futures::future::join_all(selected.iter().map(|p| async move {
            (p.name().to_string(), p.publish(formatted, image).await)
        }))
        .await;

        results.into_iter().collect()
    }

    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let mut out = BTreeMap::new();
        for (name, publisher) in &self.publishers {
            out.insert(name.to_string(), publisher.health_check().await);
        }
        out
    }

    pub async fn close(&self) {
        for publisher in self.publishers.values() {
            publisher.close().await;
        }
    }
}
