pub mod domain;
pub mod format;
pub mod ingest;
pub mod publish;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
mod test_support;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod config {
    use anyhow::Context;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    const DEFAULT_HOST: &str = "0.0.0.0";
    const DEFAULT_PORT: u16 = 8080;
    const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
    const DEFAULT_BLUESKY_SERVICE_URL: &str = "https://bsky.social";
    const DEFAULT_LEDGER_FILE: &str = "falcon_recommendations.db";
    const DEFAULT_MIN_RELATIVE_VOLUME: f64 = 2.0;
    const DEFAULT_MIN_VOLUME: u64 = 1_000_000;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub host: String,
        pub port: u16,
        pub debug: bool,
        pub bluesky_handle: Option<String>,
        pub bluesky_app_password: Option<String>,
        pub bluesky_service_url: String,
        pub discord_webhook_url: Option<String>,
        pub endpoint_url: Option<String>,
        pub poll_interval_secs: u64,
        pub verify_ssl: bool,
        pub ledger_path: Option<PathBuf>,
        pub min_relative_volume: f64,
        pub min_volume: u64,
        pub recommendations_enabled: bool,
        pub sentry_dsn: Option<String>,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
                debug: false,
                bluesky_handle: None,
                bluesky_app_password: None,
                bluesky_service_url: DEFAULT_BLUESKY_SERVICE_URL.to_string(),
                discord_webhook_url: None,
                endpoint_url: None,
                poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
                verify_ssl: false,
                ledger_path: None,
                min_relative_volume: DEFAULT_MIN_RELATIVE_VOLUME,
                min_volume: DEFAULT_MIN_VOLUME,
                recommendations_enabled: false,
                sentry_dsn: None,
            }
        }
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            let defaults = Self::default();
            Ok(Self {
                host: non_empty_var("FALCON_HOST").unwrap_or(defaults.host),
                port: parsed_var("FALCON_PORT")?.unwrap_or(defaults.port),
                debug: flag_var("FALCON_DEBUG"),
                bluesky_handle: non_empty_var("FALCON_BLUESKY_HANDLE"),
                bluesky_app_password: non_empty_var("FALCON_BLUESKY_APP_PASSWORD"),
                bluesky_service_url: non_empty_var("FALCON_BLUESKY_SERVICE_URL")
                    .unwrap_or(defaults.bluesky_service_url),
                discord_webhook_url: non_empty_var("FALCON_DISCORD_WEBHOOK_URL"),
                endpoint_url: non_empty_var("FALCON_ENDPOINT_URL"),
                poll_interval_secs: parsed_var("FALCON_POLL_INTERVAL")?
                    .unwrap_or(defaults.poll_interval_secs),
                verify_ssl: flag_var("FALCON_VERIFY_SSL"),
                ledger_path: non_empty_var("FALCON_LEDGER_PATH").map(PathBuf::from),
                min_relative_volume: parsed_var("FALCON_MIN_RVOL")?
                    .unwrap_or(defaults.min_relative_volume),
                min_volume: parsed_var("FALCON_MIN_VOLUME")?.unwrap_or(defaults.min_volume),
                recommendations_enabled: flag_var("FALCON_RECOMMENDATIONS_ENABLED"),
                sentry_dsn: non_empty_var("SENTRY_DSN"),
            })
        }

        pub fn require_endpoint_url(&self) -> anyhow::Result<&str> {
            self.endpoint_url
                .as_deref()
                .context("FALCON_ENDPOINT_URL is required")
        }

        pub fn require_discord_webhook_url(&self) -> anyhow::Result<&str> {
            self.discord_webhook_url
                .as_deref()
                .context("FALCON_DISCORD_WEBHOOK_URL is required")
        }

        pub fn bluesky_configured(&self) -> bool {
            self.bluesky_handle.is_some() && self.bluesky_app_password.is_some()
        }

        pub fn discord_configured(&self) -> bool {
            self.discord_webhook_url.is_some()
        }

        pub fn endpoint_configured(&self) -> bool {
            self.endpoint_url.is_some()
        }

        /// Ledger file location; defaults to a well-known file in the OS temp dir.
        pub fn ledger_path(&self) -> PathBuf {
            self.ledger_path
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_LEDGER_FILE))
        }

        pub fn configured_targets(&self) -> Vec<&'static str> {
            let mut out = Vec::new();
            if self.bluesky_configured() {
                out.push("bluesky");
            }
            if self.discord_configured() {
                out.push("discord");
            }
            out
        }

        pub fn check_configuration(&self) -> BTreeMap<&'static str, bool> {
            BTreeMap::from([
                ("bluesky", self.bluesky_configured()),
                ("discord", self.discord_configured()),
                ("falcon_endpoint", self.endpoint_configured()),
            ])
        }
    }

    fn non_empty_var(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn flag_var(key: &str) -> bool {
        non_empty_var(key)
            .map(|s| parse_flag(&s))
            .unwrap_or(false)
    }

    fn parsed_var<T>(key: &str) -> anyhow::Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        non_empty_var(key)
            .map(|s| {
                s.parse::<T>()
                    .with_context(|| format!("{key} has an invalid value: {s}"))
            })
            .transpose()
    }

    fn parse_flag(s: &str) -> bool {
        matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn flags_accept_common_truthy_spellings() {
            assert!(parse_flag("true"));
            assert!(parse_flag("YES"));
            assert!(parse_flag(" 1 "));
            assert!(!parse_flag("false"));
            assert!(!parse_flag("on"));
        }

        #[test]
        fn configured_targets_follow_credentials() {
            let mut settings = Settings::default();
            assert!(settings.configured_targets().is_empty());

            settings.discord_webhook_url = Some("https://discord.test/hook".to_string());
            assert_eq!(settings.configured_targets(), vec!["discord"]);

            // Handle alone is not enough for Bluesky.
            settings.bluesky_handle = Some("falcon.bsky.social".to_string());
            assert_eq!(settings.configured_targets(), vec!["discord"]);

            settings.bluesky_app_password = Some("secret".to_string());
            assert_eq!(settings.configured_targets(), vec!["bluesky", "discord"]);

            let status = settings.check_configuration();
            assert_eq!(status.get("falcon_endpoint"), Some(&false));
        }

        #[test]
        fn missing_endpoint_is_a_configuration_error() {
            let settings = Settings::default();
            let err = settings.require_endpoint_url().unwrap_err();
            assert!(err.to_string().contains("FALCON_ENDPOINT_URL"));
        }

        #[test]
        fn ledger_path_defaults_to_temp_dir() {
            let settings = Settings::default();
            assert_eq!(
                settings.ledger_path(),
                std::env::temp_dir().join("falcon_recommendations.db")
            );
        }
    }
}
