pub mod domain;
pub mod ingest;
pub mod lifecycle;
pub mod regime;
pub mod scan;
pub mod storage;
pub mod time;

pub mod config {
    use anyhow::Context;

    pub const DEFAULT_REGIME_VERSION: &str = "v1";

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub market_data_base_url: Option<String>,
        pub market_data_api_key: Option<String>,
        pub indicator_provider_base_url: Option<String>,
        pub scan_config_path: Option<String>,
        pub regime_version: String,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            let regime_version = std::env::var("REGIME_VERSION")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_REGIME_VERSION.to_string());

            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                market_data_base_url: std::env::var("MARKET_DATA_BASE_URL").ok(),
                market_data_api_key: std::env::var("MARKET_DATA_API_KEY").ok(),
                indicator_provider_base_url: std::env::var("INDICATOR_PROVIDER_BASE_URL").ok(),
                scan_config_path: std::env::var("SCAN_CONFIG_PATH")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                regime_version,
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_market_data_base_url(&self) -> anyhow::Result<&str> {
            self.market_data_base_url
                .as_deref()
                .context("MARKET_DATA_BASE_URL is required")
        }

        pub fn require_indicator_provider_base_url(&self) -> anyhow::Result<&str> {
            self.indicator_provider_base_url
                .as_deref()
                .context("INDICATOR_PROVIDER_BASE_URL is required")
        }
    }

    /// Parse an environment variable, falling back to `default` when unset or unparsable.
    pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<T>().ok())
            .unwrap_or(default)
    }
}
