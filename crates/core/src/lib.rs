pub mod calculator;
pub mod domain;
pub mod ingest;
pub mod refresh;
pub mod screening;
pub mod storage;
pub mod universe;

pub mod config {
    use anyhow::Context;

    #[derive(Debug, Clone, Default)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub data_provider_base_url: Option<String>,
        pub data_provider_api_key: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                data_provider_base_url: std::env::var("DATA_PROVIDER_BASE_URL").ok(),
                data_provider_api_key: std::env::var("DATA_PROVIDER_API_KEY").ok(),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_data_provider_base_url(&self) -> anyhow::Result<&str> {
            self.data_provider_base_url
                .as_deref()
                .context("DATA_PROVIDER_BASE_URL is required")
        }
    }

    /// Reads an env var and parses it, falling back to `default` when unset or malformed.
    pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<T>().ok())
            .unwrap_or(default)
    }
}
