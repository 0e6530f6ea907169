use crate::config::Settings;
use crate::domain::MarketSnapshot;
use crate::ingest::error::ProviderError;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PATH: &str = "/v1/dividend_snapshot";

/// Source of per-ticker dividend, price and fundamental data.
///
/// Implementations make exactly one attempt per call; retry and pacing belong to the caller.
#[async_trait::async_trait]
pub trait MarketDataGateway: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch_snapshot(&self, ticker: &str) -> Result<MarketSnapshot>;
}

#[derive(Debug, Clone)]
pub struct HttpJsonMarketData {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    path: String,
    timeout: Duration,
}

impl HttpJsonMarketData {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_data_provider_base_url()?.to_string();
        let api_key = settings.data_provider_api_key.clone();

        let timeout_secs =
            crate::config::env_or("DATA_PROVIDER_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS);

        let path = std::env::var("DATA_PROVIDER_SNAPSHOT_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let timeout = Duration::from_secs(timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build data provider http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            path,
            timeout,
        })
    }

    fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
        }
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl MarketDataGateway for HttpJsonMarketData {
    fn provider_name(&self) -> &'static str {
        "external_http_json"
    }

    async fn fetch_snapshot(&self, ticker: &str) -> Result<MarketSnapshot> {
        let url = self.url();
        let headers = self.headers()?;

        let res = self
            .http
            .get(url)
            .headers(headers)
            .query(&[("ticker", ticker)])
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        let status = res.status();
        let retry_after = res
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = res.text().await.map_err(|e| request_error(e, self.timeout))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            }
            .into());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                ticker: ticker.to_string(),
            }
            .into());
        }
        if !status.is_success() {
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                body: text,
            }
            .into());
        }

        let snapshot = parse_snapshot(&text)?;
        validate(&snapshot, ticker)?;
        Ok(snapshot)
    }
}

fn request_error(err: reqwest::Error, timeout: Duration) -> anyhow::Error {
    if err.is_timeout() {
        ProviderError::Timeout(timeout).into()
    } else {
        ProviderError::Network(err.to_string()).into()
    }
}

fn parse_snapshot(text: &str) -> std::result::Result<MarketSnapshot, ProviderError> {
    serde_json::from_str::<MarketSnapshot>(text)
        .map_err(|e| ProviderError::ResponseFormat(format!("failed to parse snapshot: {e}")))
}

fn validate(snapshot: &MarketSnapshot, expected: &str) -> Result<()> {
    anyhow::ensure!(
        snapshot.ticker.trim().eq_ignore_ascii_case(expected.trim()),
        ProviderError::ResponseFormat(format!(
            "provider ticker mismatch: expected {expected}, got {}",
            snapshot.ticker
        ))
    );
    Ok(())
}
