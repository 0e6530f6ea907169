use crate::calculator::{DividendAnalysis, DividendMetricsCalculator};
use crate::config::env_or;
use crate::domain::{DataQuality, DividendMetrics, MarketSnapshot};
use crate::ingest::{MarketDataGateway, ProviderError};
use crate::refresh::backoff::BackoffPolicy;
use crate::refresh::pacer::Pacer;
use crate::storage::MetricsCache;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Where a ticker is in the refresh pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityState {
    Pending,
    Fetching { attempt: u32 },
    Computing,
    Persisted {
        quality: DataQuality,
        error: Option<String>,
    },
    /// The row could not be written. Counted at run level.
    PersistFailed { error: String },
    Cancelled,
}

impl EntityState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Persisted { .. } | Self::PersistFailed { .. } | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct EntityOutcome {
    pub ticker: String,
    pub state: EntityState,
    pub attempts: u32,
    /// The record that was (or was meant to be) written.
    pub metrics: Option<DividendMetrics>,
    /// Present when the calculator ran.
    pub analysis: Option<DividendAnalysis>,
    /// Fetch or persistence error, if any.
    pub error: Option<String>,
}

impl EntityOutcome {
    pub fn cancelled(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            state: EntityState::Cancelled,
            attempts: 0,
            metrics: None,
            analysis: None,
            error: None,
        }
    }

    /// Computed and written without a fetch error.
    pub fn is_success(&self) -> bool {
        matches!(self.state, EntityState::Persisted { error: None, .. })
    }

    /// Fetch failed; a failure record was written in its place.
    pub fn is_recorded_failure(&self) -> bool {
        matches!(self.state, EntityState::Persisted { error: Some(_), .. })
    }

    pub fn is_persist_failure(&self) -> bool {
        matches!(self.state, EntityState::PersistFailed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Minimum gap between provider calls, shared by all workers.
    pub delay: Duration,
    /// Upper bound on a single provider call.
    pub fetch_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(2_000),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            delay: Duration::from_millis(env_or("REFRESH_DELAY_MS", d.delay.as_millis() as u64)),
            fetch_timeout: Duration::from_secs(env_or(
                "REFRESH_FETCH_TIMEOUT_SECS",
                d.fetch_timeout.as_secs(),
            )),
        }
    }
}

/// fetch -> calculate -> upsert for one ticker. Never returns an error to the caller: every
/// failure ends up either as a failure record in the cache or as `PersistFailed`.
pub struct EntityPipeline {
    gateway: Arc<dyn MarketDataGateway>,
    cache: Arc<dyn MetricsCache>,
    calculator: DividendMetricsCalculator,
    backoff: BackoffPolicy,
    pacer: Pacer,
    fetch_timeout: Duration,
}

impl EntityPipeline {
    pub fn new(
        gateway: Arc<dyn MarketDataGateway>,
        cache: Arc<dyn MetricsCache>,
        calculator: DividendMetricsCalculator,
        backoff: BackoffPolicy,
        opts: PipelineOptions,
    ) -> Self {
        Self {
            gateway,
            cache,
            calculator,
            backoff,
            pacer: Pacer::new(opts.delay),
            fetch_timeout: opts.fetch_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<dyn MetricsCache> {
        &self.cache
    }

    pub fn provider_name(&self) -> &'static str {
        self.gateway.provider_name()
    }

    pub async fn process(&self, ticker: &str) -> EntityOutcome {
        let ticker = ticker.trim();
        let mut outcome = EntityOutcome {
            ticker: ticker.to_string(),
            state: EntityState::Pending,
            attempts: 0,
            metrics: None,
            analysis: None,
            error: None,
        };

        let (fetched, attempts) = self.fetch(ticker, &mut outcome).await;
        outcome.attempts = attempts;

        let metrics = match fetched {
            Ok(snapshot) => {
                transition(&mut outcome, EntityState::Computing);
                let mut analysis = self.calculator.compute(&snapshot, Utc::now().date_naive());
                analysis.metrics.ticker = ticker.to_string();
                let metrics = analysis.metrics.clone();
                outcome.analysis = Some(analysis);
                metrics
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(
                    ticker,
                    attempts,
                    error = %message,
                    "fetch failed; writing failure record"
                );
                outcome.error = Some(message.clone());
                DividendMetrics::failed(ticker, &message)
            }
        };

        match self.cache.upsert(ticker, &metrics).await {
            Ok(()) => {
                let state = EntityState::Persisted {
                    quality: metrics.data_quality,
                    error: outcome.error.clone(),
                };
                transition(&mut outcome, state);
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(ticker, error = %message, "metrics upsert failed");
                outcome.error = Some(message.clone());
                transition(&mut outcome, EntityState::PersistFailed { error: message });
            }
        }

        outcome.metrics = Some(metrics);
        outcome
    }

    async fn fetch(
        &self,
        ticker: &str,
        outcome: &mut EntityOutcome,
    ) -> (anyhow::Result<MarketSnapshot>, u32) {
        let timeout = self.fetch_timeout;
        let gateway = &self.gateway;
        self.backoff
            .run(&self.pacer, ticker, |attempt| {
                transition(outcome, EntityState::Fetching { attempt });
                async move {
                    match tokio::time::timeout(timeout, gateway.fetch_snapshot(ticker)).await {
                        Ok(res) => res,
                        Err(_) => Err(ProviderError::Timeout(timeout).into()),
                    }
                }
            })
            .await
    }
}

fn transition(outcome: &mut EntityOutcome, next: EntityState) {
    tracing::debug!(ticker = %outcome.ticker, from = ?outcome.state, to = ?next, "entity state");
    outcome.state = next;
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::storage::MemoryMetricsCache;

    fn pipeline(gateway: FakeGateway, cache: Arc<MemoryMetricsCache>) -> EntityPipeline {
        EntityPipeline::new(
            Arc::new(gateway),
            cache,
            DividendMetricsCalculator::default(),
            fast_backoff(),
            fast_options(),
        )
    }

    #[tokio::test]
    async fn success_writes_computed_row() {
        let cache = Arc::new(MemoryMetricsCache::new());
        let p = pipeline(
            FakeGateway::with_snapshots(vec![growing_snapshot("8058.T", 10.0, 1.0)]),
            cache.clone(),
        );

        let out = p.process(" 8058.T ").await;
        assert!(out.is_success());
        assert_eq!(out.attempts, 1);
        assert!(out.state.is_terminal());

        let row = cache.latest("8058.T").await.unwrap().unwrap();
        assert_eq!(row.consecutive_increase_years, Some(10));
        assert_eq!(row.calculation_error, None);
    }

    #[tokio::test]
    async fn terminal_failure_writes_failure_record() {
        let cache = Arc::new(MemoryMetricsCache::new());
        let p = pipeline(FakeGateway::default(), cache.clone());

        let out = p.process("0000.T").await;
        assert!(out.is_recorded_failure());

        let row = cache.latest("0000.T").await.unwrap().unwrap();
        assert_eq!(row.data_quality, DataQuality::Incomplete);
        assert_eq!(row.company_name.as_deref(), Some("0000.T"));
        assert!(row.calculation_error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn rate_limit_recovers_on_final_attempt() {
        let cache = Arc::new(MemoryMetricsCache::new());
        let gateway = FakeGateway::with_snapshots(vec![growing_snapshot("9432.T", 3.0, 0.5)])
            .fail(
                "9432.T",
                vec![
                    ProviderError::RateLimited {
                        retry_after_secs: None,
                    },
                    ProviderError::RateLimited {
                        retry_after_secs: None,
                    },
                ],
            );
        let p = pipeline(gateway, cache.clone());

        let out = p.process("9432.T").await;
        assert!(out.is_success());
        // Two regular attempts plus the single long-wait attempt.
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn stalled_call_times_out_and_is_retried() {
        let cache = Arc::new(MemoryMetricsCache::new());
        let gateway = Arc::new(StalledGateway::default());
        let p = EntityPipeline::new(
            gateway.clone(),
            cache.clone(),
            DividendMetricsCalculator::default(),
            fast_backoff(),
            PipelineOptions {
                delay: Duration::ZERO,
                fetch_timeout: Duration::from_millis(20),
            },
        );

        let out = p.process("6758.T").await;
        assert!(out.is_recorded_failure());
        assert_eq!(out.attempts, 2);
        assert_eq!(*gateway.calls.lock().unwrap(), 2);

        let row = cache.latest("6758.T").await.unwrap().unwrap();
        assert_eq!(row.data_quality, DataQuality::Incomplete);
        assert!(row.calculation_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn rejected_write_ends_in_persist_failed() {
        let cache = Arc::new(RejectingCache::rejecting(&["8058.T"]));
        let p = EntityPipeline::new(
            Arc::new(FakeGateway::with_snapshots(vec![growing_snapshot("8058.T", 10.0, 1.0)])),
            cache.clone(),
            DividendMetricsCalculator::default(),
            fast_backoff(),
            fast_options(),
        );

        let out = p.process("8058.T").await;
        assert!(out.is_persist_failure());
        assert!(!out.is_success());
        assert!(out.analysis.is_some());
        assert!(matches!(
            &out.state,
            EntityState::PersistFailed { error } if error.contains("connection reset")
        ));
        assert!(cache.latest("8058.T").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_records_the_current_attempt() {
        let p = pipeline(FakeGateway::default(), Arc::new(MemoryMetricsCache::new()));
        let mut outcome = EntityOutcome::cancelled("0000.T");
        outcome.state = EntityState::Pending;

        let (res, attempts) = p.fetch("0000.T", &mut outcome).await;
        assert!(res.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(outcome.state, EntityState::Fetching { attempt: 1 });
    }
}
