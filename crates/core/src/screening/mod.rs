//! Dividend-growth screening over the metrics cache with a live fallback.

use crate::domain::{rank_order, DividendMetrics, ScreeningCriteria};
use crate::refresh::{EntityOutcome, EntityPipeline};
use crate::universe::UniverseProvider;
use anyhow::Context;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// One ticker that passed the screen.
#[derive(Debug, Clone, Serialize)]
pub struct ScreeningHit {
    pub metrics: DividendMetrics,
    /// CAGR over the requested horizon.
    pub cagr: f64,
    /// Whether the row came from the cache or was computed for this request.
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreeningFailure {
    pub ticker: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreeningOutcome {
    pub results: Vec<ScreeningHit>,
    pub universe_size: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub failures: Vec<ScreeningFailure>,
}

pub struct ScreeningEngine {
    pipeline: Arc<EntityPipeline>,
    universe: Arc<dyn UniverseProvider>,
    concurrency: usize,
}

impl ScreeningEngine {
    pub fn new(pipeline: Arc<EntityPipeline>, universe: Arc<dyn UniverseProvider>) -> Self {
        Self {
            pipeline,
            universe,
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, crate::refresh::orchestrator::MAX_CONCURRENCY);
        self
    }

    pub async fn screen(&self, criteria: &ScreeningCriteria) -> anyhow::Result<ScreeningOutcome> {
        criteria.validate()?;

        let universe = self.resolve_universe(criteria).await?;

        // Rows for horizons the cache does not carry are useless; treat everything as a miss.
        let cached: Vec<DividendMetrics> = if criteria.use_cache && criteria.horizon_is_cached() {
            self.pipeline
                .cache()
                .get(Some(universe.as_slice()), 0, criteria.max_cache_age_hours)
                .await
                .context("read metrics cache failed")?
        } else {
            Vec::new()
        };

        let hit_tickers: HashSet<&str> = cached.iter().map(|m| m.ticker.as_str()).collect();
        let misses: Vec<String> = universe
            .iter()
            .filter(|t| !hit_tickers.contains(t.as_str()))
            .cloned()
            .collect();

        tracing::info!(
            universe = universe.len(),
            cache_hits = cached.len(),
            cache_misses = misses.len(),
            years = criteria.years,
            use_cache = criteria.use_cache,
            "screening started"
        );

        let mut results: Vec<ScreeningHit> = cached
            .iter()
            .filter_map(|m| {
                let cagr = m.cagr_for_horizon(criteria.years);
                passes(m, cagr, criteria).map(|cagr| ScreeningHit {
                    metrics: m.clone(),
                    cagr,
                    from_cache: true,
                })
            })
            .collect();

        let pipeline = &self.pipeline;
        let outcomes: Vec<EntityOutcome> = futures::stream::iter(misses.iter().cloned())
            .map(|ticker| async move { pipeline.process(&ticker).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut failures = Vec::new();
        for outcome in outcomes {
            // A failed write still leaves a usable computation; only fetch failures are reported.
            let Some(analysis) = outcome.analysis else {
                failures.push(ScreeningFailure {
                    error: outcome
                        .error
                        .unwrap_or_else(|| "metrics not computed".to_string()),
                    ticker: outcome.ticker,
                });
                continue;
            };
            let cagr = analysis.cagr_for_horizon(criteria.years);
            let metrics = analysis.metrics;
            if let Some(cagr) = passes(&metrics, cagr, criteria) {
                results.push(ScreeningHit {
                    metrics,
                    cagr,
                    from_cache: false,
                });
            }
        }

        results.sort_by(|a, b| {
            rank_order(
                (a.metrics.consecutive_years_or_zero(), Some(a.cagr), &a.metrics.ticker),
                (b.metrics.consecutive_years_or_zero(), Some(b.cagr), &b.metrics.ticker),
            )
        });
        failures.sort_by(|a, b| a.ticker.cmp(&b.ticker));

        tracing::info!(
            results = results.len(),
            failures = failures.len(),
            "screening finished"
        );

        Ok(ScreeningOutcome {
            results,
            universe_size: universe.len(),
            cache_hits: cached.len(),
            cache_misses: misses.len(),
            failures,
        })
    }

    async fn resolve_universe(&self, criteria: &ScreeningCriteria) -> anyhow::Result<Vec<String>> {
        let raw = match &criteria.tickers {
            Some(t) => t.clone(),
            None => self.universe.tickers().await.context("load universe failed")?,
        };

        let mut seen = HashSet::new();
        Ok(raw
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect())
    }
}

/// Applies the screen and returns the horizon CAGR when the row passes.
///
/// CAGR is required; an unavailable payout ratio does not exclude a row.
fn passes(m: &DividendMetrics, cagr: Option<f64>, criteria: &ScreeningCriteria) -> Option<f64> {
    if m.consecutive_years_or_zero() < criteria.min_consecutive_years {
        return None;
    }
    let cagr = cagr.filter(|c| *c >= criteria.min_cagr)?;
    if m.payout_ratio.is_some_and(|p| p > criteria.max_payout_ratio) {
        return None;
    }
    Some(cagr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::DividendMetricsCalculator;
    use crate::refresh::pipeline::testing::*;
    use crate::refresh::{BatchRefreshOrchestrator, RefreshMode, RefreshOptions};
    use crate::storage::{MemoryMetricsCache, MemoryRunLedger, MetricsCache};
    use crate::universe::StaticUniverse;
    use tokio_util::sync::CancellationToken;

    const UNIVERSE: [&str; 5] = ["8058.T", "2914.T", "9432.T", "4502.T", "0000.T"];

    fn snapshots() -> Vec<crate::domain::MarketSnapshot> {
        let mut flat = growing_snapshot("4502.T", 180.0, 0.0);
        flat.fundamentals.trailing_eps = Some(50.0);
        vec![
            growing_snapshot("8058.T", 10.0, 1.0),
            growing_snapshot("2914.T", 30.0, 3.0),
            growing_snapshot("9432.T", 2.0, 0.2),
            flat,
        ]
    }

    struct Setup {
        cache: Arc<MemoryMetricsCache>,
        gateway: Arc<FakeGateway>,
        pipeline: Arc<EntityPipeline>,
        engine: ScreeningEngine,
    }

    fn setup() -> Setup {
        let cache = Arc::new(MemoryMetricsCache::new());
        let gateway = Arc::new(FakeGateway::with_snapshots(snapshots()));
        let pipeline = Arc::new(EntityPipeline::new(
            gateway.clone(),
            cache.clone(),
            DividendMetricsCalculator::default(),
            fast_backoff(),
            fast_options(),
        ));
        let engine =
            ScreeningEngine::new(pipeline.clone(), Arc::new(StaticUniverse::new(UNIVERSE)));
        Setup {
            cache,
            gateway,
            pipeline,
            engine,
        }
    }

    fn tickers(outcome: &ScreeningOutcome) -> Vec<String> {
        outcome.results.iter().map(|h| h.metrics.ticker.clone()).collect()
    }

    #[tokio::test]
    async fn cold_cache_computes_and_writes_through() {
        let s = setup();
        let out = s.engine.screen(&ScreeningCriteria::default()).await.unwrap();

        assert_eq!(out.cache_hits, 0);
        assert_eq!(out.cache_misses, 5);
        // Flat dividends fail the CAGR screen, the unknown ticker is reported as a failure.
        assert_eq!(tickers(&out), vec!["2914.T", "8058.T", "9432.T"]);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].ticker, "0000.T");
        assert!(out.results.iter().all(|h| !h.from_cache));
        assert_eq!(s.cache.len().await, 5);
    }

    #[tokio::test]
    async fn warm_cache_serves_hits_without_provider_calls() {
        let s = setup();
        s.engine.screen(&ScreeningCriteria::default()).await.unwrap();
        let calls_after_first = s.gateway.call_count();

        let out = s.engine.screen(&ScreeningCriteria::default()).await.unwrap();
        assert_eq!(out.cache_hits, 5);
        assert_eq!(out.cache_misses, 0);
        assert_eq!(s.gateway.call_count(), calls_after_first);
        assert!(out.results.iter().all(|h| h.from_cache));
    }

    #[tokio::test]
    async fn bypass_cache_matches_cached_order() {
        let s = setup();
        let orchestrator = BatchRefreshOrchestrator::new(
            s.pipeline.clone(),
            Arc::new(StaticUniverse::new(UNIVERSE)),
            Arc::new(MemoryRunLedger::new()),
            RefreshOptions::default(),
        );
        orchestrator.run(RefreshMode::Full, CancellationToken::new()).await.unwrap();

        let cached = s.engine.screen(&ScreeningCriteria::default()).await.unwrap();
        let live = s
            .engine
            .screen(&ScreeningCriteria {
                use_cache: false,
                ..ScreeningCriteria::default()
            })
            .await
            .unwrap();

        assert_eq!(cached.cache_misses, 0);
        assert_eq!(live.cache_hits, 0);
        assert_eq!(tickers(&cached), tickers(&live));
    }

    #[tokio::test]
    async fn stale_rows_are_recomputed() {
        let s = setup();
        s.engine.screen(&ScreeningCriteria::default()).await.unwrap();
        s.cache.backdate("8058.T", 48).await;

        let out = s.engine.screen(&ScreeningCriteria::default()).await.unwrap();
        assert_eq!(out.cache_misses, 1);
        assert!(out
            .results
            .iter()
            .any(|h| h.metrics.ticker == "8058.T" && !h.from_cache));
    }

    #[tokio::test]
    async fn uncached_horizon_goes_live() {
        let s = setup();
        s.engine.screen(&ScreeningCriteria::default()).await.unwrap();

        let out = s
            .engine
            .screen(&ScreeningCriteria {
                years: 3,
                tickers: Some(vec!["8058.T".into(), " 8058.T".into()]),
                ..ScreeningCriteria::default()
            })
            .await
            .unwrap();

        assert_eq!(out.universe_size, 1);
        assert_eq!(out.cache_hits, 0);
        assert_eq!(tickers(&out), vec!["8058.T"]);
        let expected = ((20.0_f64 / 18.0).powf(0.5) - 1.0) * 100.0;
        assert!((out.results[0].cagr - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn payout_ceiling_and_missing_payout() {
        let s = setup();
        let mut row = crate::domain::DividendMetrics::empty("7203.T");
        row.consecutive_increase_years = Some(6);
        row.dividend_cagr_5y = Some(8.0);
        row.payout_ratio = None;
        s.cache.upsert("7203.T", &row).await.unwrap();

        let mut high = row.clone();
        high.ticker = "6758.T".into();
        high.payout_ratio = Some(95.0);
        s.cache.upsert("6758.T", &high).await.unwrap();

        let out = s
            .engine
            .screen(&ScreeningCriteria {
                tickers: Some(vec!["7203.T".into(), "6758.T".into()]),
                ..ScreeningCriteria::default()
            })
            .await
            .unwrap();

        assert_eq!(tickers(&out), vec!["7203.T"]);
        assert_eq!(s.gateway.call_count(), 0);
    }

    #[test]
    fn passes_requires_cagr() {
        let mut m = crate::domain::DividendMetrics::empty("X");
        m.consecutive_increase_years = Some(10);
        let c = ScreeningCriteria::default();
        assert_eq!(passes(&m, None, &c), None);
        assert_eq!(passes(&m, Some(2.9), &c), None);
        assert_eq!(passes(&m, Some(3.0), &c), Some(3.0));
        m.consecutive_increase_years = Some(4);
        assert_eq!(passes(&m, Some(9.0), &c), None);
    }
}
