use crate::config::env_or;
use crate::domain::DataQuality;
use crate::refresh::pipeline::{EntityOutcome, EntityPipeline, EntityState};
use crate::storage::{MetricsCache, RunLedger, RunStatus, RunSummary};
use crate::universe::UniverseProvider;
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const MAX_CONCURRENCY: usize = 3;
const MAX_REPORTED_ERRORS: usize = 20;
const MAX_ERROR_SUMMARY_LEN: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Whole universe.
    Full,
    /// Rows older than `max_age_hours` plus universe tickers with no row at all.
    Incremental { max_age_hours: i64 },
}

impl RefreshMode {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental { .. } => "incremental",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub limit: Option<usize>,
    pub concurrency: usize,
    /// Log progress every N processed tickers. 0 disables.
    pub progress_every: usize,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            limit: None,
            concurrency: 1,
            progress_every: 50,
        }
    }
}

impl RefreshOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            limit: None,
            concurrency: env_or("REFRESH_CONCURRENCY", d.concurrency),
            progress_every: env_or("REFRESH_PROGRESS_EVERY", d.progress_every),
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickerError {
    pub ticker: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub run_id: Option<Uuid>,
    pub kind: &'static str,
    pub status: RunStatus,
    pub planned: usize,
    pub processed: usize,
    pub succeeded: usize,
    /// Fetch failures, each written as a failure record.
    pub failed: usize,
    pub persist_failures: usize,
    pub cancelled: usize,
    pub by_quality: BTreeMap<DataQuality, usize>,
    /// First few per-ticker errors.
    pub errors: Vec<TickerError>,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RefreshReport {
    fn new(kind: &'static str, planned: usize) -> Self {
        Self {
            run_id: None,
            kind,
            status: RunStatus::Running,
            planned,
            processed: 0,
            succeeded: 0,
            failed: 0,
            persist_failures: 0,
            cancelled: 0,
            by_quality: BTreeMap::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
        }
    }

    fn record(&mut self, outcome: &EntityOutcome) {
        if matches!(outcome.state, EntityState::Cancelled) {
            self.cancelled += 1;
            return;
        }

        self.processed += 1;
        if outcome.is_success() {
            self.succeeded += 1;
        } else if outcome.is_recorded_failure() {
            self.failed += 1;
        } else if outcome.is_persist_failure() {
            self.persist_failures += 1;
        }

        if let Some(m) = outcome.metrics.as_ref().filter(|_| !outcome.is_persist_failure()) {
            *self.by_quality.entry(m.data_quality).or_default() += 1;
        }

        if let Some(error) = &outcome.error {
            if self.errors.len() < MAX_REPORTED_ERRORS {
                self.errors.push(TickerError {
                    ticker: outcome.ticker.clone(),
                    error: error.clone(),
                });
            }
        }
    }

    pub fn error_count(&self) -> usize {
        self.failed + self.persist_failures
    }

    fn finalize(&mut self) {
        self.status = if self.cancelled > 0 {
            RunStatus::Cancelled
        } else if self.error_count() == 0 {
            RunStatus::Success
        } else if self.succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };
    }

    pub fn error_summary(&self) -> Option<String> {
        if self.error_count() == 0 && self.cancelled == 0 {
            return None;
        }

        let mut out = format!("{} errors", self.error_count());
        if self.cancelled > 0 {
            out.push_str(&format!(", {} cancelled", self.cancelled));
        }
        for e in self.errors.iter().take(5) {
            out.push_str(&format!("; {}: {}", e.ticker, e.error));
        }
        Some(out.chars().take(MAX_ERROR_SUMMARY_LEN).collect())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            status: self.status,
            records_updated: self.succeeded as u64,
            failures: self.error_count() as u64,
            error_summary: self.error_summary(),
        }
    }
}

/// Keeps the metrics cache populated for a ticker universe.
pub struct BatchRefreshOrchestrator {
    pipeline: Arc<EntityPipeline>,
    universe: Arc<dyn UniverseProvider>,
    ledger: Arc<dyn RunLedger>,
    opts: RefreshOptions,
}

impl BatchRefreshOrchestrator {
    pub fn new(
        pipeline: Arc<EntityPipeline>,
        universe: Arc<dyn UniverseProvider>,
        ledger: Arc<dyn RunLedger>,
        opts: RefreshOptions,
    ) -> Self {
        Self {
            pipeline,
            universe,
            ledger,
            opts: opts.normalized(),
        }
    }

    fn cache(&self) -> &Arc<dyn MetricsCache> {
        self.pipeline.cache()
    }

    /// Tickers a run in `mode` would touch, in processing order.
    pub async fn plan(&self, mode: RefreshMode) -> anyhow::Result<Vec<String>> {
        let universe = dedup(self.universe.tickers().await.context("load universe failed")?);

        let mut targets = match mode {
            RefreshMode::Full => universe,
            RefreshMode::Incremental { max_age_hours } => {
                let stale: HashSet<String> = self
                    .cache()
                    .stale_tickers(max_age_hours)
                    .await
                    .context("load stale tickers failed")?
                    .into_iter()
                    .collect();
                let cached: HashSet<String> = self
                    .cache()
                    .cached_tickers()
                    .await
                    .context("load cached tickers failed")?
                    .into_iter()
                    .collect();

                let mut out: Vec<String> = universe
                    .iter()
                    .filter(|t| stale.contains(*t) || !cached.contains(*t))
                    .cloned()
                    .collect();

                // Stale rows that dropped out of the universe still get refreshed.
                let in_universe: HashSet<&String> = universe.iter().collect();
                let mut extra: Vec<String> = stale
                    .iter()
                    .filter(|t| !in_universe.contains(t))
                    .cloned()
                    .collect();
                extra.sort();
                out.extend(extra);
                out
            }
        };

        if let Some(limit) = self.opts.limit {
            targets.truncate(limit);
        }
        Ok(targets)
    }

    pub async fn run(
        &self,
        mode: RefreshMode,
        cancel: CancellationToken,
    ) -> anyhow::Result<RefreshReport> {
        let kind = mode.kind();
        let t0 = Instant::now();

        let targets = match self.plan(mode).await {
            Ok(t) => t,
            Err(err) => {
                self.record_planning_failure(kind, &err).await;
                return Err(err);
            }
        };

        let mut report = RefreshReport::new(kind, targets.len());
        report.run_id = match self.ledger.start(kind, targets.len() as u64).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(error = %err, "refresh run ledger start failed; continuing");
                None
            }
        };

        tracing::info!(
            kind,
            planned = targets.len(),
            concurrency = self.opts.concurrency,
            provider = self.pipeline.provider_name(),
            "refresh run started"
        );

        let pipeline = &self.pipeline;
        let cancel_ref = &cancel;
        let mut outcomes = futures::stream::iter(targets)
            .map(|ticker| async move {
                if cancel_ref.is_cancelled() {
                    return EntityOutcome::cancelled(&ticker);
                }
                pipeline.process(&ticker).await
            })
            .buffer_unordered(self.opts.concurrency);

        while let Some(outcome) = outcomes.next().await {
            report.record(&outcome);

            let done = report.processed + report.cancelled;
            if self.opts.progress_every > 0 && done % self.opts.progress_every == 0 {
                tracing::info!(
                    kind,
                    done,
                    planned = report.planned,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    persist_failures = report.persist_failures,
                    "refresh progress"
                );
            }
        }

        report.finalize();
        report.elapsed = t0.elapsed();

        if let Some(id) = report.run_id {
            if let Err(err) = self.ledger.finish(id, &report.summary()).await {
                tracing::warn!(%id, error = %err, "refresh run ledger finish failed");
            }
        }

        tracing::info!(
            kind,
            status = report.status.as_str(),
            planned = report.planned,
            succeeded = report.succeeded,
            failed = report.failed,
            persist_failures = report.persist_failures,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "refresh run finished"
        );

        Ok(report)
    }

    async fn record_planning_failure(&self, kind: &str, err: &anyhow::Error) {
        let summary = RunSummary {
            status: RunStatus::Failed,
            records_updated: 0,
            failures: 0,
            error_summary: Some(format!("{err:#}").chars().take(MAX_ERROR_SUMMARY_LEN).collect()),
        };
        match self.ledger.start(kind, 0).await {
            Ok(id) => {
                if let Err(e) = self.ledger.finish(id, &summary).await {
                    tracing::warn!(%id, error = %e, "refresh run ledger finish failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "refresh run ledger start failed"),
        }
    }
}

fn dedup(tickers: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tickers
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}
