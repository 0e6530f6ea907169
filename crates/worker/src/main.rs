use anyhow::Context;
use clap::Parser;
use divscope_core::calculator::{CalculatorConfig, DividendMetricsCalculator};
use divscope_core::ingest::HttpJsonMarketData;
use divscope_core::refresh::{
    BackoffPolicy, BatchRefreshOrchestrator, EntityPipeline, PipelineOptions, RefreshMode,
    RefreshOptions,
};
use divscope_core::storage::{
    MemoryMetricsCache, MemoryRunLedger, MetricsCache, PgMetricsCache, PgRunLedger, RunLedger,
    RunStatus,
};
use divscope_core::universe::{
    parse_list, PgUniverse, StaticUniverse, UniverseOptions, UniverseProvider,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "divscope_worker")]
struct Args {
    /// Process at most this many tickers.
    #[arg(long)]
    limit: Option<usize>,

    /// Minimum delay between provider calls in milliseconds. Defaults to REFRESH_DELAY_MS.
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Only refresh rows older than --max-age-hours and tickers with no row yet.
    #[arg(long)]
    incremental: bool,

    /// Staleness threshold for --incremental. Defaults to REFRESH_MAX_AGE_HOURS or 24.
    #[arg(long)]
    max_age_hours: Option<i64>,

    /// Parallel provider workers (1..=3). Defaults to REFRESH_CONCURRENCY.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Comma separated tickers to refresh instead of the stocks universe.
    #[arg(long)]
    tickers: Option<String>,

    /// Fetch and compute, but keep results in memory instead of writing to the database.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = divscope_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let mode = if args.incremental {
        let max_age_hours = args
            .max_age_hours
            .unwrap_or_else(|| divscope_core::config::env_or("REFRESH_MAX_AGE_HOURS", 24));
        anyhow::ensure!(max_age_hours >= 0, "--max-age-hours must be >= 0");
        RefreshMode::Incremental { max_age_hours }
    } else {
        RefreshMode::Full
    };

    let explicit_tickers = args
        .tickers
        .as_deref()
        .map(parse_list)
        .filter(|t| !t.is_empty());

    // The database is needed for writes, and for the default universe.
    let pool = if !args.dry_run || explicit_tickers.is_none() {
        let db_url = settings.require_database_url()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .context("connect DATABASE_URL failed")?;
        if !args.dry_run {
            divscope_core::storage::migrate(&pool).await?;
        }
        Some(pool)
    } else {
        None
    };

    let universe: Arc<dyn UniverseProvider> = match (explicit_tickers, &pool) {
        (Some(tickers), _) => Arc::new(StaticUniverse::new(tickers)),
        (None, Some(pool)) => Arc::new(PgUniverse::new(pool.clone(), UniverseOptions::from_env())),
        (None, None) => anyhow::bail!("either --tickers or DATABASE_URL is required"),
    };

    let cache: Arc<dyn MetricsCache>;
    let ledger: Arc<dyn RunLedger>;
    match (&pool, args.dry_run) {
        (Some(pool), false) => {
            cache = Arc::new(PgMetricsCache::new(pool.clone()));
            ledger = Arc::new(PgRunLedger::new(pool.clone()));
        }
        _ => {
            cache = Arc::new(MemoryMetricsCache::new());
            ledger = Arc::new(MemoryRunLedger::new());
        }
    }

    let mut pipeline_opts = PipelineOptions::from_env();
    if let Some(ms) = args.delay_ms {
        pipeline_opts.delay = Duration::from_millis(ms);
    }

    let mut refresh_opts = RefreshOptions::from_env();
    refresh_opts.limit = args.limit;
    if let Some(n) = args.concurrency {
        refresh_opts.concurrency = n;
    }
    let refresh_opts = refresh_opts.normalized();

    let gateway = Arc::new(HttpJsonMarketData::from_settings(&settings)?);
    let pipeline = Arc::new(EntityPipeline::new(
        gateway,
        cache,
        DividendMetricsCalculator::new(CalculatorConfig::from_env()),
        BackoffPolicy::from_env(),
        pipeline_opts,
    ));
    let orchestrator = BatchRefreshOrchestrator::new(pipeline, universe, ledger, refresh_opts);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("ctrl-c received; stopping at the next ticker boundary");
                cancel.cancel();
            }
        });
    }

    let report = match orchestrator.run(mode, cancel).await {
        Ok(report) => report,
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %err, "refresh run could not start");
            return Err(err);
        }
    };

    tracing::info!(
        dry_run = args.dry_run,
        run_id = ?report.run_id,
        status = report.status.as_str(),
        by_quality = %serde_json::to_string(&report.by_quality)?,
        "refresh summary"
    );

    if report.status == RunStatus::Failed {
        let err = anyhow::anyhow!(
            "refresh run failed: {}",
            report.error_summary().unwrap_or_default()
        );
        sentry_anyhow::capture_anyhow(&err);
        return Err(err);
    }

    Ok(())
}

fn init_sentry(settings: &divscope_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
