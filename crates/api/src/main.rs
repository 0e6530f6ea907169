use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use divscope_core::calculator::{CalculatorConfig, DividendMetricsCalculator};
use divscope_core::domain::{CacheSummary, DividendMetrics, QualityStatistics, ScreeningCriteria};
use divscope_core::ingest::HttpJsonMarketData;
use divscope_core::refresh::{BackoffPolicy, EntityPipeline, PipelineOptions};
use divscope_core::screening::{ScreeningEngine, ScreeningOutcome};
use divscope_core::storage::{MetricsCache, PgMetricsCache};
use divscope_core::universe::{parse_list, PgUniverse, UniverseOptions};

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
    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match divscope_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(
                        error = %e,
                        "db migrations failed; starting API in degraded mode"
                    );
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let state = build_state(&settings, pool);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/screening", get(get_screening))
        .route("/metrics/:ticker", get(get_metrics))
        .route("/cache/quality", get(get_cache_quality))
        .route("/cache/summary", get(get_cache_summary))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn build_state(settings: &divscope_core::config::Settings, pool: Option<PgPool>) -> AppState {
    let Some(pool) = pool else {
        return AppState {
            cache: None,
            engine: None,
        };
    };

    let cache: Arc<dyn MetricsCache> = Arc::new(PgMetricsCache::new(pool.clone()));

    // Without a provider the API still serves cached reads.
    let engine = match HttpJsonMarketData::from_settings(settings) {
        Ok(gateway) => {
            let pipeline = Arc::new(EntityPipeline::new(
                Arc::new(gateway),
                cache.clone(),
                DividendMetricsCalculator::new(CalculatorConfig::from_env()),
                BackoffPolicy::from_env(),
                PipelineOptions::from_env(),
            ));
            let universe = Arc::new(PgUniverse::new(pool, UniverseOptions::from_env()));
            let concurrency = divscope_core::config::env_or("REFRESH_CONCURRENCY", 1);
            Some(Arc::new(
                ScreeningEngine::new(pipeline, universe).with_concurrency(concurrency),
            ))
        }
        Err(e) => {
            tracing::warn!(error = %e, "data provider not configured; screening disabled");
            None
        }
    };

    AppState {
        cache: Some(cache),
        engine,
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    cache: Option<Arc<dyn MetricsCache>>,
    engine: Option<Arc<ScreeningEngine>>,
}

#[derive(Debug, Default, Deserialize)]
struct ScreeningQuery {
    min_consecutive_years: Option<i32>,
    min_cagr: Option<f64>,
    max_payout_ratio: Option<f64>,
    years: Option<u32>,
    use_cache: Option<bool>,
    max_cache_age_hours: Option<i64>,
    /// Comma separated.
    tickers: Option<String>,
}

impl ScreeningQuery {
    fn into_criteria(self) -> ScreeningCriteria {
        let d = ScreeningCriteria::default();
        ScreeningCriteria {
            min_consecutive_years: self.min_consecutive_years.unwrap_or(d.min_consecutive_years),
            min_cagr: self.min_cagr.unwrap_or(d.min_cagr),
            max_payout_ratio: self.max_payout_ratio.unwrap_or(d.max_payout_ratio),
            years: self.years.unwrap_or(d.years),
            use_cache: self.use_cache.unwrap_or(d.use_cache),
            max_cache_age_hours: self.max_cache_age_hours.unwrap_or(d.max_cache_age_hours),
            tickers: self
                .tickers
                .as_deref()
                .map(parse_list)
                .filter(|t| !t.is_empty()),
        }
    }
}

async fn get_screening(
    State(state): State<AppState>,
    Query(query): Query<ScreeningQuery>,
) -> Result<Json<ScreeningOutcome>, StatusCode> {
    let Some(engine) = &state.engine else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let criteria = query.into_criteria();
    criteria.validate().map_err(|_| StatusCode::BAD_REQUEST)?;

    let outcome = engine.screen(&criteria).await.map_err(|e| {
        sentry_anyhow::capture_anyhow(&e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(outcome))
}

async fn get_metrics(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<DividendMetrics>, StatusCode> {
    let Some(cache) = &state.cache else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let metrics = cache
        .latest(&ticker)
        .await
        .map_err(|e| {
            sentry_anyhow::capture_anyhow(&e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(metrics))
}

async fn get_cache_quality(
    State(state): State<AppState>,
) -> Result<Json<QualityStatistics>, StatusCode> {
    let Some(cache) = &state.cache else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let stats = cache.quality_statistics().await.map_err(|e| {
        sentry_anyhow::capture_anyhow(&e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(stats))
}

async fn get_cache_summary(
    State(state): State<AppState>,
) -> Result<Json<CacheSummary>, StatusCode> {
    let Some(cache) = &state.cache else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let summary = cache.summary().await.map_err(|e| {
        sentry_anyhow::capture_anyhow(&e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(summary))
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

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
