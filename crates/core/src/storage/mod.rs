use anyhow::Context;

pub mod metrics_cache;
pub mod run_history;

pub use metrics_cache::{MemoryMetricsCache, MetricsCache, PgMetricsCache};
pub use run_history::{MemoryRunLedger, PgRunLedger, RunLedger, RunRecord, RunStatus, RunSummary};

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}
