use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Terminal outcome of a refresh run as written to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub records_updated: u64,
    pub failures: u64,
    pub error_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub kind: String,
    pub planned: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_updated: u64,
    pub failures: u64,
    pub error_summary: Option<String>,
}

/// Append-only history of refresh runs.
#[async_trait::async_trait]
pub trait RunLedger: Send + Sync {
    async fn start(&self, kind: &str, planned: u64) -> anyhow::Result<Uuid>;

    async fn finish(&self, id: Uuid, summary: &RunSummary) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgRunLedger {
    pool: sqlx::PgPool,
}

impl PgRunLedger {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn to_i32(n: u64) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[async_trait::async_trait]
impl RunLedger for PgRunLedger {
    async fn start(&self, kind: &str, planned: u64) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO refresh_runs (id, kind, status, planned, started_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .persistent(false)
        .bind(id)
        .bind(kind)
        .bind(RunStatus::Running.as_str())
        .bind(to_i32(planned))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("insert refresh_runs failed")?;

        Ok(id)
    }

    async fn finish(&self, id: Uuid, summary: &RunSummary) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE refresh_runs \
             SET status = $2, records_updated = $3, failures = $4, error_summary = $5, \
               completed_at = $6 \
             WHERE id = $1",
        )
        .persistent(false)
        .bind(id)
        .bind(summary.status.as_str())
        .bind(to_i32(summary.records_updated))
        .bind(to_i32(summary.failures))
        .bind(summary.error_summary.as_deref())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("update refresh_runs failed")?;

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: RwLock<HashMap<Uuid, RunRecord>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        let mut out: Vec<RunRecord> = self.runs.read().await.values().cloned().collect();
        out.sort_by_key(|r| r.started_at);
        out
    }
}

#[async_trait::async_trait]
impl RunLedger for MemoryRunLedger {
    async fn start(&self, kind: &str, planned: u64) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        self.runs.write().await.insert(
            id,
            RunRecord {
                id,
                kind: kind.to_string(),
                planned,
                started_at: Utc::now(),
                completed_at: None,
                status: RunStatus::Running,
                records_updated: 0,
                failures: 0,
                error_summary: None,
            },
        );
        Ok(id)
    }

    async fn finish(&self, id: Uuid, summary: &RunSummary) -> anyhow::Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).with_context(|| format!("unknown refresh run {id}"))?;
        run.status = summary.status;
        run.records_updated = summary.records_updated;
        run.failures = summary.failures;
        run.error_summary = summary.error_summary.clone();
        run.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_ledger_records_lifecycle() {
        let ledger = MemoryRunLedger::new();
        let id = ledger.start("incremental", 3).await.unwrap();
        assert_eq!(ledger.runs().await[0].status, RunStatus::Running);

        ledger
            .finish(
                id,
                &RunSummary {
                    status: RunStatus::Partial,
                    records_updated: 2,
                    failures: 1,
                    error_summary: Some("1 errors".to_string()),
                },
            )
            .await
            .unwrap();

        let run = &ledger.runs().await[0];
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.planned, 3);
        assert!(run.completed_at.is_some());

        assert!(ledger
            .finish(Uuid::new_v4(), &RunSummary {
                status: RunStatus::Success,
                records_updated: 0,
                failures: 0,
                error_summary: None,
            })
            .await
            .is_err());
    }
}
