use crate::domain::{
    rank_order, AristocratStatus, CacheSummary, DataQuality, DividendMetrics, PayoutStatus,
    QualityStatistics,
};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Latest dividend metrics per ticker, with read-time staleness.
#[async_trait::async_trait]
pub trait MetricsCache: Send + Sync {
    /// Fresh rows with `consecutive_increase_years >= min_consecutive_years` (missing counts as
    /// 0), optionally restricted to `tickers`, in ranking order.
    async fn get(
        &self,
        tickers: Option<&[String]>,
        min_consecutive_years: i32,
        max_age_hours: i64,
    ) -> anyhow::Result<Vec<DividendMetrics>>;

    /// Insert or replace the row for `ticker`. `last_updated` is always set to now.
    async fn upsert(&self, ticker: &str, metrics: &DividendMetrics) -> anyhow::Result<()>;

    /// Last-known row regardless of age.
    async fn latest(&self, ticker: &str) -> anyhow::Result<Option<DividendMetrics>>;

    async fn quality_statistics(&self) -> anyhow::Result<QualityStatistics>;

    async fn summary(&self) -> anyhow::Result<CacheSummary>;

    /// Tickers whose row is older than `max_age_hours`.
    async fn stale_tickers(&self, max_age_hours: i64) -> anyhow::Result<Vec<String>>;

    async fn cached_tickers(&self) -> anyhow::Result<Vec<String>>;
}

fn cutoff(max_age_hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(max_age_hours.max(0))
}

#[derive(Debug, Clone)]
pub struct PgMetricsCache {
    pool: sqlx::PgPool,
}

impl PgMetricsCache {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "SELECT ticker, company_name, current_dividend_yield, \
     after_tax_yield, consecutive_increase_years, dividend_cagr_5y, dividend_cagr_10y, \
     payout_ratio, payout_ratio_status, fcf_payout_ratio, fcf_payout_status, aristocrat_status, \
     avg_yield, yield_cv, yield_trend, has_special_dividend, quality_score, data_quality, \
     last_updated, calculation_error \
     FROM dividend_metrics";

#[derive(Debug, sqlx::FromRow)]
struct MetricsRow {
    ticker: String,
    company_name: Option<String>,
    current_dividend_yield: Option<f64>,
    after_tax_yield: Option<f64>,
    consecutive_increase_years: Option<i32>,
    dividend_cagr_5y: Option<f64>,
    dividend_cagr_10y: Option<f64>,
    payout_ratio: Option<f64>,
    payout_ratio_status: Option<String>,
    fcf_payout_ratio: Option<f64>,
    fcf_payout_status: Option<String>,
    aristocrat_status: Option<String>,
    avg_yield: Option<f64>,
    yield_cv: Option<f64>,
    yield_trend: Option<f64>,
    has_special_dividend: bool,
    quality_score: Option<f64>,
    data_quality: String,
    last_updated: DateTime<Utc>,
    calculation_error: Option<String>,
}

impl From<MetricsRow> for DividendMetrics {
    fn from(row: MetricsRow) -> Self {
        Self {
            payout_ratio_status: row.payout_ratio_status.as_deref().and_then(decode_payout_status),
            fcf_payout_status: row.fcf_payout_status.as_deref().and_then(decode_payout_status),
            aristocrat_status: row.aristocrat_status.as_deref().and_then(decode_aristocrat_status),
            data_quality: decode_data_quality(&row.data_quality),
            ticker: row.ticker,
            company_name: row.company_name,
            current_dividend_yield: row.current_dividend_yield,
            after_tax_yield: row.after_tax_yield,
            consecutive_increase_years: row.consecutive_increase_years,
            dividend_cagr_5y: row.dividend_cagr_5y,
            dividend_cagr_10y: row.dividend_cagr_10y,
            payout_ratio: row.payout_ratio,
            fcf_payout_ratio: row.fcf_payout_ratio,
            avg_yield: row.avg_yield,
            yield_cv: row.yield_cv.filter(|v| v.is_finite()),
            yield_trend: row.yield_trend,
            has_special_dividend: row.has_special_dividend,
            quality_score: row.quality_score,
            last_updated: row.last_updated,
            calculation_error: row.calculation_error,
        }
    }
}

#[async_trait::async_trait]
impl MetricsCache for PgMetricsCache {
    async fn get(
        &self,
        tickers: Option<&[String]>,
        min_consecutive_years: i32,
        max_age_hours: i64,
    ) -> anyhow::Result<Vec<DividendMetrics>> {
        let sql = format!(
            "{SELECT_COLUMNS} \
             WHERE COALESCE(consecutive_increase_years, 0) >= $1 \
               AND last_updated >= $2 \
               AND ($3::text[] IS NULL OR ticker = ANY($3)) \
             ORDER BY COALESCE(consecutive_increase_years, 0) DESC, \
                      dividend_cagr_5y DESC NULLS LAST, ticker ASC"
        );

        let rows = sqlx::query_as::<_, MetricsRow>(&sql)
            .persistent(false)
            .bind(min_consecutive_years)
            .bind(cutoff(max_age_hours))
            .bind(tickers.map(|t| t.to_vec()))
            .fetch_all(&self.pool)
            .await
            .context("select fresh dividend_metrics failed")?;

        Ok(rows.into_iter().map(DividendMetrics::from).collect())
    }

    async fn upsert(&self, ticker: &str, m: &DividendMetrics) -> anyhow::Result<()> {
        let ticker = ticker.trim();
        anyhow::ensure!(!ticker.is_empty(), "ticker must be non-empty");

        // Infinite CV (non-positive mean) has no column representation.
        let yield_cv = m.yield_cv.filter(|v| v.is_finite());

        sqlx::query(
            "INSERT INTO dividend_metrics (ticker, company_name, current_dividend_yield, \
               after_tax_yield, consecutive_increase_years, dividend_cagr_5y, dividend_cagr_10y, \
               payout_ratio, payout_ratio_status, fcf_payout_ratio, fcf_payout_status, \
               aristocrat_status, avg_yield, yield_cv, yield_trend, has_special_dividend, \
               quality_score, data_quality, last_updated, calculation_error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
               $11, $12, $13, $14, $15, $16, $17, $18, $19, $20) \
             ON CONFLICT (ticker) DO UPDATE SET \
               company_name = EXCLUDED.company_name, \
               current_dividend_yield = EXCLUDED.current_dividend_yield, \
               after_tax_yield = EXCLUDED.after_tax_yield, \
               consecutive_increase_years = EXCLUDED.consecutive_increase_years, \
               dividend_cagr_5y = EXCLUDED.dividend_cagr_5y, \
               dividend_cagr_10y = EXCLUDED.dividend_cagr_10y, \
               payout_ratio = EXCLUDED.payout_ratio, \
               payout_ratio_status = EXCLUDED.payout_ratio_status, \
               fcf_payout_ratio = EXCLUDED.fcf_payout_ratio, \
               fcf_payout_status = EXCLUDED.fcf_payout_status, \
               aristocrat_status = EXCLUDED.aristocrat_status, \
               avg_yield = EXCLUDED.avg_yield, \
               yield_cv = EXCLUDED.yield_cv, \
               yield_trend = EXCLUDED.yield_trend, \
               has_special_dividend = EXCLUDED.has_special_dividend, \
               quality_score = EXCLUDED.quality_score, \
               data_quality = EXCLUDED.data_quality, \
               last_updated = EXCLUDED.last_updated, \
               calculation_error = EXCLUDED.calculation_error",
        )
        .persistent(false)
        .bind(ticker)
        .bind(m.company_name.as_deref())
        .bind(m.current_dividend_yield)
        .bind(m.after_tax_yield)
        .bind(m.consecutive_increase_years)
        .bind(m.dividend_cagr_5y)
        .bind(m.dividend_cagr_10y)
        .bind(m.payout_ratio)
        .bind(m.payout_ratio_status.map(encode_payout_status))
        .bind(m.fcf_payout_ratio)
        .bind(m.fcf_payout_status.map(encode_payout_status))
        .bind(m.aristocrat_status.map(encode_aristocrat_status))
        .bind(m.avg_yield)
        .bind(yield_cv)
        .bind(m.yield_trend)
        .bind(m.has_special_dividend)
        .bind(m.quality_score)
        .bind(m.data_quality.as_str())
        .bind(Utc::now())
        .bind(m.calculation_error.as_deref())
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert dividend_metrics failed (ticker={ticker})"))?;

        Ok(())
    }

    async fn latest(&self, ticker: &str) -> anyhow::Result<Option<DividendMetrics>> {
        let sql = format!("{SELECT_COLUMNS} WHERE ticker = $1");
        let row = sqlx::query_as::<_, MetricsRow>(&sql)
            .persistent(false)
            .bind(ticker.trim())
            .fetch_optional(&self.pool)
            .await
            .context("select dividend_metrics by ticker failed")?;

        Ok(row.map(DividendMetrics::from))
    }

    async fn quality_statistics(&self) -> anyhow::Result<QualityStatistics> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT data_quality, COUNT(*) FROM dividend_metrics GROUP BY data_quality",
        )
        .persistent(false)
        .fetch_all(&self.pool)
        .await
        .context("select data_quality counts failed")?;

        let counts: Vec<(DataQuality, u64)> = rows
            .iter()
            .map(|(q, c)| (decode_data_quality(q), (*c).max(0) as u64))
            .collect();

        Ok(QualityStatistics::from_counts(&counts))
    }

    async fn summary(&self) -> anyhow::Result<CacheSummary> {
        let (total, latest_update) = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
            "SELECT COUNT(*), MAX(last_updated) FROM dividend_metrics",
        )
        .persistent(false)
        .fetch_one(&self.pool)
        .await
        .context("select dividend_metrics summary failed")?;

        Ok(CacheSummary {
            total: total.max(0) as u64,
            latest_update,
        })
    }

    async fn stale_tickers(&self, max_age_hours: i64) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT ticker FROM dividend_metrics WHERE last_updated < $1 ORDER BY ticker",
        )
        .persistent(false)
        .bind(cutoff(max_age_hours))
        .fetch_all(&self.pool)
        .await
        .context("select stale dividend_metrics failed")?;

        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    async fn cached_tickers(&self) -> anyhow::Result<Vec<String>> {
        let rows =
            sqlx::query_as::<_, (String,)>("SELECT ticker FROM dividend_metrics ORDER BY ticker")
                .persistent(false)
                .fetch_all(&self.pool)
                .await
                .context("select cached tickers failed")?;

        Ok(rows.into_iter().map(|(t,)| t).collect())
    }
}

fn encode_payout_status(s: PayoutStatus) -> &'static str {
    match s {
        PayoutStatus::AmpleHeadroom => "ample_headroom",
        PayoutStatus::Healthy => "healthy",
        PayoutStatus::Elevated => "elevated",
        PayoutStatus::High => "high",
    }
}

fn encode_aristocrat_status(s: AristocratStatus) -> &'static str {
    match s {
        AristocratStatus::Candidate => "candidate",
        AristocratStatus::DividendGrower => "dividend_grower",
        AristocratStatus::HighGrowth => "high_growth",
        AristocratStatus::General => "general",
    }
}

/// Accepts the stored keys, the display labels, and the labels older rows were written with.
fn decode_payout_status(raw: &str) -> Option<PayoutStatus> {
    let s = raw.trim();
    let lower = s.to_ascii_lowercase();
    match lower.as_str() {
        "ample_headroom" | "ample headroom" => return Some(PayoutStatus::AmpleHeadroom),
        "healthy" => return Some(PayoutStatus::Healthy),
        "elevated" | "elevated, caution" => return Some(PayoutStatus::Elevated),
        "high" | "high, cut risk" => return Some(PayoutStatus::High),
        _ => {}
    }

    if s.contains("増配余地") {
        Some(PayoutStatus::AmpleHeadroom)
    } else if s.contains("健全") {
        Some(PayoutStatus::Healthy)
    } else if s.contains("やや高め") {
        Some(PayoutStatus::Elevated)
    } else if s.contains("減配") || s.starts_with("高い") {
        Some(PayoutStatus::High)
    } else {
        None
    }
}

fn decode_aristocrat_status(raw: &str) -> Option<AristocratStatus> {
    let s = raw.trim();
    let lower = s.to_ascii_lowercase();
    match lower.as_str() {
        "candidate" | "aristocrat candidate" => return Some(AristocratStatus::Candidate),
        "dividend_grower" | "dividend grower" => return Some(AristocratStatus::DividendGrower),
        "high_growth" | "high growth" => return Some(AristocratStatus::HighGrowth),
        "general" => return Some(AristocratStatus::General),
        _ => {}
    }

    if s.contains("配当貴族") {
        Some(AristocratStatus::Candidate)
    } else if s.contains("配当成長") {
        Some(AristocratStatus::DividendGrower)
    } else if s.contains("高成長") {
        Some(AristocratStatus::HighGrowth)
    } else if s.contains("一般") {
        Some(AristocratStatus::General)
    } else {
        None
    }
}

/// Unknown values decode as `incomplete` so they never inflate the quality score.
fn decode_data_quality(raw: &str) -> DataQuality {
    match raw.trim().to_ascii_lowercase().as_str() {
        "complete" => DataQuality::Complete,
        "partial" => DataQuality::Partial,
        _ => DataQuality::Incomplete,
    }
}

/// Process-local cache used by dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryMetricsCache {
    rows: RwLock<HashMap<String, DividendMetrics>>,
}

impl MemoryMetricsCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryMetricsCache {
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Moves a row's `last_updated` into the past.
    pub async fn backdate(&self, ticker: &str, hours: i64) {
        if let Some(row) = self.rows.write().await.get_mut(ticker) {
            row.last_updated -= Duration::hours(hours);
        }
    }
}

#[async_trait::async_trait]
impl MetricsCache for MemoryMetricsCache {
    async fn get(
        &self,
        tickers: Option<&[String]>,
        min_consecutive_years: i32,
        max_age_hours: i64,
    ) -> anyhow::Result<Vec<DividendMetrics>> {
        let cutoff = cutoff(max_age_hours);
        let rows = self.rows.read().await;

        let mut out: Vec<DividendMetrics> = rows
            .values()
            .filter(|m| m.consecutive_years_or_zero() >= min_consecutive_years)
            .filter(|m| m.last_updated >= cutoff)
            .filter(|m| tickers.map_or(true, |t| t.iter().any(|x| x == &m.ticker)))
            .cloned()
            .collect();

        out.sort_by(|a, b| {
            rank_order(
                (a.consecutive_years_or_zero(), a.dividend_cagr_5y, &a.ticker),
                (b.consecutive_years_or_zero(), b.dividend_cagr_5y, &b.ticker),
            )
        });
        Ok(out)
    }

    async fn upsert(&self, ticker: &str, metrics: &DividendMetrics) -> anyhow::Result<()> {
        let ticker = ticker.trim();
        anyhow::ensure!(!ticker.is_empty(), "ticker must be non-empty");

        let mut row = metrics.clone();
        row.ticker = ticker.to_string();
        row.last_updated = Utc::now();
        self.rows.write().await.insert(ticker.to_string(), row);
        Ok(())
    }

    async fn latest(&self, ticker: &str) -> anyhow::Result<Option<DividendMetrics>> {
        Ok(self.rows.read().await.get(ticker.trim()).cloned())
    }

    async fn quality_statistics(&self) -> anyhow::Result<QualityStatistics> {
        let rows = self.rows.read().await;
        let counts: Vec<(DataQuality, u64)> = DataQuality::ALL
            .iter()
            .map(|q| (*q, rows.values().filter(|m| m.data_quality == *q).count() as u64))
            .collect();
        Ok(QualityStatistics::from_counts(&counts))
    }

    async fn summary(&self) -> anyhow::Result<CacheSummary> {
        let rows = self.rows.read().await;
        Ok(CacheSummary {
            total: rows.len() as u64,
            latest_update: rows.values().map(|m| m.last_updated).max(),
        })
    }

    async fn stale_tickers(&self, max_age_hours: i64) -> anyhow::Result<Vec<String>> {
        let cutoff = cutoff(max_age_hours);
        let mut out: Vec<String> = self
            .rows
            .read()
            .await
            .values()
            .filter(|m| m.last_updated < cutoff)
            .map(|m| m.ticker.clone())
            .collect();
        out.sort();
        Ok(out)
    }

    async fn cached_tickers(&self) -> anyhow::Result<Vec<String>> {
        let mut out: Vec<String> = self.rows.read().await.keys().cloned().collect();
        out.sort();
        Ok(out)
    }
}
