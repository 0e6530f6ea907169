use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// How many of the four core metrics (current yield, 5y CAGR, consecutive years, payout
/// ratio) are present on a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    Complete,
    Partial,
    Incomplete,
}

impl DataQuality {
    pub const ALL: [DataQuality; 3] = [Self::Complete, Self::Partial, Self::Incomplete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Incomplete => "incomplete",
        }
    }

    pub fn from_core_field_count(available: usize) -> Self {
        if available >= 4 {
            Self::Complete
        } else if available >= 2 {
            Self::Partial
        } else {
            Self::Incomplete
        }
    }

    /// Weight used by the cache-wide quality score.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Complete => 100.0,
            Self::Partial => 50.0,
            Self::Incomplete => 0.0,
        }
    }
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualitative band for payout and FCF payout ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    AmpleHeadroom,
    Healthy,
    Elevated,
    High,
}

impl PayoutStatus {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < 30.0 {
            Self::AmpleHeadroom
        } else if ratio < 60.0 {
            Self::Healthy
        } else if ratio < 80.0 {
            Self::Elevated
        } else {
            Self::High
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::AmpleHeadroom => "ample headroom",
            Self::Healthy => "healthy",
            Self::Elevated => "elevated, caution",
            Self::High => "high, cut risk",
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AristocratStatus {
    Candidate,
    DividendGrower,
    HighGrowth,
    General,
}

impl AristocratStatus {
    pub fn classify(consecutive_years: Option<i32>, cagr_5y: Option<f64>) -> Self {
        let years = consecutive_years.unwrap_or(0);
        if years >= 10 {
            Self::Candidate
        } else if years >= 5 {
            Self::DividendGrower
        } else if cagr_5y.is_some_and(|c| c > 5.0) {
            Self::HighGrowth
        } else {
            Self::General
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Candidate => "aristocrat candidate",
            Self::DividendGrower => "dividend grower",
            Self::HighGrowth => "high growth",
            Self::General => "general",
        }
    }
}

impl fmt::Display for AristocratStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Latest computed dividend metrics for one ticker. This is the cache row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendMetrics {
    pub ticker: String,
    pub company_name: Option<String>,
    pub current_dividend_yield: Option<f64>,
    pub after_tax_yield: Option<f64>,
    pub consecutive_increase_years: Option<i32>,
    pub dividend_cagr_5y: Option<f64>,
    pub dividend_cagr_10y: Option<f64>,
    pub payout_ratio: Option<f64>,
    pub payout_ratio_status: Option<PayoutStatus>,
    pub fcf_payout_ratio: Option<f64>,
    pub fcf_payout_status: Option<PayoutStatus>,
    pub aristocrat_status: Option<AristocratStatus>,
    pub avg_yield: Option<f64>,
    pub yield_cv: Option<f64>,
    pub yield_trend: Option<f64>,
    pub has_special_dividend: bool,
    pub quality_score: Option<f64>,
    pub data_quality: DataQuality,
    pub last_updated: DateTime<Utc>,
    pub calculation_error: Option<String>,
}

impl DividendMetrics {
    /// Minimal record written when the pipeline for a ticker failed.
    pub fn failed(ticker: &str, error: &str) -> Self {
        let mut out = Self::empty(ticker);
        out.company_name = Some(ticker.to_string());
        out.calculation_error = Some(truncate_error(error));
        out
    }

    pub fn empty(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            company_name: None,
            current_dividend_yield: None,
            after_tax_yield: None,
            consecutive_increase_years: None,
            dividend_cagr_5y: None,
            dividend_cagr_10y: None,
            payout_ratio: None,
            payout_ratio_status: None,
            fcf_payout_ratio: None,
            fcf_payout_status: None,
            aristocrat_status: None,
            avg_yield: None,
            yield_cv: None,
            yield_trend: None,
            has_special_dividend: false,
            quality_score: None,
            data_quality: DataQuality::Incomplete,
            last_updated: Utc::now(),
            calculation_error: None,
        }
    }

    pub fn core_field_count(&self) -> usize {
        [
            self.current_dividend_yield.is_some(),
            self.dividend_cagr_5y.is_some(),
            self.consecutive_increase_years.is_some(),
            self.payout_ratio.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    pub fn classify_data_quality(&self) -> DataQuality {
        DataQuality::from_core_field_count(self.core_field_count())
    }

    /// CAGR for a screening horizon, when the row carries one.
    pub fn cagr_for_horizon(&self, years: u32) -> Option<f64> {
        match years {
            5 => self.dividend_cagr_5y,
            10 => self.dividend_cagr_10y,
            _ => None,
        }
    }

    pub fn consecutive_years_or_zero(&self) -> i32 {
        self.consecutive_increase_years.unwrap_or(0)
    }

    /// Same metrics, ignoring `last_updated`.
    pub fn same_values_as(&self, other: &Self) -> bool {
        let mut a = self.clone();
        a.last_updated = other.last_updated;
        a == *other
    }
}

const MAX_ERROR_LEN: usize = 500;

fn truncate_error(error: &str) -> String {
    let trimmed = error.trim();
    if trimmed.chars().count() <= MAX_ERROR_LEN {
        return trimmed.to_string();
    }
    trimmed.chars().take(MAX_ERROR_LEN).collect()
}

/// Parameters of a dividend-growth screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningCriteria {
    pub min_consecutive_years: i32,
    pub min_cagr: f64,
    pub max_payout_ratio: f64,
    /// CAGR horizon in years.
    pub years: u32,
    pub use_cache: bool,
    pub max_cache_age_hours: i64,
    /// Explicit universe; `None` means the default universe provider.
    pub tickers: Option<Vec<String>>,
}

impl Default for ScreeningCriteria {
    fn default() -> Self {
        Self {
            min_consecutive_years: 5,
            min_cagr: 3.0,
            max_payout_ratio: 80.0,
            years: 5,
            use_cache: true,
            max_cache_age_hours: 24,
            tickers: None,
        }
    }
}

impl ScreeningCriteria {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.years >= 2,
            "analysis horizon must be >= 2 years (got {})",
            self.years
        );
        anyhow::ensure!(
            self.min_consecutive_years >= 0,
            "min_consecutive_years must be >= 0 (got {})",
            self.min_consecutive_years
        );
        anyhow::ensure!(
            self.max_cache_age_hours >= 0,
            "max_cache_age_hours must be >= 0 (got {})",
            self.max_cache_age_hours
        );
        anyhow::ensure!(self.min_cagr.is_finite(), "min_cagr must be finite");
        anyhow::ensure!(self.max_payout_ratio.is_finite(), "max_payout_ratio must be finite");
        Ok(())
    }

    /// Whether fresh cache rows can answer this horizon.
    pub fn horizon_is_cached(&self) -> bool {
        matches!(self.years, 5 | 10)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityBucket {
    pub data_quality: DataQuality,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityStatistics {
    pub total: u64,
    pub by_quality: Vec<QualityBucket>,
    /// complete=100, partial=50, incomplete=0, averaged over all rows.
    pub overall_quality_score: f64,
}

impl QualityStatistics {
    pub fn from_counts(counts: &[(DataQuality, u64)]) -> Self {
        let total: u64 = counts.iter().map(|(_, c)| *c).sum();

        let mut by_quality = Vec::new();
        for quality in DataQuality::ALL {
            let count: u64 = counts
                .iter()
                .filter(|(q, _)| *q == quality)
                .map(|(_, c)| *c)
                .sum();
            if count == 0 {
                continue;
            }
            by_quality.push(QualityBucket {
                data_quality: quality,
                count,
                percentage: round2(count as f64 * 100.0 / total as f64),
            });
        }

        let overall_quality_score = if total == 0 {
            0.0
        } else {
            let weighted: f64 = by_quality
                .iter()
                .map(|b| b.count as f64 * b.data_quality.weight())
                .sum();
            round2(weighted / total as f64)
        };

        Self {
            total,
            by_quality,
            overall_quality_score,
        }
    }
}

/// Row count and most recent update across the whole cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub total: u64,
    pub latest_update: Option<DateTime<Utc>>,
}

/// Ranking used by cache reads and screening results: consecutive years desc, CAGR desc with
/// missing values last, then ticker asc.
pub fn rank_order(a: (i32, Option<f64>, &str), b: (i32, Option<f64>, &str)) -> Ordering {
    b.0.cmp(&a.0)
        .then_with(|| match (a.1, b.1) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.2.cmp(b.2))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
