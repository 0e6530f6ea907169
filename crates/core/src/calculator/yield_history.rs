//! Year-by-year dividend yield with IQR outlier filtering, stability and trend.

use crate::domain::{DividendObservation, PriceObservation};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Outlier filtering only kicks in with at least this many yearly samples.
pub const MIN_SAMPLES_FOR_OUTLIER_FILTER: usize = 4;
/// Trend regression needs at least this many filtered samples.
pub const MIN_SAMPLES_FOR_TREND: usize = 3;

const WINDOW_DAYS: i64 = 365;
const IQR_FENCE: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldAnalysis {
    /// Yearly yields (%), oldest first, before outlier filtering.
    pub yearly_yields: Vec<f64>,
    pub avg_yield: f64,
    pub cv: f64,
    pub trend: f64,
    pub current_yield: f64,
    pub has_special_dividend: bool,
}

/// Yields for the last `years` 365-day windows ending at `as_of`.
///
/// Window `k` is `[as_of - 365(k+1), as_of - 365k)`. Its yield is the window's dividend sum
/// divided by the close of the first price bar inside the window. Windows without dividends
/// or prices are skipped. Result is oldest first.
pub fn yearly_yields(
    dividends: &[DividendObservation],
    prices: &[PriceObservation],
    years: u32,
    as_of: NaiveDate,
) -> Vec<f64> {
    let mut newest_first = Vec::new();

    for k in 0..i64::from(years) {
        let end = as_of - Duration::days(WINDOW_DAYS * k);
        let start = as_of - Duration::days(WINDOW_DAYS * (k + 1));

        let in_window: Vec<f64> = dividends
            .iter()
            .filter(|d| d.date >= start && d.date < end)
            .map(|d| d.amount)
            .collect();
        if in_window.is_empty() {
            continue;
        }
        let total: f64 = in_window.iter().sum();

        let opening = prices
            .iter()
            .filter(|p| p.date >= start && p.date < end)
            .min_by_key(|p| p.date)
            .map(|p| p.close);
        let Some(price) = opening else {
            continue;
        };
        if !(price > 0.0) {
            continue;
        }

        newest_first.push(total * 100.0 / price);
    }

    newest_first.reverse();
    newest_first
}

/// Full yield analysis, or `None` when no yearly yield could be computed.
pub fn historical_yield(
    dividends: &[DividendObservation],
    prices: &[PriceObservation],
    years: u32,
    as_of: NaiveDate,
) -> Option<YieldAnalysis> {
    analyze_yearly_yields(yearly_yields(dividends, prices, years, as_of))
}

/// Statistics over an oldest-first yearly yield series.
pub fn analyze_yearly_yields(yearly: Vec<f64>) -> Option<YieldAnalysis> {
    let current_yield = *yearly.last()?;

    let (filtered, has_special_dividend) = iqr_filter(&yearly);
    let avg_yield = mean(&filtered)?;

    let cv = if filtered.len() >= 2 {
        if avg_yield > 0.0 {
            sample_std(&filtered).unwrap_or(0.0) / avg_yield
        } else {
            f64::INFINITY
        }
    } else {
        0.0
    };

    let trend = if filtered.len() >= MIN_SAMPLES_FOR_TREND {
        ols_slope(&filtered).unwrap_or(0.0)
    } else {
        0.0
    };

    Some(YieldAnalysis {
        yearly_yields: yearly,
        avg_yield,
        cv,
        trend,
        current_yield,
        has_special_dividend,
    })
}

/// Drops values outside `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]`.
///
/// Returns the kept values (original order) and whether anything was removed. Short series
/// are returned untouched; if every value would be removed the unfiltered series is kept.
pub fn iqr_filter(values: &[f64]) -> (Vec<f64>, bool) {
    if values.len() < MIN_SAMPLES_FOR_OUTLIER_FILTER {
        return (values.to_vec(), false);
    }

    let (Some(q1), Some(q3)) = (quantile(values, 0.25), quantile(values, 0.75)) else {
        return (values.to_vec(), false);
    };
    let iqr = q3 - q1;
    let lower = q1 - IQR_FENCE * iqr;
    let upper = q3 + IQR_FENCE * iqr;

    let kept: Vec<f64> = values
        .iter()
        .copied()
        .filter(|v| *v >= lower && *v <= upper)
        .collect();
    let removed = kept.len() < values.len();

    if kept.is_empty() {
        return (values.to_vec(), removed);
    }
    (kept, removed)
}

/// Quantile with linear interpolation between closest ranks.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Least-squares slope of `values` against their index.
pub fn ols_slope(values: &[f64]) -> Option<f64> {
    let n = values.len() as f64;
    let (mut sx, mut sy, mut sxy, mut sx2) = (0.0, 0.0, 0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let x = i as f64;
        sx += x;
        sy += y;
        sxy += x * y;
        sx2 += x * x;
    }
    let denom = n * sx2 - sx * sx;
    if denom == 0.0 {
        return None;
    }
    Some((n * sxy - sx * sy) / denom)
}
