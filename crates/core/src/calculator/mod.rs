//! Dividend metrics for a single ticker.
//!
//! Everything here is pure: the caller passes the market snapshot and the as-of date, and each
//! metric degrades to `None` independently when its inputs are insufficient.

pub mod growth;
pub mod payout;
pub mod quality;
pub mod yield_history;

pub use growth::{cagr, consecutive_increase_years, yearly_totals};
pub use payout::{fcf_payout_ratio, payout_ratio};
pub use quality::quality_score;
pub use yield_history::{historical_yield, iqr_filter, YieldAnalysis};

use crate::config::env_or;
use crate::domain::{AristocratStatus, DividendMetrics, MarketSnapshot};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Combined national and local withholding on listed-equity dividends in the original market.
pub const DEFAULT_DIVIDEND_TAX_RATE: f64 = 0.20315;

#[derive(Debug, Clone)]
pub struct CalculatorConfig {
    pub tax_rate: f64,
    /// Number of yearly windows used by the yield history analysis.
    pub yield_history_years: u32,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            tax_rate: DEFAULT_DIVIDEND_TAX_RATE,
            yield_history_years: 5,
        }
    }
}

impl CalculatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let tax_rate: f64 = env_or("DIVIDEND_TAX_RATE", d.tax_rate);
        let yield_history_years: u32 = env_or("YIELD_HISTORY_YEARS", d.yield_history_years);

        Self {
            tax_rate: if (0.0..1.0).contains(&tax_rate) {
                tax_rate
            } else {
                d.tax_rate
            },
            yield_history_years: if yield_history_years >= 1 {
                yield_history_years
            } else {
                d.yield_history_years
            },
        }
    }
}

/// Calculator output: the cache row plus the intermediates it was derived from.
#[derive(Debug, Clone, Serialize)]
pub struct DividendAnalysis {
    pub metrics: DividendMetrics,
    pub yield_analysis: Option<YieldAnalysis>,
    pub yearly_totals: BTreeMap<i32, f64>,
}

impl DividendAnalysis {
    /// CAGR for an arbitrary horizon, falling back to the yearly totals when the row does not
    /// carry that horizon.
    pub fn cagr_for_horizon(&self, years: u32) -> Option<f64> {
        match years {
            5 | 10 => self.metrics.cagr_for_horizon(years),
            _ => {
                let totals: Vec<f64> = self.yearly_totals.values().copied().collect();
                cagr(&totals, years as usize)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DividendMetricsCalculator {
    config: CalculatorConfig,
}

impl DividendMetricsCalculator {
    pub fn new(config: CalculatorConfig) -> Self {
        Self { config }
    }

    pub fn compute(&self, snapshot: &MarketSnapshot, as_of: NaiveDate) -> DividendAnalysis {
        let snapshot = snapshot.clone().sanitized();
        let fundamentals = &snapshot.fundamentals;

        let totals_by_year = yearly_totals(&snapshot.dividends);
        let totals: Vec<f64> = totals_by_year.values().copied().collect();

        let yield_analysis = historical_yield(
            &snapshot.dividends,
            &snapshot.prices,
            self.config.yield_history_years,
            as_of,
        );

        let current_yield = spot_yield(fundamentals.dividend_rate, snapshot.latest_close())
            .or_else(|| yield_analysis.as_ref().map(|a| a.current_yield));
        let after_tax_yield = current_yield.map(|y| y * (1.0 - self.config.tax_rate));

        let consecutive = growth::consecutive_increases(&totals);
        let cagr_5y = cagr(&totals, 5);
        let cagr_10y = cagr(&totals, 10);

        let payout = payout_ratio(fundamentals.dividend_rate, fundamentals.trailing_eps);
        let fcf_payout = fcf_payout_ratio(fundamentals);

        let score = yield_analysis.as_ref().and_then(|a| {
            quality_score(Some(a.avg_yield), Some(a.cv), Some(a.trend), a.has_special_dividend)
        });

        let mut metrics = DividendMetrics {
            ticker: snapshot.ticker.trim().to_string(),
            company_name: Some(snapshot.display_name().to_string()),
            current_dividend_yield: current_yield.map(round4),
            after_tax_yield: after_tax_yield.map(round4),
            consecutive_increase_years: Some(consecutive),
            dividend_cagr_5y: cagr_5y.map(round4),
            dividend_cagr_10y: cagr_10y.map(round4),
            payout_ratio: payout.map(|(r, _)| round4(r)),
            payout_ratio_status: payout.map(|(_, s)| s),
            fcf_payout_ratio: fcf_payout.map(|(r, _)| round4(r)),
            fcf_payout_status: fcf_payout.map(|(_, s)| s),
            aristocrat_status: None,
            avg_yield: yield_analysis.as_ref().map(|a| round4(a.avg_yield)),
            yield_cv: yield_analysis.as_ref().map(|a| a.cv),
            yield_trend: yield_analysis.as_ref().map(|a| a.trend),
            has_special_dividend: yield_analysis
                .as_ref()
                .is_some_and(|a| a.has_special_dividend),
            quality_score: score,
            data_quality: crate::domain::DataQuality::Incomplete,
            last_updated: Utc::now(),
            calculation_error: None,
        };
        metrics.aristocrat_status = Some(AristocratStatus::classify(
            metrics.consecutive_increase_years,
            metrics.dividend_cagr_5y,
        ));
        metrics.data_quality = metrics.classify_data_quality();

        DividendAnalysis {
            metrics,
            yield_analysis,
            yearly_totals: totals_by_year,
        }
    }
}

fn spot_yield(dividend_rate: Option<f64>, price: Option<f64>) -> Option<f64> {
    let (rate, price) = (dividend_rate?, price?);
    if !(rate > 0.0) || !(price > 0.0) {
        return None;
    }
    Some(rate * 100.0 / price)
}

fn round4(v: f64) -> f64 {
    if !v.is_finite() {
        return v;
    }
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        DataQuality, DividendObservation, Fundamentals, PayoutStatus, PriceObservation,
    };
    use chrono::Duration;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()
    }

    /// Ten calendar years of growing dividends and a flat 1000 price.
    fn growing_snapshot() -> MarketSnapshot {
        let mut dividends = Vec::new();
        let mut prices = Vec::new();
        for (i, year) in (2015..=2024).enumerate() {
            let amount = 10.0 + i as f64;
            dividends.push(DividendObservation {
                date: NaiveDate::from_ymd_opt(year, 6, 20).unwrap(),
                amount,
            });
        }
        let mut d = as_of() - Duration::days(365 * 6);
        while d < as_of() {
            prices.push(PriceObservation {
                date: d,
                open: None,
                high: None,
                low: None,
                close: 1000.0,
                volume: None,
            });
            d += Duration::days(7);
        }

        MarketSnapshot {
            ticker: "8306.T".to_string(),
            company_name: Some("Mitsubishi UFJ".to_string()),
            dividends,
            prices,
            fundamentals: Fundamentals {
                trailing_eps: Some(100.0),
                dividend_rate: Some(20.0),
                shares_outstanding: Some(1_000.0),
                free_cash_flow: Some(50_000.0),
                dividends_paid: None,
            },
        }
    }

    #[test]
    fn computes_complete_record() {
        let calc = DividendMetricsCalculator::default();
        let out = calc.compute(&growing_snapshot(), as_of());
        let m = &out.metrics;

        assert_eq!(m.ticker, "8306.T");
        assert_eq!(m.consecutive_increase_years, Some(9));
        assert_eq!(m.current_dividend_yield, Some(2.0));
        assert_eq!(m.after_tax_yield, Some(round4(2.0 * (1.0 - DEFAULT_DIVIDEND_TAX_RATE))));
        assert_eq!(m.payout_ratio, Some(20.0));
        assert_eq!(m.payout_ratio_status, Some(PayoutStatus::AmpleHeadroom));
        assert_eq!(m.fcf_payout_ratio, Some(40.0));
        assert_eq!(m.aristocrat_status, Some(AristocratStatus::DividendGrower));
        assert_eq!(m.data_quality, DataQuality::Complete);

        let expected_5y = ((19.0_f64 / 15.0).powf(0.25) - 1.0) * 100.0;
        assert!((m.dividend_cagr_5y.unwrap() - expected_5y).abs() < 1e-3);
        assert!(m.dividend_cagr_10y.is_some());
        assert!(m.quality_score.is_some());
        assert!(out.yield_analysis.is_some());
        assert!(out.cagr_for_horizon(3).is_some());
    }

    #[test]
    fn absent_data_is_not_an_error() {
        let calc = DividendMetricsCalculator::default();
        let out = calc.compute(&MarketSnapshot::empty("1301.T"), as_of());
        let m = &out.metrics;

        assert_eq!(m.consecutive_increase_years, Some(0));
        assert_eq!(m.current_dividend_yield, None);
        assert_eq!(m.quality_score, None);
        assert_eq!(m.calculation_error, None);
        assert_eq!(m.data_quality, DataQuality::Incomplete);
        assert_eq!(m.company_name.as_deref(), Some("1301.T"));
        assert_eq!(m.aristocrat_status, Some(AristocratStatus::General));
    }

    #[test]
    fn missing_fundamentals_degrade_to_partial() {
        let mut snap = growing_snapshot();
        snap.fundamentals = Fundamentals::default();
        let out = DividendMetricsCalculator::default().compute(&snap, as_of());

        // Current yield falls back to the yield history, payout becomes unavailable.
        assert!(out.metrics.current_dividend_yield.is_some());
        assert_eq!(out.metrics.payout_ratio, None);
        assert_eq!(out.metrics.fcf_payout_ratio, None);
        assert_eq!(out.metrics.data_quality, DataQuality::Partial);
    }

    #[test]
    fn spot_yield_without_dividend_history_is_partial() {
        let mut snap = MarketSnapshot::empty("9432.T");
        snap.fundamentals.dividend_rate = Some(30.0);
        snap.prices.push(PriceObservation {
            date: as_of() - Duration::days(1),
            open: None,
            high: None,
            low: None,
            close: 1000.0,
            volume: None,
        });
        let m = DividendMetricsCalculator::default().compute(&snap, as_of()).metrics;

        assert_eq!(m.consecutive_increase_years, Some(0));
        assert_eq!(m.current_dividend_yield, Some(3.0));
        assert_eq!(m.data_quality, DataQuality::Partial);
    }

    #[test]
    fn config_from_env_rejects_out_of_range_values() {
        std::env::set_var("DIVIDEND_TAX_RATE", "1.5");
        std::env::set_var("YIELD_HISTORY_YEARS", "0");
        let cfg = CalculatorConfig::from_env();
        std::env::remove_var("DIVIDEND_TAX_RATE");
        std::env::remove_var("YIELD_HISTORY_YEARS");

        assert_eq!(cfg.tax_rate, DEFAULT_DIVIDEND_TAX_RATE);
        assert_eq!(cfg.yield_history_years, 5);
    }
}
