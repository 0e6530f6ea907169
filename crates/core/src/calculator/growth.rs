use crate::domain::DividendObservation;
use chrono::Datelike;
use std::collections::BTreeMap;

/// Sums dividends per calendar year, ascending by year.
pub fn yearly_totals(dividends: &[DividendObservation]) -> BTreeMap<i32, f64> {
    let mut out = BTreeMap::new();
    for d in dividends {
        if !d.amount.is_finite() {
            continue;
        }
        *out.entry(d.date.year()).or_insert(0.0) += d.amount;
    }
    out
}

/// Compound annual growth rate (%) over the last `years` yearly totals.
///
/// `None` when fewer than `years` totals exist, when `years < 2`, or when the first total
/// of the window is not positive.
pub fn cagr(yearly_totals: &[f64], years: usize) -> Option<f64> {
    if years < 2 || yearly_totals.len() < years {
        return None;
    }

    let window = &yearly_totals[yearly_totals.len() - years..];
    let first = window[0];
    let last = window[years - 1];
    if !(first > 0.0) || !last.is_finite() {
        return None;
    }

    let out = ((last / first).powf(1.0 / (years as f64 - 1.0)) - 1.0) * 100.0;
    out.is_finite().then_some(out)
}

/// Counts strict year-over-year increases, scanning backward from the most recent year and
/// stopping at the first year that did not increase.
pub fn consecutive_increase_years(dividends: &[DividendObservation]) -> i32 {
    let totals: Vec<f64> = yearly_totals(dividends).into_values().collect();
    consecutive_increases(&totals)
}

pub fn consecutive_increases(yearly_totals: &[f64]) -> i32 {
    if yearly_totals.len() < 2 {
        return 0;
    }

    let mut count = 0;
    for pair in yearly_totals.windows(2).rev() {
        if pair[1] > pair[0] {
            count += 1;
        } else {
            break;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn div(y: i32, m: u32, amount: f64) -> DividendObservation {
        DividendObservation {
            date: NaiveDate::from_ymd_opt(y, m, 15).unwrap(),
            amount,
        }
    }

    #[test]
    fn yearly_totals_bucket_by_calendar_year() {
        let totals = yearly_totals(&[div(2022, 3, 10.0), div(2022, 9, 12.0), div(2023, 3, 15.0)]);
        assert_eq!(totals.get(&2022).copied(), Some(22.0));
        assert_eq!(totals.get(&2023).copied(), Some(15.0));
    }

    #[test]
    fn cagr_matches_formula() {
        let totals = [10.0, 11.0, 12.0, 13.0, 14.641];
        let got = cagr(&totals, 5).unwrap();
        let expected = ((14.641_f64 / 10.0).powf(1.0 / 4.0) - 1.0) * 100.0;
        assert!((got - expected).abs() < 1e-9);
        assert!((got - 10.0).abs() < 1e-6);
    }

    #[test]
    fn cagr_uses_most_recent_window() {
        let totals = [1.0, 100.0, 100.0, 121.0];
        let got = cagr(&totals, 3).unwrap();
        assert!((got - 10.0).abs() < 1e-9);
    }

    #[test]
    fn cagr_undefined_on_short_or_non_positive_series() {
        assert_eq!(cagr(&[1.0, 2.0, 3.0, 4.0], 5), None);
        assert_eq!(cagr(&[0.0, 2.0, 3.0, 4.0, 5.0], 5), None);
        assert_eq!(cagr(&[-1.0, 2.0, 3.0, 4.0, 5.0], 5), None);
        assert_eq!(cagr(&[1.0, 2.0], 1), None);
    }

    #[test]
    fn consecutive_counts_strictly_increasing_series() {
        assert_eq!(consecutive_increases(&[1.0, 2.0, 3.0, 4.0, 5.0]), 4);
        assert_eq!(consecutive_increases(&[5.0, 4.0, 3.0]), 0);
        assert_eq!(consecutive_increases(&[3.0, 3.0, 3.0]), 0);
        assert_eq!(consecutive_increases(&[7.0]), 0);
        assert_eq!(consecutive_increases(&[]), 0);
    }

    #[test]
    fn consecutive_stops_at_first_decrease_from_latest() {
        // 2019..2024: up, down, up, up, up
        let totals = [1.0, 2.0, 1.5, 1.6, 1.7, 1.8];
        assert_eq!(consecutive_increases(&totals), 3);

        let divs = vec![
            div(2020, 6, 1.0),
            div(2021, 6, 2.0),
            div(2022, 6, 1.0),
            div(2023, 6, 3.0),
        ];
        assert_eq!(consecutive_increase_years(&divs), 1);
    }
}
