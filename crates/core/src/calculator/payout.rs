use crate::domain::{Fundamentals, PayoutStatus};

/// Dividend per share as a percentage of EPS.
///
/// `None` when either input is missing or non-positive.
pub fn payout_ratio(
    dividend_per_share: Option<f64>,
    eps: Option<f64>,
) -> Option<(f64, PayoutStatus)> {
    ratio_with_status(dividend_per_share?, eps?)
}

/// Dividends paid as a percentage of free cash flow.
///
/// Uses the cash-flow-statement figure when present, otherwise
/// `dividend_rate * shares_outstanding`.
pub fn fcf_payout_ratio(fundamentals: &Fundamentals) -> Option<(f64, PayoutStatus)> {
    let paid = dividends_paid(fundamentals)?;
    ratio_with_status(paid, fundamentals.free_cash_flow?)
}

pub fn dividends_paid(fundamentals: &Fundamentals) -> Option<f64> {
    let direct = fundamentals
        .dividends_paid
        .map(f64::abs)
        .filter(|v| v.is_finite() && *v > 0.0);
    if direct.is_some() {
        return direct;
    }

    let rate = fundamentals.dividend_rate?;
    let shares = fundamentals.shares_outstanding?;
    let derived = rate * shares;
    (derived.is_finite() && derived > 0.0).then_some(derived)
}

fn ratio_with_status(numerator: f64, denominator: f64) -> Option<(f64, PayoutStatus)> {
    if !(numerator > 0.0) || !(denominator > 0.0) {
        return None;
    }
    let ratio = numerator / denominator * 100.0;
    if !ratio.is_finite() {
        return None;
    }
    Some((ratio, PayoutStatus::from_ratio(ratio)))
}
