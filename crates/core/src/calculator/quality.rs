/// Dividend quality score in `[0, 100]`.
///
/// Yield contributes up to 40 points, stability (coefficient of variation) up to 30 and the
/// yield trend up to 30. A detected special dividend costs 10 points.
pub fn quality_score(
    avg_yield: Option<f64>,
    cv: Option<f64>,
    trend: Option<f64>,
    has_special_dividend: bool,
) -> Option<f64> {
    let (avg_yield, cv, trend) = (avg_yield?, cv?, trend?);
    if avg_yield.is_nan() || cv.is_nan() || trend.is_nan() {
        return None;
    }

    let yield_points = if avg_yield >= 5.0 {
        40.0
    } else if avg_yield >= 4.0 {
        35.0
    } else if avg_yield >= 3.0 {
        30.0
    } else if avg_yield >= 2.0 {
        20.0
    } else {
        10.0
    };

    let stability_points = if cv <= 0.15 {
        30.0
    } else if cv <= 0.25 {
        25.0
    } else if cv <= 0.35 {
        20.0
    } else if cv <= 0.50 {
        10.0
    } else {
        0.0
    };

    let trend_points = if trend > 0.3 {
        30.0
    } else if trend > 0.15 {
        25.0
    } else if trend > 0.0 {
        20.0
    } else if trend > -0.15 {
        10.0
    } else {
        0.0
    };

    let penalty = if has_special_dividend { 10.0 } else { 0.0 };

    let score: f64 = yield_points + stability_points + trend_points - penalty;
    Some(score.clamp(0.0, 100.0))
}
