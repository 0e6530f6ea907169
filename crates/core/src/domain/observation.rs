use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One dividend payment (ex-date, amount per share).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DividendObservation {
    pub date: NaiveDate,
    pub amount: f64,
}

/// Daily OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub date: NaiveDate,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

/// Point-in-time fundamentals. Every field is optional because providers routinely omit them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fundamentals {
    #[serde(default)]
    pub trailing_eps: Option<f64>,
    /// Annual dividend per share.
    #[serde(default)]
    pub dividend_rate: Option<f64>,
    #[serde(default)]
    pub shares_outstanding: Option<f64>,
    #[serde(default)]
    pub free_cash_flow: Option<f64>,
    /// Cash-flow-statement dividends paid. Providers report it negative; the sign is ignored.
    #[serde(default)]
    pub dividends_paid: Option<f64>,
}

/// Everything the calculator needs for one ticker, as returned by a market data gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub ticker: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub dividends: Vec<DividendObservation>,
    #[serde(default)]
    pub prices: Vec<PriceObservation>,
    #[serde(default)]
    pub fundamentals: Fundamentals,
}

impl MarketSnapshot {
    pub fn empty(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            company_name: None,
            dividends: Vec::new(),
            prices: Vec::new(),
            fundamentals: Fundamentals::default(),
        }
    }

    /// Sorts both series by date and drops observations that cannot be used
    /// (non-finite values, negative dividends, non-positive closes).
    pub fn sanitized(mut self) -> Self {
        self.dividends
            .retain(|d| d.amount.is_finite() && d.amount >= 0.0);
        self.dividends.sort_by_key(|d| d.date);

        self.prices.retain(|p| p.close.is_finite() && p.close > 0.0);
        self.prices.sort_by_key(|p| p.date);
        self
    }

    pub fn latest_close(&self) -> Option<f64> {
        self.prices.iter().max_by_key(|p| p.date).map(|p| p.close)
    }

    pub fn display_name(&self) -> &str {
        self.company_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.ticker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn close_at(date: NaiveDate, close: f64) -> PriceObservation {
        PriceObservation {
            date,
            open: None,
            high: None,
            low: None,
            close,
            volume: None,
        }
    }

    #[test]
    fn sanitize_drops_unusable_rows_and_sorts() {
        let snap = MarketSnapshot {
            ticker: "8058.T".to_string(),
            company_name: Some("  ".to_string()),
            dividends: vec![
                DividendObservation { date: d(2024, 9, 1), amount: 50.0 },
                DividendObservation { date: d(2024, 3, 1), amount: f64::NAN },
                DividendObservation { date: d(2023, 9, 1), amount: -1.0 },
                DividendObservation { date: d(2023, 3, 1), amount: 40.0 },
            ],
            prices: vec![
                close_at(d(2024, 1, 5), 0.0),
                close_at(d(2024, 1, 4), 10.0),
            ],
            fundamentals: Fundamentals::default(),
        }
        .sanitized();

        assert_eq!(snap.dividends.len(), 2);
        assert_eq!(snap.dividends[0].date, d(2023, 3, 1));
        assert_eq!(snap.prices.len(), 1);
        assert_eq!(snap.latest_close(), Some(10.0));
        assert_eq!(snap.display_name(), "8058.T");
    }

    #[test]
    fn deserializes_minimal_payload() {
        let v = serde_json::json!({
            "ticker": "2914.T",
            "dividends": [{"date": "2024-06-27", "amount": 97.0}],
            "prices": [{"date": "2024-01-04", "close": 4000.0}]
        });
        let snap: MarketSnapshot = serde_json::from_value(v).unwrap();
        assert_eq!(snap.dividends.len(), 1);
        assert_eq!(snap.prices[0].open, None);
        assert_eq!(snap.fundamentals, Fundamentals::default());
    }
}
