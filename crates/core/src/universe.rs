use anyhow::Context;

/// Default set of tickers to refresh or screen.
#[async_trait::async_trait]
pub trait UniverseProvider: Send + Sync {
    async fn tickers(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct UniverseOptions {
    /// Restrict to these market segments (e.g. "prime"). Empty means every listed ticker.
    pub markets: Vec<String>,
}

impl UniverseOptions {
    pub fn from_env() -> Self {
        let markets = std::env::var("UNIVERSE_MARKETS")
            .ok()
            .map(|s| parse_list(&s))
            .unwrap_or_default();
        Self { markets }
    }
}

/// Splits a comma separated list, trimming and dropping empties and duplicates.
pub fn parse_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !out.iter().any(|x| x == item) {
            out.push(item.to_string());
        }
    }
    out
}

/// Tickers from the `stocks` table.
#[derive(Debug, Clone)]
pub struct PgUniverse {
    pool: sqlx::PgPool,
    opts: UniverseOptions,
}

impl PgUniverse {
    pub fn new(pool: sqlx::PgPool, opts: UniverseOptions) -> Self {
        Self { pool, opts }
    }
}

#[async_trait::async_trait]
impl UniverseProvider for PgUniverse {
    async fn tickers(&self) -> anyhow::Result<Vec<String>> {
        let markets: Option<Vec<String>> = (!self.opts.markets.is_empty())
            .then(|| self.opts.markets.iter().map(|m| m.to_lowercase()).collect());

        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT ticker FROM stocks \
             WHERE ($1::text[] IS NULL OR LOWER(market) = ANY($1)) \
             ORDER BY ticker",
        )
        .persistent(false)
        .bind(markets)
        .fetch_all(&self.pool)
        .await
        .context("select stocks universe failed")?;

        Ok(rows.into_iter().map(|(t,)| t).collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticUniverse {
    tickers: Vec<String>,
}

impl StaticUniverse {
    pub fn new<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tickers: tickers.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait::async_trait]
impl UniverseProvider for StaticUniverse {
    async fn tickers(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.tickers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_trims_and_dedups() {
        assert_eq!(
            parse_list(" 7203.T, 8058.T,,7203.T ,9432.T"),
            vec!["7203.T", "8058.T", "9432.T"]
        );
        assert!(parse_list("  ").is_empty());
    }

    #[tokio::test]
    async fn static_universe_returns_given_order() {
        let u = StaticUniverse::new(["b", "a"]);
        assert_eq!(u.tickers().await.unwrap(), vec!["b".to_string(), "a".to_string()]);
    }
}
