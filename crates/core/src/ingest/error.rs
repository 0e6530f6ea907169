use thiserror::Error;

/// Failures surfaced by a market data gateway.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited by provider (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("network error: {0}")]
    Network(String),

    #[error("provider request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("provider HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("ticker not found: {ticker}")]
    NotFound { ticker: String },

    #[error("provider response format changed: {0}")]
    ResponseFormat(String),
}

/// How the refresh pipeline should treat a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Transient,
    Terminal,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Terminal)
    }
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "too many requests",
    "rate limit",
    "rate-limit",
    "ratelimit",
    "429",
];

/// Classifies an error from a gateway call.
///
/// Typed `ProviderError`s are classified by variant; anything else falls back to matching the
/// rendered message against known rate-limit phrases.
pub fn classify(err: &anyhow::Error) -> FailureKind {
    if let Some(provider_err) = err.downcast_ref::<ProviderError>() {
        return match provider_err {
            ProviderError::RateLimited { .. } => FailureKind::RateLimited,
            ProviderError::Network(_) | ProviderError::Timeout(_) => FailureKind::Transient,
            ProviderError::Upstream { status, body } => {
                if message_looks_rate_limited(body) {
                    FailureKind::RateLimited
                } else if *status >= 500 {
                    FailureKind::Transient
                } else {
                    FailureKind::Terminal
                }
            }
            ProviderError::NotFound { .. } | ProviderError::ResponseFormat(_) => {
                FailureKind::Terminal
            }
        };
    }

    if message_looks_rate_limited(&format!("{err:#}")) {
        FailureKind::RateLimited
    } else {
        FailureKind::Terminal
    }
}

pub fn message_looks_rate_limited(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classifies_typed_errors() {
        let rl = anyhow::Error::new(ProviderError::RateLimited { retry_after_secs: Some(30) });
        assert_eq!(classify(&rl), FailureKind::RateLimited);

        let net = anyhow::Error::new(ProviderError::Network("connection reset".into()));
        assert_eq!(classify(&net), FailureKind::Transient);

        let upstream = anyhow::Error::new(ProviderError::Upstream {
            status: 503,
            body: "unavailable".into(),
        });
        assert_eq!(classify(&upstream), FailureKind::Transient);

        let not_found = anyhow::Error::new(ProviderError::NotFound { ticker: "X".into() });
        assert_eq!(classify(&not_found), FailureKind::Terminal);
    }

    #[test]
    fn classifies_typed_errors_through_context() {
        let err = Err::<(), _>(ProviderError::RateLimited { retry_after_secs: None })
            .context("fetch 7203.T failed")
            .unwrap_err();
        assert_eq!(classify(&err), FailureKind::RateLimited);
    }

    #[test]
    fn classifies_untyped_errors_by_message() {
        let err = anyhow::anyhow!("Too Many Requests. Rate limited. Try after a while.");
        assert_eq!(classify(&err), FailureKind::RateLimited);

        let err = anyhow::anyhow!("upstream said HTTP 429");
        assert_eq!(classify(&err), FailureKind::RateLimited);

        let err = anyhow::anyhow!("division by zero");
        assert_eq!(classify(&err), FailureKind::Terminal);
        assert!(!classify(&err).is_retryable());
    }
}
