use crate::config::env_or;
use crate::ingest::{classify, FailureKind, ProviderError};
use crate::refresh::pacer::Pacer;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Attempts within the regular budget, including the first.
    pub max_attempts: u32,
    /// Fraction of each delay added or removed at random. 0 disables jitter.
    pub jitter: f64,
    /// One extra attempt after this wait when the budget ends on a rate limit.
    pub final_wait: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
            jitter: 0.1,
            final_wait: Some(Duration::from_secs(60)),
        }
    }
}

impl BackoffPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();

        let final_wait_secs: u64 =
            env_or("BACKOFF_FINAL_WAIT_SECS", d.final_wait.map_or(0, |w| w.as_secs()));

        Self {
            base_delay: Duration::from_millis(env_or(
                "BACKOFF_BASE_MS",
                d.base_delay.as_millis() as u64,
            )),
            multiplier: finite_or(env_or("BACKOFF_MULTIPLIER", d.multiplier), d.multiplier)
                .max(1.0),
            max_delay: Duration::from_millis(env_or(
                "BACKOFF_MAX_MS",
                d.max_delay.as_millis() as u64,
            )),
            max_attempts: env_or("BACKOFF_MAX_ATTEMPTS", d.max_attempts).max(1),
            jitter: finite_or(env_or("BACKOFF_JITTER", d.jitter), d.jitter).clamp(0.0, 1.0),
            final_wait: (final_wait_secs > 0).then(|| Duration::from_secs(final_wait_secs)),
        }
    }

    /// Delay after the `attempt`-th failure (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before retrying after `err`. A provider `Retry-After` can lengthen the delay but
    /// never past `max_delay`.
    fn retry_delay(&self, attempt: u32, err: &anyhow::Error) -> Duration {
        let hinted = retry_after(err).min(self.max_delay);
        self.jittered(self.delay_for(attempt).max(hinted))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !(self.jitter > 0.0) || !self.jitter.is_finite() || delay.is_zero() {
            return delay;
        }
        let jitter = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails terminally, or the budget is spent.
    ///
    /// Every attempt first passes `pacer`. Returns the final result and the number of attempts
    /// made.
    pub async fn run<T, F, Fut>(
        &self,
        pacer: &Pacer,
        label: &str,
        mut op: F,
    ) -> (anyhow::Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            pacer.wait().await;

            let err = match op(attempt).await {
                Ok(v) => {
                    if attempt > 1 {
                        tracing::info!(label, attempt, "provider call recovered after retries");
                    }
                    return (Ok(v), attempt);
                }
                Err(err) => err,
            };

            let kind = classify(&err);
            if !kind.is_retryable() {
                return (Err(err), attempt);
            }

            if attempt < max_attempts {
                let delay = self.retry_delay(attempt, &err);
                tracing::warn!(
                    label,
                    attempt,
                    max_attempts,
                    ?kind,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "provider call failed; retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if kind == FailureKind::RateLimited {
                if let Some(wait) = self.final_wait {
                    tracing::warn!(
                        label,
                        attempt,
                        wait_secs = wait.as_secs(),
                        "rate limit persisted; final attempt after long wait"
                    );
                    tokio::time::sleep(wait).await;
                    pacer.wait().await;
                    attempt += 1;
                    return (op(attempt).await, attempt);
                }
            }

            return (Err(err), attempt);
        }
    }
}

fn finite_or(v: f64, default: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        default
    }
}

fn retry_after(err: &anyhow::Error) -> Duration {
    match err.downcast_ref::<ProviderError>() {
        Some(ProviderError::RateLimited {
            retry_after_secs: Some(secs),
        }) => Duration::from_secs(*secs),
        _ => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(final_wait: Option<Duration>) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
            max_attempts: 3,
            jitter: 0.0,
            final_wait,
        }
    }

    fn rate_limited() -> anyhow::Error {
        ProviderError::RateLimited { retry_after_secs: None }.into()
    }

    #[test]
    fn delay_grows_and_caps() {
        let p = BackoffPolicy {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            ..BackoffPolicy::default()
        };
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
        assert_eq!(p.delay_for(3), Duration::from_secs(8));
        assert_eq!(p.delay_for(4), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let p = BackoffPolicy {
            jitter: 0.2,
            ..BackoffPolicy::default()
        };
        for _ in 0..100 {
            let d = p.jittered(Duration::from_secs(10)).as_secs_f64();
            assert!((8.0..=12.0).contains(&d));
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let pacer = Pacer::new(Duration::ZERO);
        let (res, attempts) = fast_policy(None)
            .run(&pacer, "7203.T", |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Network("reset".into()).into())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let pacer = Pacer::new(Duration::ZERO);
        let (res, attempts) = fast_policy(Some(Duration::from_millis(1)))
            .run(&pacer, "7203.T", |_| async {
                Err::<(), _>(ProviderError::NotFound { ticker: "7203.T".into() }.into())
            })
            .await;

        assert!(res.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_gets_exactly_one_final_attempt() {
        let calls = AtomicU32::new(0);
        let pacer = Pacer::new(Duration::ZERO);
        let (res, attempts) = fast_policy(Some(Duration::from_millis(2)))
            .run(&pacer, "7203.T", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(rate_limited())
            })
            .await;

        assert!(res.is_err());
        assert_eq!(attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn final_attempt_can_succeed() {
        let calls = AtomicU32::new(0);
        let pacer = Pacer::new(Duration::ZERO);
        let (res, attempts) = fast_policy(Some(Duration::from_millis(2)))
            .run(&pacer, "7203.T", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 4 {
                        Err(rate_limited())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(res.unwrap(), 4);
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn exhausted_transient_errors_skip_final_wait() {
        let calls = AtomicU32::new(0);
        let pacer = Pacer::new(Duration::ZERO);
        let (res, attempts) = fast_policy(Some(Duration::from_secs(3600)))
            .run(&pacer, "7203.T", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(
                    ProviderError::Upstream {
                        status: 503,
                        body: "down".into(),
                    }
                    .into(),
                )
            })
            .await;

        assert!(res.is_err());
        assert_eq!(attempts, 3);
    }

    #[test]
    fn retry_after_is_capped_by_max_delay() {
        let p = BackoffPolicy::default();
        let err: anyhow::Error = ProviderError::RateLimited {
            retry_after_secs: Some(u64::MAX),
        }
        .into();
        for _ in 0..100 {
            let d = p.retry_delay(1, &err);
            assert!(d <= p.max_delay.mul_f64(1.0 + p.jitter));
        }

        let short: anyhow::Error = ProviderError::RateLimited {
            retry_after_secs: Some(30),
        }
        .into();
        let p = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(p.retry_delay(1, &short), Duration::from_secs(30));
    }

    #[test]
    fn non_finite_jitter_disables_jitter() {
        let p = BackoffPolicy {
            jitter: f64::NAN,
            ..BackoffPolicy::default()
        };
        assert_eq!(p.jittered(Duration::from_secs(4)), Duration::from_secs(4));

        std::env::set_var("BACKOFF_JITTER", "NaN");
        let from_env = BackoffPolicy::from_env();
        std::env::remove_var("BACKOFF_JITTER");
        assert_eq!(from_env.jitter, BackoffPolicy::default().jitter);
    }

    #[tokio::test]
    async fn long_retry_after_does_not_stall_the_entity() {
        let pacer = Pacer::new(Duration::ZERO);
        let started = std::time::Instant::now();
        let (res, attempts) = fast_policy(None)
            .run(&pacer, "7203.T", |_| async {
                Err::<(), _>(
                    ProviderError::RateLimited {
                        retry_after_secs: Some(86_400),
                    }
                    .into(),
                )
            })
            .await;

        assert!(res.is_err());
        assert_eq!(attempts, 3);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
