//! Retry helpers for injected collaborators.
//!
//! The upload engine never retries on its own; a host wraps its url resolver
//! or confirmer in [`Retrying`], or any other call in [`retry`].

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use async_trait::async_trait;
use tokio::time::sleep;
use crate::upload::traits::{Confirmer, UrlResolver};
use crate::upload::types::{Confirmation, UploadId};

#[derive(Debug, Clone)]
pub enum RetryStrategy {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        multiplier: f64,
        max_delay: Duration,
    },
    Linear {
        initial: Duration,
        increment: Duration,
        max_delay: Duration,
    },
}

impl RetryStrategy {
    /// Pause after the failed attempt number `attempt`, zero based
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential { initial, multiplier, max_delay } => {
                let delay = Duration::from_secs_f64(initial.as_secs_f64() * multiplier.powi(attempt as i32));
                delay.min(*max_delay)
            }
            RetryStrategy::Linear { initial, increment, max_delay } => (*initial + *increment * attempt).min(*max_delay),
        }
    }
}

pub struct RetryConfig {
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub should_retry: Box<dyn Fn(&anyhow::Error) -> bool + Send + Sync>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential {
                initial: Duration::from_secs(1),
                multiplier: 2.0,
                max_delay: Duration::from_secs(60),
            },
            should_retry: Box::new(|_| true),
        }
    }
}

/// Runs `operation` until it succeeds, the error is not retryable, or
/// `max_attempts` calls were made. The last error is returned.
pub async fn retry_with_config<F, Fut, T>(config: &RetryConfig, mut operation: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        if attempt + 1 >= max_attempts || !(config.should_retry)(&error) {
            return Err(error);
        }

        let delay = config.strategy.delay_after(attempt);
        tracing::debug!(target: "uploader", attempt, ?delay, error = %format!("{:#}", error), "retrying");
        sleep(delay).await;
        attempt += 1;
    }
}

pub async fn retry<F, Fut, T>(operation: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    retry_with_config(&RetryConfig::default(), operation).await
}

#[derive(Default)]
pub struct RetryBuilder {
    config: RetryConfig,
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.config.should_retry = Box::new(f);
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }

    /// Wraps a collaborator so every call goes through this policy
    pub fn wrap<C>(self, inner: C) -> Retrying<C> {
        Retrying::new(inner, self.config)
    }
}

/// Collaborator whose calls are retried under a [`RetryConfig`]
pub struct Retrying<C> {
    inner: C,
    config: RetryConfig,
}

impl<C> Retrying<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<C: UrlResolver> UrlResolver for Retrying<C> {
    async fn upload_urls(&self, ids: Vec<UploadId>) -> anyhow::Result<HashMap<UploadId, String>> {
        retry_with_config(&self.config, || self.inner.upload_urls(ids.clone())).await
    }
}

#[async_trait]
impl<C: Confirmer> Confirmer for Retrying<C> {
    async fn confirm(&self, id: UploadId) -> anyhow::Result<Confirmation> {
        retry_with_config(&self.config, || self.inner.confirm(id.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let count = AtomicU32::new(0);
        let result = retry(|| async {
            if count.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("timeout")
            }
            Ok(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_retry_stops_early() {
        let count = AtomicU32::new(0);
        let config = RetryBuilder::new()
            .max_attempts(5)
            .strategy(RetryStrategy::Fixed(Duration::from_millis(10)))
            .should_retry(|error| !error.to_string().contains("fatal"))
            .build();

        let result = retry_with_config(&config, || async {
            count.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("fatal"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_resolver() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = move |ids: Vec<UploadId>| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    anyhow::bail!("503");
                }
                Ok(ids.into_iter().map(|id| (id, "https://x".to_string())).collect::<HashMap<_, _>>())
            }
        };

        let resolver = RetryBuilder::new()
            .strategy(RetryStrategy::Fixed(Duration::from_millis(100)))
            .wrap(flaky);

        let urls = resolver.upload_urls(vec!["a".into()]).await.unwrap();
        assert_eq!(urls[&UploadId::from("a")], "https://x");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_confirmer_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let down = move |_id: UploadId| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Confirmation, _>(anyhow::anyhow!("unreachable")) }
        };

        let confirmer = RetryBuilder::new().max_attempts(2).wrap(down);
        assert!(confirmer.confirm("a".into()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delays() {
        let linear = RetryStrategy::Linear {
            initial: Duration::from_secs(1),
            increment: Duration::from_secs(2),
            max_delay: Duration::from_secs(4),
        };
        assert_eq!(linear.delay_after(0), Duration::from_secs(1));
        assert_eq!(linear.delay_after(1), Duration::from_secs(3));
        assert_eq!(linear.delay_after(5), Duration::from_secs(4));

        let exponential = RetryStrategy::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(exponential.delay_after(3), Duration::from_secs(8));
        assert_eq!(exponential.delay_after(10), Duration::from_secs(60));
    }
}
