use crate::config::RetryConfig;
use std::{fmt::Debug, future::Future};
use tokio::time::{sleep, Duration};

/// Errors that may succeed when the same request is sent again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: u32,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor.max(1),
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1,
        }
    }

    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, E>
    where
        E: Transient + Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry_delay = self.initial_delay;
        let mut retry_count = 0;

        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && retry_count < self.max_retries => {
                    retry_count += 1;
                    tracing::warn!(
                        "{} failed with a transient error, retrying (attempt {}/{}): {:?}",
                        operation,
                        retry_count,
                        self.max_retries,
                        err
                    );
                    let jitter = rand::random::<f32>() * 0.2 + 0.9;
                    sleep(retry_delay.mul_f32(jitter)).await;
                    retry_delay = (retry_delay * self.backoff_factor).min(self.max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
