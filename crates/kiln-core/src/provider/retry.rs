use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{self, KilnError};
use crate::message::Message;
use crate::provider::{BoxStream, GenerateOptions, GenerateResult, Provider};
use crate::tool::Tool;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// A provider wrapper that adds retry logic with exponential backoff.
///
/// Only opening a stream is retried. Once frames flow, a failure belongs
/// to the caller.
pub struct RetryProvider {
    inner: Arc<dyn Provider>,
    config: RetryConfig,
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn Provider>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn wrap(inner: Arc<dyn Provider>) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let clamped = delay.min(self.config.max_delay_ms as f64) as u64;
        Duration::from_millis(clamped)
    }

    async fn backoff(&self, attempt: u32, error: &KilnError) -> bool {
        if attempt >= self.config.max_retries || !error.is_retryable() {
            return false;
        }
        let delay = self.delay_for_attempt(attempt);
        warn!(
            provider = self.inner.name(),
            attempt = attempt + 1,
            max = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after error"
        );
        tokio::time::sleep(delay).await;
        true
    }
}

#[async_trait]
impl Provider for RetryProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn generate(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &GenerateOptions,
    ) -> error::Result<GenerateResult> {
        let mut attempt = 0;
        loop {
            match self.inner.generate(messages, tools, options).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !self.backoff(attempt, &e).await {
                        return Err(e);
                    }
                }
            }
            attempt += 1;
        }
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &GenerateOptions,
    ) -> error::Result<BoxStream> {
        let mut attempt = 0;
        loop {
            match self.inner.stream(messages, tools, options).await {
                Ok(stream) => {
                    debug!(provider = self.inner.name(), "Stream established");
                    return Ok(stream);
                }
                Err(e) => {
                    if !self.backoff(attempt, &e).await {
                        return Err(e);
                    }
                }
            }
            attempt += 1;
        }
    }
}
