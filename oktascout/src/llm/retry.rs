//! Bounded retry with exponential backoff and jitter around a chat model.
//!
//! Only retryable errors (transport, 5xx, rate limit) re-enter the loop; a
//! rate-limit wait hint overrides the computed backoff. Exhaustion returns
//! the last error unchanged so the caller keeps the real kind.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::AgentError;
use crate::llm::{ChatModel, ChatRequest, LlmResponse};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 0.0–1.0 fraction of the delay randomized to avoid thundering herds.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before retry number `attempt` (0-based), jittered.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jitter_span = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_span > 0.0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// [`ChatModel`] decorator applying [`RetryConfig`] to an inner driver.
pub struct RetryingChat {
    inner: Box<dyn ChatModel>,
    config: RetryConfig,
}

impl RetryingChat {
    pub fn new(inner: Box<dyn ChatModel>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl ChatModel for RetryingChat {
    async fn invoke(&self, request: &ChatRequest) -> Result<LlmResponse, AgentError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.invoke(request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    let delay = match &err {
                        AgentError::LlmRateLimited {
                            wait_seconds: Some(s),
                        } => Duration::from_secs(*s),
                        _ => self.config.delay_for(attempt),
                    };
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chat call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
