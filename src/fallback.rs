//! Fallback Engine
//!
//! Walks an ordered chain of model references and branches on the
//! [`ErrorClass`] of each failure:
//! - `Configuration`: skip the candidate, nothing recorded
//! - `Quota` / `Remote`: record as the latest failure, move on (or retry the
//!   same model with a fresh key when the failure was key-scoped and the
//!   policy allows more attempts)
//! - `Parse`: the provider broke the response contract; surface immediately
//!
//! Same-model retries wait `retry_backoff`, doubling per retry up to
//! [`MAX_RETRY_BACKOFF`]. The first success wins. An exhausted chain returns the latest recorded
//! failure, or [`CompletionError::NoUsableProvider`] when everything was skipped.

use crate::dispatcher::CompletionOptions;
use crate::error::{CompletionError, ErrorClass};
use crate::models::{CompletionRequest, CompletionResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Initial wait before retrying the same model
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound for one backoff wait
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// A single resolve → claim → dispatch attempt for one model reference.
#[async_trait]
pub trait AttemptExecutor: Send + Sync {
    async fn attempt(
        &self,
        reference: &str,
        request: &CompletionRequest,
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, CompletionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackPolicy {
    /// Attempts per model before moving on. Only key-scoped failures (auth,
    /// provider 429, transient) consume extra attempts.
    pub attempts_per_model: u32,

    /// Wait before the first same-model retry
    pub retry_backoff: Duration,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            attempts_per_model: 1,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl FallbackPolicy {
    pub fn with_attempts_per_model(attempts: u32) -> Self {
        Self {
            attempts_per_model: attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Wait before retry number `retry` (1-based) of the same model.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.retry_backoff
            .checked_mul(factor)
            .unwrap_or(MAX_RETRY_BACKOFF)
            .min(MAX_RETRY_BACKOFF)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackEngine {
    policy: FallbackPolicy,
}

impl FallbackEngine {
    pub fn new(policy: FallbackPolicy) -> Self {
        Self { policy }
    }

    pub async fn run<E, S>(
        &self,
        executor: &E,
        chain: &[S],
        request: &CompletionRequest,
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, CompletionError>
    where
        E: AttemptExecutor + ?Sized,
        S: AsRef<str> + Sync,
    {
        let max_attempts = self.policy.attempts_per_model.max(1);
        let mut last_failure: Option<CompletionError> = None;

        for (position, reference) in chain.iter().enumerate() {
            let reference = reference.as_ref();
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                let err = match executor.attempt(reference, request, options).await {
                    Ok(response) => {
                        if position > 0 || attempt > 1 {
                            tracing::info!(
                                model = %reference,
                                position,
                                attempt,
                                "Fallback candidate succeeded"
                            );
                        }
                        return Ok(response);
                    }
                    Err(err) => err,
                };

                match err.class() {
                    ErrorClass::Configuration => {
                        tracing::debug!(model = %reference, error = %err, "Skipping candidate");
                        break;
                    }
                    ErrorClass::Parse => return Err(err),
                    ErrorClass::Quota | ErrorClass::Remote => {
                        let retry = err.is_key_scoped() && attempt < max_attempts;
                        tracing::warn!(
                            model = %reference,
                            attempt,
                            retry,
                            error = %err,
                            "Candidate failed"
                        );
                        last_failure = Some(err);
                        if !retry {
                            break;
                        }
                        let wait = self.policy.backoff_for(attempt);
                        if !wait.is_zero() {
                            tokio::time::sleep(wait).await;
                        }
                    }
                }
            }
        }

        Err(last_failure.unwrap_or(CompletionError::NoUsableProvider))
    }
}
