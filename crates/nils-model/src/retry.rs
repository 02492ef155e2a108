// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::provider::{EventStream, ModelProvider};
use crate::types::{CompletionRequest, ProviderError};

/// Bounded exponential backoff for provider-layer transient errors.
/// Tool execution is never retried; this applies only to opening the
/// completion stream.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        exp.min(self.max_delay)
    }
}

/// Open a completion stream, retrying transient failures.  Cancellation is
/// observed while sleeping between attempts; a fired token surfaces as a
/// `Network` error that the engine maps to `Aborted` via its own token
/// check.
pub async fn complete_with_retry(
    provider: &dyn ModelProvider,
    req: CompletionRequest,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<EventStream, ProviderError> {
    let mut attempt = 0u32;
    loop {
        match provider.complete(req.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient provider error, retrying: {e}"
                );
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ProviderError::Network("cancelled during retry".into()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FlakyProvider;

    #[test]
    fn delay_grows_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(0), Duration::from_millis(500));
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(10), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let provider = FlakyProvider::new(3, "recovered");
        let cancel = CancellationToken::new();
        let stream = complete_with_retry(
            &provider,
            CompletionRequest::default(),
            RetryPolicy::default(),
            &cancel,
        )
        .await;
        assert!(stream.is_ok());
        assert_eq!(provider.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let provider = FlakyProvider::new(u32::MAX, "never");
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let result =
            complete_with_retry(&provider, CompletionRequest::default(), policy, &cancel).await;
        assert!(result.is_err());
        assert_eq!(provider.attempts(), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_the_backoff_sleep() {
        let provider = FlakyProvider::new(u32::MAX, "never");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = complete_with_retry(
            &provider,
            CompletionRequest::default(),
            RetryPolicy::default(),
            &cancel,
        )
        .await;
        assert!(result.is_err());
        // First attempt runs, then the sleep is interrupted.
        assert_eq!(provider.attempts(), 1);
    }
}
