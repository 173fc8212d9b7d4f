// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Per-category retry policies with exponential backoff and full jitter,
//! composed in front of a per-backend circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ErrorCategory, ErrorClassifier, ErrorHandler};

/// Tunable base parameters; category policies are derived from these, not
/// configured independently per category.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

/// A fully resolved retry policy for one error category.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
}

impl RetryPolicy {
    /// `raw = baseDelay * backoffMultiplier^(attempt-1)`, capped at
    /// `max_delay`, then full jitter: `uniform(0, delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32 - 1);
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);
        let delay = if self.jitter_enabled {
            rand::thread_rng().gen_range(0.0..=capped.max(f64::MIN_POSITIVE))
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }
}

/// Derives the per-category policy table from the base `RetryConfig`,
/// exactly as spec.md §4.C's table describes.
pub fn policy_for(category: ErrorCategory, base: &RetryConfig) -> RetryPolicy {
    let b = base.base_max_attempts;
    match category {
        ErrorCategory::Transient => RetryPolicy {
            enabled: true,
            max_attempts: b,
            base_delay: base.base_delay,
            max_delay: base.max_delay,
            backoff_multiplier: base.backoff_multiplier,
            jitter_enabled: base.jitter_enabled,
        },
        ErrorCategory::RateLimit => RetryPolicy {
            enabled: true,
            max_attempts: b.max(5),
            base_delay: base.base_delay * 2,
            max_delay: (base.max_delay * 2).min(Duration::from_secs(300)),
            backoff_multiplier: base.backoff_multiplier,
            jitter_enabled: true,
        },
        ErrorCategory::System => RetryPolicy {
            enabled: true,
            max_attempts: b,
            base_delay: base.base_delay,
            max_delay: base.max_delay,
            backoff_multiplier: base.backoff_multiplier,
            jitter_enabled: base.jitter_enabled,
        },
        ErrorCategory::Timeout => RetryPolicy {
            enabled: true,
            max_attempts: b.saturating_sub(1).max(2),
            base_delay: base.base_delay.div_f64(2.0),
            max_delay: base.max_delay.min(Duration::from_secs(30)),
            backoff_multiplier: base.backoff_multiplier,
            jitter_enabled: true,
        },
        ErrorCategory::Authentication | ErrorCategory::User | ErrorCategory::Permanent => {
            RetryPolicy {
                enabled: false,
                max_attempts: 0,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                backoff_multiplier: 1.0,
                jitter_enabled: false,
            }
        }
        ErrorCategory::Network | ErrorCategory::Unknown => RetryPolicy {
            enabled: true,
            max_attempts: b.saturating_sub(1).max(2),
            base_delay: base.base_delay,
            max_delay: base.max_delay,
            backoff_multiplier: base.backoff_multiplier,
            jitter_enabled: true,
        },
    }
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    /// The breaker was open before the first attempt; the op never ran.
    CircuitOpen,
    /// All permitted attempts were exhausted (or the error was not
    /// retryable); carries the last error message.
    Exhausted(String),
}

/// `Execute(op, service, operation) -> value or last error`, composed as
/// `retry(breaker-gated(op))`. The engine iterates up to the maximum
/// `max_attempts` across all categories, since a policy that extends
/// attempts (rate-limit) can be honored if the error's category changes
/// between attempts; effective attempts for a run of one category are still
/// bounded by that category's own policy.
pub struct RetryEngine {
    config: RetryConfig,
    classifier: Arc<ErrorClassifier>,
    handler: Arc<ErrorHandler>,
}

impl RetryEngine {
    pub fn new(config: RetryConfig, classifier: Arc<ErrorClassifier>, handler: Arc<ErrorHandler>) -> Self {
        Self {
            config,
            classifier,
            handler,
        }
    }

    pub async fn execute<F, Fut, T>(
        &self,
        service: &str,
        operation: &str,
        breaker: &CircuitBreaker,
        mut op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        if !breaker.allow().await {
            debug!(service, operation, "circuit open, skipping attempt");
            return RetryOutcome::CircuitOpen;
        }

        let ceiling = self.iteration_ceiling();
        let mut last_error = String::new();

        for attempt in 1..=ceiling {
            match op().await {
                Ok(value) => {
                    breaker.record_success().await;
                    return RetryOutcome::Success(value);
                }
                Err(error) => {
                    let classification = self.classifier.classify(&error, None);
                    self.handler.handle(&error, None);
                    breaker.record_failure(classification.category).await;
                    last_error = error;

                    let policy = policy_for(classification.category, &self.config);
                    if !policy.enabled || attempt >= policy.max_attempts {
                        warn!(
                            service,
                            operation,
                            attempt,
                            category = classification.category.as_str(),
                            "retry exhausted"
                        );
                        break;
                    }

                    if !breaker.allow().await {
                        debug!(service, operation, attempt, "circuit opened mid-retry");
                        break;
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        service,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        RetryOutcome::Exhausted(last_error)
    }

    fn iteration_ceiling(&self) -> u32 {
        [
            ErrorCategory::Transient,
            ErrorCategory::RateLimit,
            ErrorCategory::System,
            ErrorCategory::Timeout,
            ErrorCategory::Network,
            ErrorCategory::Unknown,
        ]
        .iter()
        .map(|c| policy_for(*c, &self.config).max_attempts)
        .max()
        .unwrap_or(self.config.base_max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> RetryEngine {
        RetryEngine::new(
            RetryConfig::default(),
            Arc::new(ErrorClassifier::new()),
            Arc::new(ErrorHandler::new(false)),
        )
    }

    #[tokio::test]
    async fn authentication_error_is_not_retried() {
        let engine = engine();
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        let calls = AtomicU32::new(0);

        let outcome = engine
            .execute("svc", "op", &breaker, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("401 Unauthorized".to_string()) }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Exhausted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_transient_error_retries_to_max_attempts() {
        let mut config = RetryConfig::default();
        config.base_delay = Duration::from_millis(1);
        config.max_delay = Duration::from_millis(2);
        let engine = RetryEngine::new(config, Arc::new(ErrorClassifier::new()), Arc::new(ErrorHandler::new(false)));
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig {
            failure_threshold: 100,
            ..CircuitBreakerConfig::default()
        });
        let calls = AtomicU32::new(0);

        let outcome = engine
            .execute("svc", "op", &breaker, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("Service temporarily unavailable".to_string()) }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Exhausted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn circuit_open_skips_the_operation_entirely() {
        let engine = engine();
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        breaker.record_failure(ErrorCategory::System).await;
        let calls = AtomicU32::new(0);

        let outcome = engine
            .execute("svc", "op", &breaker, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn jitter_bounds_hold() {
        let config = RetryConfig::default();
        let policy = policy_for(ErrorCategory::Transient, &config);
        for attempt in 1..=5 {
            let bound = (config.base_delay.as_secs_f64() * config.backoff_multiplier.powi(attempt - 1))
                .min(config.max_delay.as_secs_f64());
            for _ in 0..20 {
                let delay = policy.delay_for_attempt(attempt as u32).as_secs_f64();
                assert!(delay >= 0.0 && delay <= bound + 1e-9);
            }
        }
    }
}
