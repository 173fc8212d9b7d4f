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

//! Per-backend circuit breaker: closed / open / half-open.

use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    half_open_successes: u32,
    last_failure_time: Option<Instant>,
}

/// A per-backend circuit breaker. `Closed` is normal operation; `Open`
/// rejects calls outright; `HalfOpen` permits a bounded number of probes.
///
/// Opening is gated by error category: only `{server, timeout, transient}`
/// failures count toward the failure threshold. Rate-limit failures instead
/// decrement the counter so sustained throttling doesn't trip the breaker.
pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    config: CircuitBreakerConfig,
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                half_open_successes: 0,
                last_failure_time: None,
            }),
            config,
            name: name.into(),
        }
    }

    /// `Allow() -> bool`. True in closed and half-open; in open, flips to
    /// half-open once the recovery timeout has elapsed and returns true.
    pub async fn allow(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed_enough = inner
                    .last_failure_time
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed_enough {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    debug!(backend = %self.name, "circuit breaker probing (half-open)");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// `RecordSuccess`. In half-open, counts toward `success_threshold`
    /// consecutive successes before closing; in closed, decrements
    /// `failure_count` by one (floored at zero) to reward sustained success.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold.max(1) {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_successes = 0;
                    info!(backend = %self.name, "circuit breaker closed, service recovered");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// `RecordFailure(category)`. Only categories that gate opening advance
    /// the failure counter toward the threshold; a rate-limit failure
    /// instead decrements it. Any failure observed while half-open reopens
    /// the breaker immediately.
    pub async fn record_failure(&self, category: ErrorCategory) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => {
                if category.opens_breaker() {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.config.failure_threshold {
                        inner.state = BreakerState::Open;
                        inner.last_failure_time = Some(Instant::now());
                        warn!(
                            backend = %self.name,
                            failures = inner.failure_count,
                            "circuit breaker opened"
                        );
                    }
                } else if category == ErrorCategory::RateLimit {
                    inner.failure_count = inner.failure_count.saturating_sub(1);
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_failure_time = Some(Instant::now());
                inner.half_open_successes = 0;
                warn!(backend = %self.name, "circuit breaker re-opened during half-open probe");
            }
            BreakerState::Open => {
                inner.last_failure_time = Some(Instant::now());
            }
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.read().await.failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, recovery_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
            success_threshold: 1,
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_of_gating_categories() {
        let breaker = CircuitBreaker::new("test", config(3, Duration::from_secs(30)));
        breaker.record_failure(ErrorCategory::System).await;
        breaker.record_failure(ErrorCategory::System).await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
        breaker.record_failure(ErrorCategory::System).await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        assert!(!breaker.allow().await);
    }

    #[tokio::test]
    async fn rate_limit_does_not_open_breaker() {
        let breaker = CircuitBreaker::new("test", config(2, Duration::from_secs(30)));
        breaker.record_failure(ErrorCategory::RateLimit).await;
        breaker.record_failure(ErrorCategory::RateLimit).await;
        breaker.record_failure(ErrorCategory::RateLimit).await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn recovers_after_timeout_and_closes_on_success() {
        let breaker = CircuitBreaker::new("test", config(1, Duration::from_millis(10)));
        breaker.record_failure(ErrorCategory::Timeout).await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow().await);
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new("test", config(1, Duration::from_millis(10)));
        breaker.record_failure(ErrorCategory::Transient).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow().await);

        breaker.record_failure(ErrorCategory::Transient).await;
        assert_eq!(breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn closed_state_success_decrements_failure_count() {
        let breaker = CircuitBreaker::new("test", config(5, Duration::from_secs(30)));
        breaker.record_failure(ErrorCategory::System).await;
        breaker.record_failure(ErrorCategory::System).await;
        assert_eq!(breaker.failure_count().await, 2);
        breaker.record_success().await;
        assert_eq!(breaker.failure_count().await, 1);
    }
}
