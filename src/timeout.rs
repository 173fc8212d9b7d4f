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

//! Wall-clock deadlines and cooperative cancellation for backend calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutType {
    Request,
    Connect,
    Read,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub cancellation_grace_period: Duration,
}

impl TimeoutConfig {
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            request_timeout,
            connect_timeout,
            read_timeout: None,
            cancellation_grace_period: Duration::from_secs(2),
        }
    }

    /// General fallback used for backends without a dedicated entry in the
    /// configuration, matching the default `connect_timeout` the reference
    /// design falls back to for unrecognized providers.
    pub fn general_default(request_timeout: Duration) -> Self {
        Self::new(request_timeout, Duration::from_secs(10))
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.cancellation_grace_period = grace_period;
        self
    }
}

/// `{success, value?, error?, timeoutType?, duration, wasCancelled}`.
#[derive(Debug)]
pub struct TimeoutResult<T> {
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<String>,
    pub timeout_type: Option<TimeoutType>,
    pub duration: Duration,
    pub was_cancelled: bool,
}

impl<T> TimeoutResult<T> {
    fn ok(value: T, duration: Duration) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
            timeout_type: None,
            duration,
            was_cancelled: false,
        }
    }

    fn timed_out(duration: Duration, was_cancelled: bool) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(format!("operation timed out after {:.2}s", duration.as_secs_f64())),
            timeout_type: Some(TimeoutType::Request),
            duration,
            was_cancelled,
        }
    }

    fn failed(error: String, duration: Duration) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error),
            timeout_type: None,
            duration,
            was_cancelled: false,
        }
    }
}

/// Tracks in-flight operations by a monotonically increasing id so that
/// `cancel_all` (process shutdown) can reap every live operation.
pub struct TimeoutManager {
    provider_name: String,
    active: DashMap<u64, Instant>,
    counter: AtomicU64,
}

impl TimeoutManager {
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            active: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Runs `op` under `config.request_timeout`. On deadline expiry the
    /// manager waits up to `config.cancellation_grace_period` for the
    /// future to actually stop (i.e. for the cancelled task to be dropped
    /// and its resources reclaimed) before reporting a forceful timeout.
    pub async fn execute_with_timeout<F, Fut, T>(
        &self,
        operation_name: &str,
        config: &TimeoutConfig,
        op: F,
    ) -> TimeoutResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        let operation_id = self.counter.fetch_add(1, Ordering::Relaxed);
        self.active.insert(operation_id, Instant::now());
        let start = Instant::now();

        debug!(
            provider = %self.provider_name,
            operation = operation_name,
            timeout_secs = config.request_timeout.as_secs_f64(),
            "starting operation"
        );

        let fut = op();
        let result = tokio::time::timeout(config.request_timeout, fut).await;
        let duration = start.elapsed();
        self.active.remove(&operation_id);

        match result {
            Ok(Ok(value)) => {
                debug!(
                    provider = %self.provider_name,
                    operation = operation_name,
                    duration_secs = duration.as_secs_f64(),
                    "operation completed"
                );
                TimeoutResult::ok(value, duration)
            }
            Ok(Err(error)) => {
                warn!(provider = %self.provider_name, operation = operation_name, %error, "operation failed");
                TimeoutResult::failed(error, duration)
            }
            Err(_elapsed) => {
                warn!(
                    provider = %self.provider_name,
                    operation = operation_name,
                    duration_secs = duration.as_secs_f64(),
                    "operation timed out"
                );
                // tokio::time::timeout already dropped the future; the grace
                // period below models waiting for downstream cleanup (e.g.
                // an in-flight HTTP body drain) to acknowledge cancellation
                // before we report it forceful.
                tokio::time::sleep(config.cancellation_grace_period).await;
                TimeoutResult::timed_out(duration, true)
            }
        }
    }

    /// Cancels every tracked in-flight operation. Used by `Close()` to drain
    /// before releasing backend clients.
    pub fn cancel_all(&self) -> usize {
        let count = self.active.len();
        if count > 0 {
            warn!(provider = %self.provider_name, count, "cancelling active operations");
        }
        self.active.clear();
        count
    }

    pub fn active_operations(&self) -> usize {
        self.active.len()
    }
}

/// Per-backend timeout configuration, built once at Orchestrator
/// construction from `{<backend>RequestTimeout, <backend>ConnectTimeout}`,
/// falling back to a general default for unrecognized backend names.
pub fn provider_timeout_config(
    backend_name: &str,
    overrides: &HashMap<String, TimeoutConfig>,
    default_request_timeout: Duration,
) -> TimeoutConfig {
    overrides
        .get(backend_name)
        .cloned()
        .unwrap_or_else(|| TimeoutConfig::general_default(default_request_timeout))
}
