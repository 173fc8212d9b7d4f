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

//! Per-backend health tracking: success rate, consecutive failures, latency
//! EMA, and the derived healthy/degraded/unavailable/maintenance status.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Unavailable,
    Maintenance,
}

#[derive(Debug, Clone)]
struct HealthRecord {
    status: ProviderStatus,
    total_requests: u64,
    failed_requests: u64,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    avg_response_time: Option<Duration>,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            status: ProviderStatus::Healthy,
            total_requests: 0,
            failed_requests: 0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            avg_response_time: None,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            (self.total_requests - self.failed_requests) as f64 / self.total_requests as f64
        }
    }

    fn derive_status(&mut self) {
        if self.status == ProviderStatus::Maintenance {
            return;
        }
        if self.consecutive_failures >= 5 {
            self.status = ProviderStatus::Unavailable;
        } else if self.consecutive_failures >= 3 || self.success_rate() < 0.5 {
            self.status = ProviderStatus::Degraded;
        } else if self.success_rate() >= 0.9 && self.consecutive_failures == 0 {
            self.status = ProviderStatus::Healthy;
        }
        // otherwise status is retained, per spec.
    }
}

/// A point-in-time, serializable snapshot of one backend's health, exposed
/// through `GetSystemStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthSnapshot {
    pub status: ProviderStatus,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub avg_response_time_ms: Option<f64>,
}

/// Tracks every registered backend's health and runs the background sweep
/// that marks long-idle backends unavailable.
pub struct HealthMonitor {
    records: DashMap<String, RwLock<HealthRecord>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn register(&self, backend: &str) {
        self.records
            .entry(backend.to_string())
            .or_insert_with(|| RwLock::new(HealthRecord::new()));
    }

    pub async fn record_success(&self, backend: &str, latency: Duration) {
        self.register(backend);
        let entry = self.records.get(backend).expect("just registered");
        let mut record = entry.write().await;
        record.last_success = Some(Instant::now());
        record.consecutive_failures = 0;
        record.total_requests += 1;
        record.avg_response_time = Some(match record.avg_response_time {
            None => latency,
            Some(old) => Duration::from_secs_f64(0.8 * old.as_secs_f64() + 0.2 * latency.as_secs_f64()),
        });
        record.derive_status();
    }

    pub async fn record_failure(&self, backend: &str) {
        self.register(backend);
        let entry = self.records.get(backend).expect("just registered");
        let mut record = entry.write().await;
        record.last_failure = Some(Instant::now());
        record.consecutive_failures += 1;
        record.failed_requests += 1;
        record.total_requests += 1;
        let previous = record.status;
        record.derive_status();
        if record.status == ProviderStatus::Unavailable && previous != ProviderStatus::Unavailable {
            warn!(backend, "backend transitioned to unavailable");
        }
    }

    pub async fn status(&self, backend: &str) -> Option<ProviderStatus> {
        let entry = self.records.get(backend)?;
        Some(entry.read().await.status)
    }

    pub async fn set_maintenance(&self, backend: &str, enabled: bool) {
        self.register(backend);
        let entry = self.records.get(backend).expect("just registered");
        let mut record = entry.write().await;
        record.status = if enabled {
            ProviderStatus::Maintenance
        } else {
            ProviderStatus::Healthy
        };
    }

    /// Backends whose status is healthy or degraded, in registration order
    /// is not guaranteed — callers reorder by configured priority.
    pub async fn available(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entry in self.records.iter() {
            let status = entry.value().read().await.status;
            if matches!(status, ProviderStatus::Healthy | ProviderStatus::Degraded) {
                out.push(entry.key().clone());
            }
        }
        out
    }

    pub async fn healthy(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entry in self.records.iter() {
            if entry.value().read().await.status == ProviderStatus::Healthy {
                out.push(entry.key().clone());
            }
        }
        out
    }

    pub async fn snapshot(&self, backend: &str) -> Option<ProviderHealthSnapshot> {
        let entry = self.records.get(backend)?;
        let record = entry.read().await;
        Some(ProviderHealthSnapshot {
            status: record.status,
            total_requests: record.total_requests,
            failed_requests: record.failed_requests,
            consecutive_failures: record.consecutive_failures,
            success_rate: record.success_rate(),
            avg_response_time_ms: record.avg_response_time.map(|d| d.as_secs_f64() * 1000.0),
        })
    }

    pub async fn all_snapshots(&self) -> Vec<(String, ProviderHealthSnapshot)> {
        let mut out = Vec::new();
        for entry in self.records.iter() {
            let record = entry.value().read().await;
            out.push((
                entry.key().clone(),
                ProviderHealthSnapshot {
                    status: record.status,
                    total_requests: record.total_requests,
                    failed_requests: record.failed_requests,
                    consecutive_failures: record.consecutive_failures,
                    success_rate: record.success_rate(),
                    avg_response_time_ms: record.avg_response_time.map(|d| d.as_secs_f64() * 1000.0),
                },
            ));
        }
        out
    }

    /// One sweep: any non-maintenance backend idle (no success or failure)
    /// for longer than the idle timeout is marked unavailable. Advisory: a
    /// subsequently successful in-flight call flips status back on its next
    /// `record_success`.
    pub async fn sweep(&self) {
        for entry in self.records.iter() {
            let mut record = entry.value().write().await;
            if record.status == ProviderStatus::Maintenance {
                continue;
            }
            let last_activity = match (record.last_success, record.last_failure) {
                (Some(s), Some(f)) => Some(s.max(f)),
                (Some(s), None) => Some(s),
                (None, Some(f)) => Some(f),
                (None, None) => None,
            };
            if let Some(last) = last_activity {
                if last.elapsed() > IDLE_TIMEOUT {
                    record.status = ProviderStatus::Unavailable;
                }
            }
        }
    }

    /// Spawns the periodic background sweep task (default interval 60s).
    /// The returned handle should be aborted by `Close()`.
    pub fn spawn_sweep(self: std::sync::Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
                info!("health monitor sweep completed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthy_by_default() {
        let monitor = HealthMonitor::new();
        monitor.register("anthropic");
        assert_eq!(monitor.status("anthropic").await, Some(ProviderStatus::Healthy));
    }

    #[tokio::test]
    async fn unavailable_after_five_consecutive_failures() {
        let monitor = HealthMonitor::new();
        for _ in 0..5 {
            monitor.record_failure("anthropic").await;
        }
        assert_eq!(monitor.status("anthropic").await, Some(ProviderStatus::Unavailable));
    }

    #[tokio::test]
    async fn degraded_after_three_consecutive_failures() {
        let monitor = HealthMonitor::new();
        for _ in 0..3 {
            monitor.record_failure("anthropic").await;
        }
        assert_eq!(monitor.status("anthropic").await, Some(ProviderStatus::Degraded));
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures_and_status() {
        let monitor = HealthMonitor::new();
        for _ in 0..3 {
            monitor.record_failure("anthropic").await;
        }
        monitor.record_success("anthropic", Duration::from_millis(50)).await;
        let snapshot = monitor.snapshot("anthropic").await.unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn invariant_success_rate_bounds_and_failed_le_total() {
        let monitor = HealthMonitor::new();
        monitor.record_success("anthropic", Duration::from_millis(10)).await;
        monitor.record_failure("anthropic").await;
        monitor.record_failure("anthropic").await;
        let snapshot = monitor.snapshot("anthropic").await.unwrap();
        assert!(snapshot.success_rate >= 0.0 && snapshot.success_rate <= 1.0);
        assert!(snapshot.failed_requests <= snapshot.total_requests);
    }

    #[tokio::test]
    async fn maintenance_status_is_sticky_until_explicitly_cleared() {
        let monitor = HealthMonitor::new();
        monitor.set_maintenance("anthropic", true).await;
        monitor.record_failure("anthropic").await;
        assert_eq!(monitor.status("anthropic").await, Some(ProviderStatus::Maintenance));
    }

    #[tokio::test]
    async fn available_includes_healthy_and_degraded_not_unavailable() {
        let monitor = HealthMonitor::new();
        monitor.register("a");
        for _ in 0..3 {
            monitor.record_failure("b").await;
        }
        for _ in 0..5 {
            monitor.record_failure("c").await;
        }
        let mut available = monitor.available().await;
        available.sort();
        assert_eq!(available, vec!["a".to_string(), "b".to_string()]);
    }
}
