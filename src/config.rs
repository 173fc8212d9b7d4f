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

//! Orchestrator-wide configuration: retry/breaker/cache/timeout defaults,
//! provider priority, and the ambient toggles (alerting, simplified
//! fallback).

use std::collections::HashMap;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;

/// Credentials and model selection for one backend. `None` for a field means
/// "read from the matching environment variable at startup" — the
/// orchestrator itself never reads environment variables; that's the
/// caller's job when building a `BackendConfig`.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub api_key: String,
    pub model: String,
    pub region: Option<String>,
    pub timeout: Option<TimeoutConfig>,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            model: model.into(),
            region: None,
            timeout: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Top-level configuration for a `FallbackOrchestrator`.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub backends: Vec<BackendConfig>,
    pub provider_priority: Vec<String>,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub request_timeout: Duration,
    pub cache_max_size: usize,
    pub cache_ttl: Duration,
    pub default_criteria_profile: String,
    pub simplified_fallback_enabled: bool,
    pub alerting_enabled: bool,
    pub health_sweep_interval: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            provider_priority: vec!["anthropic".to_string(), "openai".to_string(), "bedrock".to_string()],
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            request_timeout: Duration::from_secs(30),
            cache_max_size: 1000,
            cache_ttl: Duration::from_secs(3600),
            default_criteria_profile: "balanced".to_string(),
            simplified_fallback_enabled: true,
            alerting_enabled: false,
            health_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl JudgeConfig {
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn with_provider_priority(mut self, priority: Vec<String>) -> Self {
        self.provider_priority = priority;
        self
    }

    /// Per-backend timeout overrides, keyed by backend name, built once at
    /// orchestrator construction.
    pub fn timeout_overrides(&self) -> HashMap<String, TimeoutConfig> {
        self.backends
            .iter()
            .filter_map(|b| b.timeout.clone().map(|t| (b.name.clone(), t)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_provider_priority_is_anthropic_openai_bedrock() {
        let config = JudgeConfig::default();
        assert_eq!(config.provider_priority, vec!["anthropic", "openai", "bedrock"]);
    }

    #[test]
    fn timeout_overrides_only_include_backends_with_explicit_timeouts() {
        let config = JudgeConfig::default()
            .with_backend(BackendConfig::new("anthropic", "key", "model"))
            .with_backend(
                BackendConfig::new("openai", "key", "model")
                    .with_timeout(TimeoutConfig::new(Duration::from_secs(5), Duration::from_secs(2))),
            );
        let overrides = config.timeout_overrides();
        assert_eq!(overrides.len(), 1);
        assert!(overrides.contains_key("openai"));
    }
}
