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

//! The fallback orchestrator: composes the circuit breaker, retry engine,
//! timeout manager, health monitor and response cache into the provider
//! failover cascade a caller actually invokes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{Backend, ComparisonVerdict, EvaluationVerdict, Winner};
use crate::cache::{criteria_fingerprint, CacheKey, ResponseCache};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::JudgeConfig;
use crate::criteria::{self, EvaluationCriteria};
use crate::error::{ErrorClassifier, ErrorHandler, JudgeError};
use crate::health::HealthMonitor;
use crate::multi_criteria::MultiCriteriaResult;
use crate::retry::{RetryEngine, RetryOutcome};
use crate::timeout::{provider_timeout_config, TimeoutManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    Full,
    Degraded,
    Fallback,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub attempts: u32,
}

/// The outcome of `evaluate_response`/`compare_responses`: `content` is the
/// backend-specific payload (caller downcasts via the accompanying verdict
/// fields), always accompanied by the service mode and provenance the
/// caller needs to decide how much to trust it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackResponse<T> {
    pub content: T,
    pub mode: ServiceMode,
    pub provider_used: Option<String>,
    pub is_cached: bool,
    pub is_simplified: bool,
    pub confidence: f64,
    pub metadata: ResponseMetadata,
}

struct BackendEntry {
    backend: Arc<dyn Backend>,
    breaker: CircuitBreaker,
    timeout_manager: TimeoutManager,
    timeout_config: crate::timeout::TimeoutConfig,
}

/// Owns one registered backend per provider plus the shared resilience
/// infrastructure (health, cache, error classification) all of them run
/// through. Cloning an `Arc<FallbackOrchestrator>` is the intended way to
/// share it across tasks.
pub struct FallbackOrchestrator {
    backends: HashMap<String, BackendEntry>,
    provider_priority: Vec<String>,
    health: Arc<HealthMonitor>,
    eval_cache: ResponseCache<EvaluationVerdict>,
    compare_cache: ResponseCache<ComparisonVerdict>,
    multi_criteria_cache: ResponseCache<MultiCriteriaResult>,
    retry_engine: RetryEngine,
    error_handler: Arc<ErrorHandler>,
    simplified_fallback_enabled: bool,
    sweep_handle: Option<tokio::task::JoinHandle<()>>,
}

impl FallbackOrchestrator {
    pub fn new(config: JudgeConfig, backends: Vec<Arc<dyn Backend>>) -> Result<Self, JudgeError> {
        if backends.is_empty() {
            return Err(JudgeError::NoBackendConfigured);
        }

        let health = Arc::new(HealthMonitor::new());
        let overrides = config.timeout_overrides();
        let mut entries = HashMap::new();
        for backend in backends {
            let name = backend.name().to_string();
            health.register(&name);
            let timeout_config = provider_timeout_config(&name, &overrides, config.request_timeout);
            entries.insert(
                name.clone(),
                BackendEntry {
                    backend,
                    breaker: CircuitBreaker::new(name.clone(), config.circuit_breaker.clone()),
                    timeout_manager: TimeoutManager::new(name),
                    timeout_config,
                },
            );
        }

        let classifier = Arc::new(ErrorClassifier::new());
        let handler = Arc::new(ErrorHandler::new(config.alerting_enabled));
        let retry_engine = RetryEngine::new(config.retry.clone(), Arc::clone(&classifier), Arc::clone(&handler));

        let sweep_handle = Some(Arc::clone(&health).spawn_sweep(config.health_sweep_interval));

        Ok(Self {
            backends: entries,
            provider_priority: config.provider_priority,
            health,
            eval_cache: ResponseCache::new(config.cache_max_size, config.cache_ttl),
            compare_cache: ResponseCache::new(config.cache_max_size, config.cache_ttl),
            multi_criteria_cache: ResponseCache::new(config.cache_max_size, config.cache_ttl),
            retry_engine,
            error_handler: handler,
            simplified_fallback_enabled: config.simplified_fallback_enabled,
            sweep_handle,
        })
    }

    /// Provider order for one call: backends reporting healthy/degraded,
    /// ordered by configured priority (falling back to every configured
    /// backend if the health monitor currently reports none available),
    /// with `preferred` moved to the front when present and usable.
    async fn provider_order(&self, preferred: Option<&str>) -> Vec<String> {
        let available = self.health.available().await;
        let candidates: Vec<String> = if available.is_empty() {
            self.backends.keys().cloned().collect()
        } else {
            available
        };

        let mut ordered: Vec<String> = self
            .provider_priority
            .iter()
            .filter(|name| candidates.contains(name))
            .cloned()
            .collect();
        for name in &candidates {
            if !ordered.contains(name) {
                ordered.push(name.clone());
            }
        }

        if let Some(preferred) = preferred {
            if let Some(pos) = ordered.iter().position(|n| n == preferred) {
                let entry = ordered.remove(pos);
                ordered.insert(0, entry);
            }
        }
        ordered
    }

    async fn determine_mode(&self) -> ServiceMode {
        let healthy = self.health.healthy().await;
        let available = self.health.available().await;
        if !available.is_empty() && healthy.len() == self.backends.len() {
            ServiceMode::Full
        } else if !available.is_empty() {
            ServiceMode::Degraded
        } else {
            ServiceMode::Fallback
        }
    }

    /// Runs `call` against the named provider's backend through the retry/
    /// timeout/breaker stack. The ordinal position of `provider` within the
    /// failover order is the caller's concern, not this method's — it only
    /// reports whether this single provider produced a value.
    async fn run_on<T, F, Fut>(&self, provider: &str, operation: &str, call: F) -> Option<T>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::backend::BackendError>>,
    {
        let entry = self.backends.get(provider)?;
        let start = Instant::now();
        let call = &call;

        let outcome = self
            .retry_engine
            .execute(provider, operation, &entry.breaker, || async {
                let backend = Arc::clone(&entry.backend);
                let timeout_result = entry
                    .timeout_manager
                    .execute_with_timeout(operation, &entry.timeout_config, || async {
                        call(backend).await.map_err(|e| e.to_string())
                    })
                    .await;
                if timeout_result.success {
                    Ok(timeout_result.value.expect("success carries a value"))
                } else {
                    Err(timeout_result.error.unwrap_or_else(|| "operation failed".to_string()))
                }
            })
            .await;

        match outcome {
            RetryOutcome::Success(value) => {
                self.health.record_success(provider, start.elapsed()).await;
                Some(value)
            }
            RetryOutcome::Exhausted(message) => {
                warn!(provider, operation, message, "provider exhausted retries");
                self.health.record_failure(provider).await;
                None
            }
            RetryOutcome::CircuitOpen => {
                info!(provider, operation, "circuit open, skipping provider");
                None
            }
        }
    }

    /// Single-score evaluation with provider failover, caching, and the
    /// simplified/fallback/maintenance cascade for a total outage.
    pub async fn evaluate_response(
        &self,
        prompt: &str,
        response: &str,
        preferred: Option<&str>,
    ) -> Result<FallbackResponse<EvaluationVerdict>, JudgeError> {
        let key = CacheKey::compute(prompt, "evaluate", "none");
        let order = self.provider_order(preferred).await;

        for (index, provider) in order.iter().enumerate() {
            if let Some(verdict) = self
                .run_on(provider, "evaluate", |backend| {
                    let prompt = prompt.to_string();
                    let response = response.to_string();
                    async move { backend.evaluate(&prompt, &response).await }
                })
                .await
            {
                self.eval_cache.put(key.clone(), verdict.clone());
                return Ok(FallbackResponse {
                    content: verdict,
                    mode: self.determine_mode().await,
                    provider_used: Some(provider.clone()),
                    is_cached: false,
                    is_simplified: false,
                    confidence: 1.0,
                    metadata: ResponseMetadata { attempts: (index + 1) as u32 },
                });
            }
        }

        if let Some(cached) = self.eval_cache.get(&key) {
            return Ok(FallbackResponse {
                content: cached,
                mode: ServiceMode::Fallback,
                provider_used: None,
                is_cached: true,
                is_simplified: false,
                confidence: 0.7,
                metadata: ResponseMetadata { attempts: 0 },
            });
        }

        if self.simplified_fallback_enabled {
            return Ok(FallbackResponse {
                content: EvaluationVerdict {
                    score: 3.0,
                    reasoning: "Service temporarily unavailable".to_string(),
                    confidence: 0.5,
                },
                mode: ServiceMode::Fallback,
                provider_used: None,
                is_cached: false,
                is_simplified: true,
                confidence: 0.5,
                metadata: ResponseMetadata { attempts: 0 },
            });
        }

        Err(JudgeError::ServiceUnavailable {
            classification: self.error_handler.classify("all providers exhausted", None),
        })
    }

    /// Compares two responses to the *same* prompt. The prompt-match check
    /// runs before any backend is touched — a mismatch is a caller error,
    /// not a backend failure, so it never counts against health or the
    /// circuit breaker and is never retried.
    pub async fn compare_responses(
        &self,
        prompt_a: &str,
        prompt_b: &str,
        response_a: &str,
        response_b: &str,
        preferred: Option<&str>,
    ) -> Result<FallbackResponse<ComparisonVerdict>, JudgeError> {
        if prompt_a.trim() != prompt_b.trim() {
            return Err(JudgeError::MismatchedPrompts);
        }
        let prompt = prompt_a;

        let key = CacheKey::compute(&format!("{response_a}\u{0}{response_b}"), "compare", prompt);
        let order = self.provider_order(preferred).await;

        for (index, provider) in order.iter().enumerate() {
            if let Some(verdict) = self
                .run_on(provider, "compare", |backend| {
                    let prompt = prompt.to_string();
                    let response_a = response_a.to_string();
                    let response_b = response_b.to_string();
                    async move { backend.compare(&prompt, &response_a, &response_b).await }
                })
                .await
            {
                self.compare_cache.put(key.clone(), verdict.clone());
                return Ok(FallbackResponse {
                    content: verdict,
                    mode: self.determine_mode().await,
                    provider_used: Some(provider.clone()),
                    is_cached: false,
                    is_simplified: false,
                    confidence: 1.0,
                    metadata: ResponseMetadata { attempts: (index + 1) as u32 },
                });
            }
        }

        if let Some(cached) = self.compare_cache.get(&key) {
            return Ok(FallbackResponse {
                content: cached,
                mode: ServiceMode::Fallback,
                provider_used: None,
                is_cached: true,
                is_simplified: false,
                confidence: 0.7,
                metadata: ResponseMetadata { attempts: 0 },
            });
        }

        if self.simplified_fallback_enabled {
            return Ok(FallbackResponse {
                content: ComparisonVerdict {
                    winner: Winner::Tie,
                    reasoning: "Service temporarily unavailable".to_string(),
                    confidence: 0.3,
                },
                mode: ServiceMode::Fallback,
                provider_used: None,
                is_cached: false,
                is_simplified: true,
                confidence: 0.3,
                metadata: ResponseMetadata { attempts: 0 },
            });
        }

        Err(JudgeError::ServiceUnavailable {
            classification: self.error_handler.classify("all providers exhausted", None),
        })
    }

    /// Multi-criteria evaluation against a named built-in profile
    /// (`balanced`, `basic`, `technical`, `creative`; unrecognized names fall
    /// back to `balanced`, per `criteria::by_name`).
    pub async fn evaluate_multi_criteria(
        &self,
        prompt: &str,
        response: &str,
        criteria_profile: Option<&str>,
        preferred: Option<&str>,
    ) -> Result<FallbackResponse<MultiCriteriaResult>, JudgeError> {
        let criteria = criteria::by_name(criteria_profile.unwrap_or("balanced"));
        self.evaluate_with_criteria(prompt, response, criteria, preferred).await
    }

    /// Multi-criteria evaluation against a custom profile document (see
    /// `EvaluationCriteria::from_json`). Parsing errors are surfaced to the
    /// caller as `JudgeError::InvalidCriteria`, never silently swallowed.
    pub async fn evaluate_multi_criteria_from_json(
        &self,
        prompt: &str,
        response: &str,
        criteria_document: &str,
        preferred: Option<&str>,
    ) -> Result<FallbackResponse<MultiCriteriaResult>, JudgeError> {
        let criteria = EvaluationCriteria::from_json(criteria_document)
            .map_err(|e| JudgeError::InvalidCriteria(e.to_string()))?;
        self.evaluate_with_criteria(prompt, response, criteria, preferred).await
    }

    /// Multi-criteria evaluation, following the same failover/cache/fallback
    /// cascade as `evaluate_response` but with no simplified-response path
    /// (a neutral per-criterion fallback is what the multi-criteria parser
    /// itself already produces on extraction failure; synthesizing a second,
    /// different one here would just be redundant).
    async fn evaluate_with_criteria(
        &self,
        prompt: &str,
        response: &str,
        criteria: EvaluationCriteria,
        preferred: Option<&str>,
    ) -> Result<FallbackResponse<MultiCriteriaResult>, JudgeError> {
        let fingerprint = criteria_fingerprint(
            &criteria
                .criteria
                .iter()
                .map(|c| (c.name.clone(), c.weight, c.scale_min, c.scale_max))
                .collect::<Vec<_>>(),
        );
        let key = CacheKey::compute(prompt, "multiCriteria", &fingerprint);
        let order = self.provider_order(preferred).await;

        for (index, provider) in order.iter().enumerate() {
            let criteria_ref = &criteria;
            if let Some(result) = self
                .run_on(provider, "evaluate_multi_criteria", |backend| {
                    let prompt = prompt.to_string();
                    let response = response.to_string();
                    let criteria = criteria_ref.clone();
                    async move { backend.evaluate_multi_criteria(&prompt, &response, &criteria).await }
                })
                .await
            {
                self.multi_criteria_cache.put(key.clone(), result.clone());
                return Ok(FallbackResponse {
                    content: result,
                    mode: self.determine_mode().await,
                    provider_used: Some(provider.clone()),
                    is_cached: false,
                    is_simplified: false,
                    confidence: 1.0,
                    metadata: ResponseMetadata { attempts: (index + 1) as u32 },
                });
            }
        }

        if let Some(cached) = self.multi_criteria_cache.get(&key) {
            return Ok(FallbackResponse {
                content: cached,
                mode: ServiceMode::Fallback,
                provider_used: None,
                is_cached: true,
                is_simplified: false,
                confidence: 0.7,
                metadata: ResponseMetadata { attempts: 0 },
            });
        }

        Err(JudgeError::ServiceUnavailable {
            classification: self.error_handler.classify("all providers exhausted", None),
        })
    }

    pub async fn get_system_status(&self) -> Vec<(String, crate::health::ProviderHealthSnapshot)> {
        self.health.all_snapshots().await
    }

    pub async fn set_maintenance_mode(&self, backend: &str, enabled: bool) {
        self.health.set_maintenance(backend, enabled).await;
    }

    /// Cancels in-flight operations on every backend and stops the
    /// background health sweep. Idempotent; safe to call more than once.
    pub async fn close(&mut self) {
        for entry in self.backends.values() {
            entry.timeout_manager.cancel_all();
        }
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    fn orchestrator_with_mocks(names: &[&str]) -> FallbackOrchestrator {
        let backends: Vec<Arc<dyn Backend>> = names
            .iter()
            .map(|n| Arc::new(MockBackend::new(*n)) as Arc<dyn Backend>)
            .collect();
        FallbackOrchestrator::new(JudgeConfig::default(), backends).unwrap()
    }

    /// A backend that always fails with an authentication-classified error,
    /// so the retry engine gives up on the first attempt without delay.
    struct AlwaysFailsBackend {
        name: String,
    }

    #[async_trait::async_trait]
    impl Backend for AlwaysFailsBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn evaluate(&self, _prompt: &str, _response: &str) -> Result<EvaluationVerdict, crate::backend::BackendError> {
            Err(crate::backend::BackendError::Api {
                status: 401,
                body: "invalid api key".to_string(),
            })
        }

        async fn compare(
            &self,
            _prompt: &str,
            _response_a: &str,
            _response_b: &str,
        ) -> Result<ComparisonVerdict, crate::backend::BackendError> {
            Err(crate::backend::BackendError::Api {
                status: 401,
                body: "invalid api key".to_string(),
            })
        }

        async fn evaluate_multi_criteria(
            &self,
            _prompt: &str,
            _response: &str,
            _criteria: &EvaluationCriteria,
        ) -> Result<MultiCriteriaResult, crate::backend::BackendError> {
            Err(crate::backend::BackendError::Api {
                status: 401,
                body: "invalid api key".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn evaluate_response_succeeds_against_a_mock_backend() {
        let orchestrator = orchestrator_with_mocks(&["anthropic"]);
        let result = orchestrator.evaluate_response("prompt", "response", None).await.unwrap();
        assert_eq!(result.provider_used.as_deref(), Some("anthropic"));
        assert!(!result.is_cached);
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn compare_responses_rejects_mismatched_prompts() {
        let orchestrator = orchestrator_with_mocks(&["anthropic"]);
        let err = orchestrator
            .compare_responses("prompt a", "prompt b", "resp a", "resp b", None)
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::MismatchedPrompts));
    }

    #[tokio::test]
    async fn compare_responses_succeeds_with_matching_prompts() {
        let orchestrator = orchestrator_with_mocks(&["anthropic"]);
        let result = orchestrator
            .compare_responses("same prompt", "same prompt", "resp a", "resp b", None)
            .await
            .unwrap();
        assert_eq!(result.provider_used.as_deref(), Some("anthropic"));
    }

    #[tokio::test]
    async fn constructing_with_no_backends_fails() {
        let err = FallbackOrchestrator::new(JudgeConfig::default(), Vec::new()).unwrap_err();
        assert!(matches!(err, JudgeError::NoBackendConfigured));
    }

    #[tokio::test]
    async fn failover_to_secondary_reports_attempts_as_its_ordinal_position() {
        let backends: Vec<Arc<dyn Backend>> = vec![
            Arc::new(AlwaysFailsBackend {
                name: "primary".to_string(),
            }),
            Arc::new(MockBackend::new("secondary")),
        ];
        let orchestrator = FallbackOrchestrator::new(JudgeConfig::default(), backends).unwrap();
        let result = orchestrator.evaluate_response("prompt", "response", None).await.unwrap();
        assert_eq!(result.provider_used.as_deref(), Some("secondary"));
        assert_eq!(result.metadata.attempts, 2);
    }

    #[tokio::test]
    async fn preferred_provider_is_tried_first() {
        let orchestrator = orchestrator_with_mocks(&["anthropic", "openai"]);
        let result = orchestrator
            .evaluate_response("prompt", "response", Some("openai"))
            .await
            .unwrap();
        assert_eq!(result.provider_used.as_deref(), Some("openai"));
    }

    #[tokio::test]
    async fn multi_criteria_evaluation_covers_all_requested_criteria() {
        let orchestrator = orchestrator_with_mocks(&["anthropic"]);
        let result = orchestrator
            .evaluate_multi_criteria("prompt", "response", Some("basic"), None)
            .await
            .unwrap();
        assert_eq!(result.content.criterion_scores.len(), 3);
    }

    #[tokio::test]
    async fn set_maintenance_mode_excludes_backend_from_provider_order() {
        let orchestrator = orchestrator_with_mocks(&["anthropic", "openai"]);
        orchestrator.set_maintenance_mode("anthropic", true).await;
        let order = orchestrator.provider_order(None).await;
        assert!(!order.contains(&"anthropic".to_string()));
        assert!(order.contains(&"openai".to_string()));
    }

    #[tokio::test]
    async fn evaluate_multi_criteria_from_json_uses_a_custom_profile() {
        let orchestrator = orchestrator_with_mocks(&["anthropic"]);
        let document = r#"{
            "name": "support-tickets",
            "criteria": [
                {"name": "tone", "description": "tone check", "weight": 0.5},
                {"name": "resolution", "description": "resolution check", "weight": 0.5}
            ]
        }"#;
        let result = orchestrator
            .evaluate_multi_criteria_from_json("prompt", "response", document, None)
            .await
            .unwrap();
        assert_eq!(result.content.criterion_scores.len(), 2);
    }

    #[tokio::test]
    async fn evaluate_multi_criteria_from_json_surfaces_parse_errors() {
        let orchestrator = orchestrator_with_mocks(&["anthropic"]);
        let err = orchestrator
            .evaluate_multi_criteria_from_json("prompt", "response", "not json", None)
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::InvalidCriteria(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut orchestrator = orchestrator_with_mocks(&["anthropic"]);
        orchestrator.close().await;
        orchestrator.close().await;
    }
}
