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

//! # Resilient LLM-as-Judge Evaluation Pipeline
//!
//! The execution pipeline that sits between an evaluation intent and three
//! external judge backends (Anthropic, OpenAI, Bedrock). This crate does
//! not call a backend directly on the caller's behalf and walk away if it
//! fails — it owns provider failover, per-backend retry with category-aware
//! backoff, a circuit breaker, request timeouts, health monitoring, a
//! fingerprinted response cache, and the parsing/aggregation layer that
//! turns a judge model's free-form text into a validated, weighted verdict.
//!
//! ## What this crate does *not* do
//!
//! Configuration loading from environment or files, CLI plumbing, log
//! formatting policy, and persisted evaluation history all live in a
//! downstream binary. This crate accepts an already-built [`JudgeConfig`]
//! and emits structured `tracing` events; it never reads the environment
//! or a file itself.
//!
//! ## Example
//!
//! ```rust,ignore
//! use resilient_judge::{JudgeConfig, FallbackOrchestrator};
//! use resilient_judge::backend::{Backend, MockBackend};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let backends: Vec<Arc<dyn Backend>> = vec![Arc::new(MockBackend::new("anthropic"))];
//!     let orchestrator = FallbackOrchestrator::new(JudgeConfig::default(), backends).unwrap();
//!
//!     let result = orchestrator
//!         .evaluate_response("What is AI?", "AI is a field of computer science.", None)
//!         .await
//!         .unwrap();
//!     println!("{:?}", result.content);
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod criteria;
pub mod error;
pub mod health;
pub mod multi_criteria;
pub mod orchestrator;
pub mod retry;
pub mod timeout;

pub use backend::{Backend, BackendError, ComparisonVerdict, EvaluationVerdict, MockBackend, Winner};
pub use cache::{CacheKey, CacheStats, ResponseCache};
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use config::{BackendConfig, JudgeConfig};
pub use criteria::{CriteriaError, CriterionDefinition, EvaluationCriteria};
pub use error::{ErrorCategory, ErrorClassification, ErrorClassifier, ErrorHandler, JudgeError, Severity};
pub use health::{ProviderHealthSnapshot, ProviderStatus, HealthMonitor};
pub use multi_criteria::{AggregatedScore, CriterionScore, MultiCriteriaEngine, MultiCriteriaResult, ScoreError};
pub use orchestrator::{FallbackOrchestrator, FallbackResponse, ResponseMetadata, ServiceMode};
pub use retry::{RetryConfig, RetryEngine, RetryOutcome, RetryPolicy};
pub use timeout::{TimeoutConfig, TimeoutManager, TimeoutResult, TimeoutType};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn public_api_evaluates_against_a_mock_backend() {
        let backends: Vec<Arc<dyn Backend>> = vec![Arc::new(MockBackend::new("anthropic"))];
        let orchestrator = FallbackOrchestrator::new(JudgeConfig::default(), backends).unwrap();

        let result = orchestrator
            .evaluate_response("What is AI?", "AI is a field of computer science.", None)
            .await
            .unwrap();

        assert_eq!(result.mode, ServiceMode::Full);
        assert!((0.0..=5.0).contains(&result.content.score));
    }

    #[tokio::test]
    async fn public_api_rejects_mismatched_comparison_prompts() {
        let backends: Vec<Arc<dyn Backend>> = vec![Arc::new(MockBackend::new("anthropic"))];
        let orchestrator = FallbackOrchestrator::new(JudgeConfig::default(), backends).unwrap();

        let err = orchestrator
            .compare_responses("prompt one", "prompt two", "a", "b", None)
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::MismatchedPrompts));
    }
}
